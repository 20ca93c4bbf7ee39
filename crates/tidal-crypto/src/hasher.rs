use tidal_types::Digest;

/// Domain-separated BLAKE3 hasher.
///
/// Each hasher carries a domain tag (e.g., `"tidal-leaf-v1"`) that is
/// prepended to every hash computation, so a leaf and a parent node over
/// identical bytes never collide.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for Merkle leaves (one per log block).
    pub const LEAF: Self = Self {
        domain: "tidal-leaf-v1",
    };
    /// Hasher for Merkle parent nodes.
    pub const PARENT: Self = Self {
        domain: "tidal-parent-v1",
    };
    /// Hasher for the ordered root list (the tree hash).
    pub const TREE: Self = Self {
        domain: "tidal-tree-v1",
    };
    /// Hasher for drive entry content.
    pub const CONTENT: Self = Self {
        domain: "tidal-content-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Digest {
        self.hash_parts(&[data])
    }

    /// Hash several byte slices as one message.
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Digest {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        for part in parts {
            hasher.update(part);
        }
        Digest::from_hash(*hasher.finalize().as_bytes())
    }

    /// Verify that data produces the expected digest.
    pub fn verify(&self, data: &[u8], expected: &Digest) -> bool {
        self.hash(data) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }
}

/// Leaf hash of one log block. The block size is committed alongside the
/// bytes so byte lengths are covered by the tree hash.
pub fn leaf_hash(block: &[u8]) -> Digest {
    let size = (block.len() as u64).to_le_bytes();
    ContentHasher::LEAF.hash_parts(&[&size, block])
}

/// Parent node over two child hashes.
pub fn parent_hash(left: &Digest, right: &Digest) -> Digest {
    ContentHasher::PARENT.hash_parts(&[left.as_bytes(), right.as_bytes()])
}
