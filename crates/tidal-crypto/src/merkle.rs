use serde::{Deserialize, Serialize};
use tidal_types::Digest;

use crate::hasher::{leaf_hash, parent_hash, ContentHasher};

/// Side of a sibling in a Merkle proof path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Left,
    Right,
}

/// Root of one full subtree. A tree of `n` leaves has one root per set bit
/// of `n`, ordered from the highest level (leftmost leaves) down.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub level: u32,
    pub hash: Digest,
}

impl Root {
    /// Number of leaves covered by this root.
    pub fn span(&self) -> u64 {
        1u64 << self.level
    }
}

/// Append-only binary Merkle tree over log blocks.
///
/// Every appended leaf completes at most one parent per level, so appends are
/// amortized O(1) hash operations and the root list is O(log n). Only full
/// subtrees are ever hashed; an incomplete right edge stays as separate
/// roots instead of being padded.
#[derive(Clone, Debug, Default)]
pub struct MerkleTree {
    /// `levels[0]` holds leaf hashes, `levels[k]` the parents of completed
    /// pairs in `levels[k - 1]`.
    levels: Vec<Vec<Digest>>,
}

impl MerkleTree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a tree from pre-computed leaf hashes.
    pub fn from_leaves(leaves: impl IntoIterator<Item = Digest>) -> Self {
        let mut tree = Self::new();
        for leaf in leaves {
            tree.append_leaf(leaf);
        }
        tree
    }

    /// Number of leaves.
    pub fn len(&self) -> u64 {
        self.levels.first().map_or(0, |l| l.len() as u64)
    }

    /// Returns `true` if no leaves have been appended.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Hash a block and append it as a leaf. Returns the leaf hash.
    pub fn append(&mut self, block: &[u8]) -> Digest {
        let leaf = leaf_hash(block);
        self.append_leaf(leaf);
        leaf
    }

    /// Append a pre-computed leaf hash.
    pub fn append_leaf(&mut self, leaf: Digest) {
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(leaf);

        let mut level = 0;
        while self.levels[level].len() % 2 == 0 {
            let n = self.levels[level].len();
            let parent = parent_hash(&self.levels[level][n - 2], &self.levels[level][n - 1]);
            if self.levels.len() == level + 1 {
                self.levels.push(Vec::new());
            }
            self.levels[level + 1].push(parent);
            level += 1;
        }
    }

    /// Leaf hash at `index`.
    pub fn leaf(&self, index: u64) -> Option<Digest> {
        self.levels.first()?.get(index as usize).copied()
    }

    /// Current roots, highest level first.
    pub fn roots(&self) -> Vec<Root> {
        let mut roots = Vec::new();
        for (level, nodes) in self.levels.iter().enumerate().rev() {
            if nodes.len() % 2 == 1 {
                if let Some(hash) = nodes.last() {
                    roots.push(Root {
                        level: level as u32,
                        hash: *hash,
                    });
                }
            }
        }
        roots
    }

    /// Tree hash over the current roots.
    pub fn tree_hash(&self) -> Digest {
        tree_hash_of(&self.roots())
    }

    /// Generate an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: u64) -> Option<MerkleProof> {
        let leaf = self.leaf(index)?;
        let mut path = Vec::new();
        let mut idx = index as usize;
        let mut level = 0usize;

        loop {
            let parent_exists = self
                .levels
                .get(level + 1)
                .is_some_and(|parents| idx / 2 < parents.len());
            if !parent_exists {
                break;
            }
            let sibling = self.levels[level][idx ^ 1];
            let side = if idx % 2 == 0 { Side::Right } else { Side::Left };
            path.push((sibling, side));
            idx /= 2;
            level += 1;
        }

        Some(MerkleProof { index, leaf, path })
    }
}

/// Tree hash of an ordered root list.
pub fn tree_hash_of(roots: &[Root]) -> Digest {
    let mut parts: Vec<u8> = Vec::with_capacity(roots.len() * 36);
    for root in roots {
        parts.extend_from_slice(&root.level.to_le_bytes());
        parts.extend_from_slice(root.hash.as_bytes());
    }
    ContentHasher::TREE.hash(&parts)
}

/// Number of leaves described by a root list.
pub fn length_of(roots: &[Root]) -> u64 {
    roots.iter().map(Root::span).sum()
}

/// Merkle inclusion proof from one leaf up to the root that covers it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// Index of the proven leaf.
    pub index: u64,
    /// The leaf being proven.
    pub leaf: Digest,
    /// Path of (sibling_hash, sibling_side) pairs from leaf to root.
    pub path: Vec<(Digest, Side)>,
}

impl MerkleProof {
    /// Verify the proof against a root list.
    ///
    /// The recomputed subtree root must equal the root of matching level,
    /// and that root must actually cover `index`.
    pub fn verify(&self, roots: &[Root]) -> bool {
        let mut current = self.leaf;
        for (bit, (sibling, side)) in self.path.iter().enumerate() {
            let is_left_child = (self.index >> bit) & 1 == 0;
            current = match side {
                Side::Right if is_left_child => parent_hash(&current, sibling),
                Side::Left if !is_left_child => parent_hash(sibling, &current),
                _ => return false,
            };
        }

        let level = self.path.len() as u32;
        let mut start = 0u64;
        for root in roots {
            if root.level == level {
                let covers = self.index >= start && self.index < start + root.span();
                return covers && root.hash == current;
            }
            start += root.span();
        }
        false
    }

    /// Verify that `block` is the proven leaf and the proof holds.
    pub fn verify_block(&self, block: &[u8], roots: &[Root]) -> bool {
        leaf_hash(block) == self.leaf && self.verify(roots)
    }
}
