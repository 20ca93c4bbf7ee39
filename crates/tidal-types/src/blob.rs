use serde::{Deserialize, Serialize};

/// Location of one blob inside a blob core.
///
/// A blob occupies `block_count` consecutive blocks starting at
/// `block_index`; `byte_offset` is the core's byte length just before the
/// first of those blocks. Blob cores are append-only, so a `BlobRef` stays
/// valid forever once written.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobRef {
    pub block_index: u64,
    pub block_count: u64,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl BlobRef {
    /// One past the last block of this blob.
    pub fn end_block(&self) -> u64 {
        self.block_index + self.block_count
    }

    /// Returns `true` for a zero-length blob.
    pub fn is_empty(&self) -> bool {
        self.byte_length == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn end_block() {
        let r = BlobRef {
            block_index: 4,
            block_count: 3,
            byte_offset: 100,
            byte_length: 150_000,
        };
        assert_eq!(r.end_block(), 7);
        assert!(!r.is_empty());
    }

    #[test]
    fn default_is_empty() {
        assert!(BlobRef::default().is_empty());
        assert_eq!(BlobRef::default().end_block(), 0);
    }

    #[test]
    fn bincode_roundtrip() {
        let r = BlobRef {
            block_index: 1,
            block_count: 2,
            byte_offset: 3,
            byte_length: 4,
        };
        let bytes = bincode::serialize(&r).unwrap();
        let back: BlobRef = bincode::deserialize(&bytes).unwrap();
        assert_eq!(r, back);
    }
}
