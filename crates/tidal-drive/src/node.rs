use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidal_crypto::ContentHasher;
use tidal_types::{BlobRef, CoreKey, Digest};

use crate::error::{DriveError, DriveResult};

/// Format version written into every drive header.
pub const DRIVE_VERSION: u32 = 1;

/// First block of a metadata log. Names the blob core holding the drive's
/// large values. A later header supersedes earlier ones.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub blobs_key: CoreKey,
}

/// Value stored for a key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryValue {
    /// Small value kept in the metadata block itself.
    Inline(Bytes),
    /// Large value kept in the blob core.
    Blob { blob: BlobRef, hash: Digest },
}

impl EntryValue {
    /// Wrap inline bytes.
    pub fn inline(data: impl Into<Bytes>) -> Self {
        Self::Inline(data.into())
    }

    /// Size of the value in bytes.
    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(data) => data.len() as u64,
            Self::Blob { blob, .. } => blob.byte_length,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Content digest of the value.
    pub fn digest(&self) -> Digest {
        match self {
            Self::Inline(data) => content_hash(data),
            Self::Blob { hash, .. } => *hash,
        }
    }

    /// Two values hold the same content.
    pub fn same_content(&self, other: &Self) -> bool {
        self.len() == other.len() && self.digest() == other.digest()
    }
}

/// A live key with its value and the metadata position that wrote it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: String,
    pub value: EntryValue,
    pub seq: u64,
}

/// One metadata block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Node {
    Header(Header),
    Put { key: String, value: EntryValue },
    Del { key: String },
    /// JSON-encoded setting; `None` removes it.
    Setting { name: String, value: Option<String> },
}

impl Node {
    pub fn encode(&self) -> DriveResult<Bytes> {
        bincode::serialize(self)
            .map(Bytes::from)
            .map_err(|e| DriveError::Serialization(e.to_string()))
    }

    pub fn decode(index: u64, block: &[u8]) -> DriveResult<Self> {
        bincode::deserialize(block).map_err(|e| DriveError::CorruptNode {
            index,
            reason: e.to_string(),
        })
    }
}

/// Content digest used for entry values.
pub fn content_hash(data: &[u8]) -> Digest {
    ContentHasher::CONTENT.hash(data)
}

/// Canonical form of a key: exactly one leading `/`, no trailing `/`.
pub fn normalize_key(key: &str) -> String {
    let trimmed = key.trim_matches('/');
    let mut out = String::with_capacity(trimmed.len() + 1);
    out.push('/');
    out.push_str(trimmed);
    out
}
