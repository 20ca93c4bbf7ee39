//! Explicit write batches.
//!
//! A [`DriveBatch`] stages metadata nodes in memory while holding the drive's
//! write lock. Blob blocks are buffered only up to [`BLOB_SPILL_BLOCKS`] and
//! then appended to the blob core ahead of the commit. [`DriveBatch::flush`]
//! appends any remaining blob blocks first and the metadata nodes second; the
//! metadata append is the commit point. Dropping a batch without flushing
//! discards its metadata. Blob blocks it already spilled stay in the blob
//! core, unreferenced.

use bytes::Bytes;
use serde_json::Value;
use tidal_core::CoreError;
use tidal_types::{BlobRef, Digest};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::blobs::split;
use crate::drive::Drive;
use crate::error::{DriveError, DriveResult};
use crate::node::{content_hash, normalize_key, EntryValue, Header, Node, DRIVE_VERSION};

/// Values shorter than this are stored inline in the metadata log.
pub const INLINE_THRESHOLD: usize = 4 * 1024;

/// Buffered blob blocks that trigger an append to the blob core (4 MiB).
pub const BLOB_SPILL_BLOCKS: usize = 64;

pub struct DriveBatch {
    drive: Drive,
    _guard: OwnedMutexGuard<()>,
    blob_start: u64,
    byte_start: u64,
    /// End of the blob blocks already appended by this batch.
    spilled_end: u64,
    blob_blocks: Vec<Bytes>,
    next_block: u64,
    next_byte: u64,
    nodes: Vec<Node>,
}

impl DriveBatch {
    pub(crate) fn new(drive: Drive, guard: OwnedMutexGuard<()>) -> Self {
        let blob_core = drive.blobs().core();
        let next_block = blob_core.length();
        let next_byte = blob_core.byte_length();
        Self {
            drive,
            _guard: guard,
            blob_start: next_block,
            byte_start: next_byte,
            spilled_end: next_block,
            blob_blocks: Vec::new(),
            next_block,
            next_byte,
            nodes: Vec::new(),
        }
    }

    /// Stage `data` under `key`, inline or as a blob depending on size.
    pub async fn put(&mut self, key: &str, data: impl Into<Bytes>) -> DriveResult<()> {
        let data = data.into();
        let value = if data.len() < INLINE_THRESHOLD {
            EntryValue::Inline(data)
        } else {
            let hash = content_hash(&data);
            let blocks = split(&data);
            let blob = BlobRef {
                block_index: self.next_block,
                block_count: blocks.len() as u64,
                byte_offset: self.next_byte,
                byte_length: data.len() as u64,
            };
            self.next_block += blob.block_count;
            self.next_byte += blob.byte_length;
            self.blob_blocks.extend(blocks);
            EntryValue::Blob { blob, hash }
        };
        self.nodes.push(Node::Put {
            key: normalize_key(key),
            value,
        });
        if self.blob_blocks.len() >= BLOB_SPILL_BLOCKS {
            self.spill().await?;
        }
        Ok(())
    }

    /// Stage an entry pointing at bytes already in this drive's blob core.
    pub fn put_ref(&mut self, key: &str, blob: BlobRef, hash: Digest) {
        self.nodes.push(Node::Put {
            key: normalize_key(key),
            value: EntryValue::Blob { blob, hash },
        });
    }

    /// Stage a tombstone for `key`.
    pub fn del(&mut self, key: &str) {
        self.nodes.push(Node::Del {
            key: normalize_key(key),
        });
    }

    pub fn set_setting(&mut self, name: &str, value: &Value) -> DriveResult<()> {
        let encoded = serde_json::to_string(value).map_err(|e| DriveError::InvalidSetting {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.nodes.push(Node::Setting {
            name: name.to_string(),
            value: Some(encoded),
        });
        Ok(())
    }

    pub fn del_setting(&mut self, name: &str) {
        self.nodes.push(Node::Setting {
            name: name.to_string(),
            value: None,
        });
    }

    /// Number of staged metadata nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Bytes this batch has written or will write to the blob core.
    pub fn staged_blob_bytes(&self) -> u64 {
        self.next_byte - self.byte_start
    }

    /// Blob bytes held in memory, not yet appended.
    pub fn buffered_blob_bytes(&self) -> u64 {
        self.blob_blocks.iter().map(|b| b.len() as u64).sum()
    }

    /// Append buffered blob blocks. They stay unreferenced until the
    /// metadata commit.
    async fn spill(&mut self) -> DriveResult<()> {
        if self.blob_blocks.is_empty() {
            return Ok(());
        }
        let blocks = std::mem::take(&mut self.blob_blocks);
        let count = blocks.len() as u64;
        let first = self.drive.blobs().core().append_batch(blocks).await?;
        if first != self.spilled_end {
            return Err(DriveError::Core(CoreError::Storage(format!(
                "blob core moved during batch: expected block {}, got {first}",
                self.spilled_end
            ))));
        }
        self.spilled_end += count;
        debug!(first, blocks = count, "spilled blob blocks");
        Ok(())
    }

    /// Commit everything staged. Returns the new metadata length.
    pub async fn flush(mut self) -> DriveResult<u64> {
        let metadata = self.drive.metadata().clone();
        if self.nodes.is_empty() {
            return Ok(metadata.length());
        }

        let own_blobs = *self.drive.blobs().core().key();
        let anchored = self.drive.header_blobs_key() == Some(own_blobs);

        let mut encoded = Vec::with_capacity(self.nodes.len() + 1);
        if !anchored {
            encoded.push(
                Node::Header(Header {
                    version: DRIVE_VERSION,
                    blobs_key: own_blobs,
                })
                .encode()?,
            );
        }
        for node in &self.nodes {
            encoded.push(node.encode()?);
        }

        self.spill().await?;
        let blob_count = self.spilled_end - self.blob_start;

        let node_count = encoded.len();
        metadata.append_batch(encoded).await?;
        let length = self.drive.refresh().await?;
        debug!(nodes = node_count, blob_blocks = blob_count, length, "batch flushed");
        Ok(length)
    }
}

impl std::fmt::Debug for DriveBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveBatch")
            .field("nodes", &self.nodes.len())
            .field("blob_blocks", &self.blob_blocks.len())
            .finish()
    }
}
