//! Blob store: arbitrary-length payloads split over the blocks of one core.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tidal_core::{Core, CoreError, DEFAULT_FETCH_TIMEOUT};
use tidal_types::BlobRef;
use tracing::debug;

use crate::error::{DriveError, DriveResult};

/// Largest block a blob is split into.
pub const BLOB_BLOCK_SIZE: usize = 64 * 1024;

/// Append-only store of byte payloads. Never deduplicates.
#[derive(Clone)]
pub struct BlobStore {
    core: Core,
    head_timeout: Duration,
}

impl BlobStore {
    pub fn new(core: Core) -> Self {
        Self {
            core,
            head_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// How long a read of a replicated core waits for a head covering the
    /// blob.
    pub fn with_head_timeout(mut self, timeout: Duration) -> Self {
        self.head_timeout = timeout;
        self
    }

    /// The underlying core.
    pub fn core(&self) -> &Core {
        &self.core
    }

    /// Append `data`, returning a reference to it.
    pub async fn put(&self, data: &[u8]) -> DriveResult<BlobRef> {
        let blocks = split(data);
        let block_index = self.core.length();
        let byte_offset = self.core.byte_length();
        let blob = BlobRef {
            block_index,
            block_count: blocks.len() as u64,
            byte_offset,
            byte_length: data.len() as u64,
        };
        if !blocks.is_empty() {
            let first = self.core.append_batch(blocks).await?;
            if first != block_index {
                return Err(DriveError::Core(CoreError::Storage(format!(
                    "blob landed at block {first}, expected {block_index}"
                ))));
            }
        }
        debug!(block_index, bytes = data.len(), "blob stored");
        Ok(blob)
    }

    /// Read the bytes behind `blob`.
    pub async fn get(&self, blob: &BlobRef) -> DriveResult<Bytes> {
        if blob.block_count == 0 {
            return Ok(Bytes::new());
        }
        if !self.core.writable() && self.core.length() < blob.end_block() {
            self.core
                .wait_for_length(blob.end_block(), self.head_timeout)
                .await?;
        }
        if blob.block_count == 1 {
            return self.checked(blob, self.core.get(blob.block_index).await?);
        }
        let mut out = BytesMut::with_capacity(blob.byte_length as usize);
        for index in blob.block_index..blob.end_block() {
            out.extend_from_slice(&self.core.get(index).await?);
        }
        self.checked(blob, out.freeze())
    }

    fn checked(&self, blob: &BlobRef, data: Bytes) -> DriveResult<Bytes> {
        if data.len() as u64 != blob.byte_length {
            return Err(DriveError::Core(CoreError::Verification(format!(
                "blob at block {} has {} bytes, reference says {}",
                blob.block_index,
                data.len(),
                blob.byte_length
            ))));
        }
        Ok(data)
    }
}

impl std::fmt::Debug for BlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("core", &self.core.key().short_id())
            .field("length", &self.core.length())
            .finish()
    }
}

/// Split a payload into blob blocks.
pub fn split(data: &[u8]) -> Vec<Bytes> {
    data.chunks(BLOB_BLOCK_SIZE)
        .map(Bytes::copy_from_slice)
        .collect()
}
