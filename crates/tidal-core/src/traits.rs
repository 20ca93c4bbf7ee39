use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidal_types::{CoreKey, Digest, DiscoveryKey};

use crate::error::CoreResult;
use crate::event::EventStream;
use crate::head::{BlockResponse, SignedHead};

/// An append-only, verifiable log of byte blocks.
///
/// Implemented by [`LocalLog`](crate::LocalLog) (materialized, writable) and
/// [`RemoteLog`](crate::RemoteLog) (fetched on demand from peers). Drives and
/// the mirror engine only ever see this trait.
#[async_trait]
pub trait Log: Send + Sync {
    /// Public verification key of the writer.
    fn key(&self) -> &CoreKey;

    /// Topic peers use to find this log.
    fn discovery_key(&self) -> DiscoveryKey {
        self.key().discovery_key()
    }

    /// Stable identifier: hex encoding of the key.
    fn id(&self) -> String {
        self.key().to_hex()
    }

    /// Number of committed blocks.
    fn length(&self) -> u64;

    /// Sum of the sizes of all committed blocks.
    fn byte_length(&self) -> u64;

    /// Digest over all committed blocks. Cached, never recomputed from
    /// scratch.
    fn tree_hash(&self) -> Digest;

    /// Whether this replica holds write authority.
    fn writable(&self) -> bool;

    /// Append one block, returning its index.
    async fn append(&self, block: Bytes) -> CoreResult<u64> {
        self.append_batch(vec![block]).await
    }

    /// Append several blocks as one unit, returning the index of the first.
    /// No block becomes visible before all of them are stored.
    async fn append_batch(&self, blocks: Vec<Bytes>) -> CoreResult<u64>;

    /// Read block `index`.
    async fn get(&self, index: u64) -> CoreResult<Bytes>;

    /// Start fetching every known block in the background. Never blocks.
    fn download(&self);

    /// Latest signed head known to this replica.
    fn signed_head(&self) -> Option<SignedHead>;

    /// Offer a head received from a peer. Returns whether it advanced the
    /// log.
    fn update_head(&self, head: SignedHead) -> CoreResult<bool>;

    /// Wait until the log is at least `length` blocks long.
    async fn wait_for_length(&self, length: u64, timeout: Duration) -> CoreResult<u64>;

    /// Produce block `index` with an inclusion proof for a peer.
    fn serve(&self, index: u64) -> CoreResult<BlockResponse>;

    /// Subscribe to this log's events.
    fn subscribe(&self) -> EventStream;

    /// Flush storage and stop accepting appends.
    async fn close(&self) -> CoreResult<()>;

    fn is_closed(&self) -> bool;
}

/// Shared handle to a log of either backing.
pub type Core = Arc<dyn Log>;

/// Where a remote log gets blocks it does not have yet.
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch block `index` of the log behind `discovery_key`. The response is
    /// unverified.
    async fn fetch(&self, discovery_key: &DiscoveryKey, index: u64) -> CoreResult<BlockResponse>;
}

/// Source that never has anything. Used by stores with no network.
#[derive(Debug, Default)]
pub struct NoSource;

#[async_trait]
impl BlockSource for NoSource {
    async fn fetch(&self, _discovery_key: &DiscoveryKey, index: u64) -> CoreResult<BlockResponse> {
        Err(crate::CoreError::NotAvailable { index })
    }
}
