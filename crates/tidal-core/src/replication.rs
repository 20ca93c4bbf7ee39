//! Routing of block requests across connected peers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tidal_types::DiscoveryKey;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};
use crate::head::BlockResponse;
use crate::traits::BlockSource;

/// Pause between rounds when no connected peer could answer.
pub const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// One live connection to a peer, as seen by the core layer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Identifier unique within this process.
    fn peer_id(&self) -> u64;

    /// Whether the peer has announced the log behind `discovery_key`.
    fn has(&self, discovery_key: &DiscoveryKey) -> bool;

    /// Tell the peer this process now has the log behind `discovery_key`.
    fn announce(&self, discovery_key: &DiscoveryKey);

    /// Ask the peer for one block.
    async fn request(&self, discovery_key: &DiscoveryKey, index: u64) -> CoreResult<BlockResponse>;
}

/// Fans block requests out to whichever connected peers carry the log.
///
/// Peer faults are logged and retried here; callers only see the outer
/// fetch timeout imposed by the remote log.
#[derive(Default)]
pub struct PeerRouter {
    links: RwLock<HashMap<u64, Arc<dyn PeerLink>>>,
}

impl PeerRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_link(&self, link: Arc<dyn PeerLink>) {
        debug!(peer = link.peer_id(), "peer link added");
        self.links
            .write()
            .expect("router lock poisoned")
            .insert(link.peer_id(), link);
    }

    pub fn remove_link(&self, peer_id: u64) {
        if self
            .links
            .write()
            .expect("router lock poisoned")
            .remove(&peer_id)
            .is_some()
        {
            debug!(peer = peer_id, "peer link removed");
        }
    }

    pub fn link_count(&self) -> usize {
        self.links.read().expect("router lock poisoned").len()
    }

    /// Announce a newly opened log to every connected peer.
    pub fn announce(&self, discovery_key: &DiscoveryKey) {
        for link in self.links.read().expect("router lock poisoned").values() {
            link.announce(discovery_key);
        }
    }

    fn candidates(&self, discovery_key: &DiscoveryKey) -> Vec<Arc<dyn PeerLink>> {
        let links = self.links.read().expect("router lock poisoned");
        let mut found: Vec<_> = links
            .values()
            .filter(|link| link.has(discovery_key))
            .cloned()
            .collect();
        found.sort_by_key(|link| link.peer_id());
        found
    }
}

#[async_trait]
impl BlockSource for PeerRouter {
    async fn fetch(&self, discovery_key: &DiscoveryKey, index: u64) -> CoreResult<BlockResponse> {
        loop {
            for link in self.candidates(discovery_key) {
                match link.request(discovery_key, index).await {
                    Ok(response) => return Ok(response),
                    Err(e) => {
                        warn!(peer = link.peer_id(), topic = %discovery_key.short_id(), index, error = %e, "peer request failed");
                    }
                }
            }
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }
}

impl std::fmt::Debug for PeerRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRouter")
            .field("links", &self.link_count())
            .finish()
    }
}

/// Error used by links whose connection is gone.
pub fn link_closed() -> CoreError {
    CoreError::Peer("connection closed".into())
}
