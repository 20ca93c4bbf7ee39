use std::net::SocketAddr;

use async_trait::async_trait;
use tidal_types::DiscoveryKey;

use crate::error::SwarmResult;

/// Finds peer addresses for a topic.
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn lookup(&self, topic: &DiscoveryKey) -> SwarmResult<Vec<SocketAddr>>;
}

/// Discovery from a fixed address list. Every topic resolves to the same
/// peers.
#[derive(Clone, Debug, Default)]
pub struct StaticDiscovery {
    peers: Vec<SocketAddr>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<SocketAddr>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn lookup(&self, _topic: &DiscoveryKey) -> SwarmResult<Vec<SocketAddr>> {
        Ok(self.peers.clone())
    }
}
