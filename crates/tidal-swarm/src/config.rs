use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Swarm settings, usually the `[swarm]` table of the stager's config file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Address the server role binds. Port 0 picks a free port.
    pub listen_addr: SocketAddr,
    /// Peers dialed for every client-role topic.
    pub peers: Vec<SocketAddr>,
    /// Inactivity window before idle teardown.
    pub idle_window_secs: u64,
    /// Pause before a real apply, leaving room to cancel.
    pub grace_period_secs: u64,
    /// Limit on connect plus handshake for one peer.
    pub handshake_timeout_secs: u64,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            peers: Vec::new(),
            idle_window_secs: 15,
            grace_period_secs: 10,
            handshake_timeout_secs: 10,
        }
    }
}

impl SwarmConfig {
    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_window_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}
