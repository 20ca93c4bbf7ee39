use serde::{Deserialize, Serialize};
use tidal_core::{BlockResponse, SignedHead};
use tidal_types::{CoreKey, DiscoveryKey};

pub const PROTOCOL_VERSION: u32 = 1;
/// Largest payload accepted in one frame: a maximal block plus its proof and
/// head.
pub const MAX_FRAME_SIZE: usize = 17 * 1024 * 1024;

/// All message types exchanged between two swarm peers.
///
/// Every message after the handshake names the core it concerns by
/// discovery key, so one connection carries all cores of both stores.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum WireMessage {
    Hello { version: u32, node: CoreKey },
    /// The sender has this core open and wants its blocks.
    Open { discovery_key: DiscoveryKey },
    /// The sender can serve this core up to `head.length`.
    Have { discovery_key: DiscoveryKey, head: SignedHead },
    Request { id: u64, discovery_key: DiscoveryKey, index: u64 },
    Data { id: u64, response: BlockResponse },
    NoData { id: u64, reason: String },
    /// The sender closed this core.
    Close { discovery_key: DiscoveryKey },
}

impl WireMessage {
    pub fn type_tag(&self) -> u8 {
        match self {
            Self::Hello { .. } => 1,
            Self::Open { .. } => 2,
            Self::Have { .. } => 3,
            Self::Request { .. } => 4,
            Self::Data { .. } => 5,
            Self::NoData { .. } => 6,
            Self::Close { .. } => 7,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Open { .. } => "Open",
            Self::Have { .. } => "Have",
            Self::Request { .. } => "Request",
            Self::Data { .. } => "Data",
            Self::NoData { .. } => "NoData",
            Self::Close { .. } => "Close",
        }
    }
}
