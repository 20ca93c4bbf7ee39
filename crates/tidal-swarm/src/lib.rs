//! Swarm replication for Tidal.
//!
//! Peers exchange length-prefixed frames over TCP. A single connection per
//! peer node carries every core both stores have open; block requests are
//! answered with Merkle-proven responses that the requesting remote log
//! verifies before caching.
//!
//! # Key Types
//!
//! - [`Swarm`] / [`JoinOptions`] -- topic joins, listener, dialing, teardown
//! - [`Connection`] -- per-peer link implementing the core router's `PeerLink`
//! - [`WireMessage`] / [`WireCodec`] -- framing
//! - [`IdleMonitor`] -- upload-driven idle teardown timer

pub mod codec;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod idle;
pub mod message;
pub mod swarm;

pub use codec::WireCodec;
pub use config::SwarmConfig;
pub use connection::{handshake, Connection};
pub use discovery::{Discovery, StaticDiscovery};
pub use error::{SwarmError, SwarmResult};
pub use idle::{IdleMonitor, IdleState};
pub use message::{WireMessage, MAX_FRAME_SIZE, PROTOCOL_VERSION};
pub use swarm::{JoinOptions, Swarm};
