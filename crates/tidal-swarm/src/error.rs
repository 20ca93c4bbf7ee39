use thiserror::Error;
use tidal_core::CoreError;

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("framing error: {0}")]
    Framing(String),

    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("handshake with {addr} timed out")]
    HandshakeTimeout { addr: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("swarm has been destroyed")]
    Destroyed,

    #[error("core error: {0}")]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type SwarmResult<T> = Result<T, SwarmError>;
