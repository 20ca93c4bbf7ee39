use tidal_crypto::SignatureError;
use tidal_types::DiscoveryKey;

/// Errors produced by core (log) operations.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Index at or beyond the log length. A logic error; never retried.
    #[error("block {index} out of range (length {length})")]
    OutOfRange { index: u64, length: u64 },

    /// A remote block did not arrive in time. Callers may retry.
    #[error("timed out fetching block {index}")]
    FetchTimeout { index: u64 },

    /// No peer announced a head of at least `length` in time.
    #[error("timed out waiting for length {length}")]
    LengthTimeout { length: u64 },

    /// Write attempted on a log without write authority.
    #[error("log is read-only: no write authority")]
    Unauthorized,

    /// Fetched data or a signed head failed verification.
    #[error("verification failed: {0}")]
    Verification(String),

    /// The block exists in the log but this replica cannot serve it.
    #[error("block {index} not available on this replica")]
    NotAvailable { index: u64 },

    /// No core is open for the given discovery key.
    #[error("unknown core {0}")]
    UnknownCore(DiscoveryKey),

    /// The log has been closed.
    #[error("log is closed")]
    Closed,

    /// A peer failed to answer a request.
    #[error("peer error: {0}")]
    Peer(String),

    /// Persistent block storage failed or is corrupt.
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether a caller may reasonably retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::FetchTimeout { .. } | Self::LengthTimeout { .. } | Self::Peer(_)
        )
    }
}

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
