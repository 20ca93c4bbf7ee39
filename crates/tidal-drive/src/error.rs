use tidal_core::CoreError;

/// Errors from drive operations.
#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    /// No live entry for the key at the drive's length.
    #[error("not found: {0}")]
    NotFound(String),

    /// Checkout requested beyond the metadata log.
    #[error("invalid checkout length {length}: metadata log has {available} blocks")]
    InvalidLength { length: u64, available: u64 },

    /// Write attempted through a checkout or a drive without write authority.
    #[error("drive is read-only")]
    ReadOnly,

    /// A metadata block could not be interpreted.
    #[error("corrupt metadata block {index}: {reason}")]
    CorruptNode { index: u64, reason: String },

    /// Blob bytes did not match the digest recorded in their entry.
    #[error("content hash mismatch for {key}")]
    HashMismatch { key: String },

    /// A setting value could not be encoded or decoded as JSON.
    #[error("invalid setting {name}: {reason}")]
    InvalidSetting { name: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    /// Failure in the underlying log.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DriveError {
    /// Whether the failure came from a remote fetch that may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_retryable())
    }
}

/// Result alias for drive operations.
pub type DriveResult<T> = Result<T, DriveError>;
