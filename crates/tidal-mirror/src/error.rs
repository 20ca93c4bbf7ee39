//! Error types for the mirror crate.

use tidal_core::CoreError;
use tidal_drive::DriveError;

/// Errors that can occur while diffing, mirroring or hydrating.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Copying one record failed; nothing from the batch was committed.
    #[error("mirror failed at {key}: {reason}")]
    MirrorFailed { key: String, reason: String },

    /// Hydration finished with a destination that does not match the source.
    #[error("hydration mismatch: {0}")]
    HydrationMismatch(String),

    /// The version file is missing or unreadable.
    #[error("bad version file: {0}")]
    VersionFile(String),

    #[error("drive error: {0}")]
    Drive(#[from] DriveError),

    #[error("core error: {0}")]
    Core(#[from] CoreError),
}

/// Convenience alias for mirror results.
pub type MirrorResult<T> = Result<T, MirrorError>;
