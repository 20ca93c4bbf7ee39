//! Diff and mirror engine for Tidal drives.
//!
//! Reconciles a destination drive with a source drive key by key, produces
//! deterministic diff records for dry runs, seeds fresh drives by
//! block-for-block hydration, and carries allow-listed settings across.
//!
//! # Key Types
//!
//! - [`DiffRecord`] / [`DiffOp`] -- one key-level difference
//! - [`mirror`] / [`MirrorOptions`] / [`MirrorReport`] -- dry-run or apply
//! - [`hydrate`] / [`hydrate_drive`] -- seed from a known-good copy
//! - [`SettingChange`] / [`sync_settings`] -- settings carry-over
//! - [`ReleaseDecision`] / [`decide`] -- release gate

pub mod diff;
pub mod error;
pub mod hydrate;
pub mod mirror;
pub mod release;
pub mod settings;

pub use diff::{diff, DiffOp, DiffRecord};
pub use error::{MirrorError, MirrorResult};
pub use hydrate::{hydrate, hydrate_drive};
pub use mirror::{mirror, MirrorOptions, MirrorReport};
pub use release::{decide, is_release_version, read_version, ReleaseDecision, VERSION_FILE};
pub use settings::{diff_settings, sync_settings, SettingChange, DEFAULT_SETTINGS};
