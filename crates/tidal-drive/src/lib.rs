//! Versioned key-value drives for Tidal.
//!
//! A [`Drive`] is built from two cores: a metadata log whose blocks are
//! [`Node`]s (header, puts, tombstones, settings), and a [`BlobStore`] holding
//! values too large to inline. Reads resolve the most recent node for a key
//! at the drive's length; a checkout pins that length.
//!
//! # Design Rules
//!
//! 1. The metadata log is the history; nothing is ever rewritten.
//! 2. Blob blocks are appended before the metadata that references them.
//! 3. Checkouts never write.
//! 4. Settings live beside entries but are never listed by `entries()`.

pub mod batch;
pub mod blobs;
pub mod drive;
pub mod error;
pub mod index;
pub mod node;

pub use batch::{DriveBatch, BLOB_SPILL_BLOCKS, INLINE_THRESHOLD};
pub use blobs::{BlobStore, BLOB_BLOCK_SIZE};
pub use drive::{Drive, BLOBS_NAME, METADATA_NAME};
pub use error::{DriveError, DriveResult};
pub use index::Entries;
pub use node::{content_hash, normalize_key, Entry, EntryValue, Header, Node, DRIVE_VERSION};
