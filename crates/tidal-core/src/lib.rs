//! Append-only verifiable logs ("cores") for Tidal.
//!
//! This crate provides:
//! - The `Log` trait with two backings: `LocalLog` (materialized, writable)
//!   and `RemoteLog` (fetched from peers, verified, cached)
//! - Signed heads and Merkle-proven block responses
//! - CRC-framed block storage on disk, or in memory for tests
//! - `CoreStore`, which opens logs by name or key and shares one
//!   `PeerRouter` across all of them
//! - Per-core event channels (`Append`, `Upload`, `Download`, `Closed`)

pub mod error;
pub mod event;
pub mod head;
pub mod local;
pub mod remote;
pub mod replication;
pub mod storage;
pub mod store;
pub mod traits;

pub use error::{CoreError, CoreResult};
pub use event::{CoreEvent, EventStream};
pub use head::{BlockResponse, SignedHead};
pub use local::LocalLog;
pub use remote::{RemoteLog, DEFAULT_FETCH_TIMEOUT};
pub use replication::{link_closed, PeerLink, PeerRouter};
pub use storage::{BlockStorage, FileStorage, MemoryStorage, SyncMode};
pub use store::{CoreStore, StorageMode, StoreConfig};
pub use traits::{BlockSource, Core, Log, NoSource};
