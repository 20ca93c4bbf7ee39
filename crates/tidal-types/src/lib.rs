//! Foundation types for Tidal.
//!
//! This crate provides the identity and addressing types shared by every
//! other Tidal crate: how a core is named, how peers find it, and how a blob
//! inside a blob core is referenced.
//!
//! # Key Types
//!
//! - [`CoreKey`] — Public verification key that identifies an append-only core
//! - [`DiscoveryKey`] — Topic identifier derived from a [`CoreKey`]
//! - [`Digest`] — BLAKE3 digest used for tree hashes and content hashes
//! - [`BlobRef`] — Block/byte range of one blob inside a blob core

pub mod blob;
pub mod digest;
pub mod error;
pub mod identity;

pub use blob::BlobRef;
pub use digest::Digest;
pub use error::TypeError;
pub use identity::{CoreKey, DiscoveryKey};
