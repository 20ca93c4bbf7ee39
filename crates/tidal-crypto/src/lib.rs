//! Cryptographic primitives for Tidal.
//!
//! Provides domain-separated BLAKE3 hashing, an append-only binary Merkle
//! tree with inclusion proofs, and Ed25519 signing keys for core writers.
//!
//! All crypto operations wrap established libraries; there is no custom cryptography.

pub mod hasher;
pub mod merkle;
pub mod signer;

pub use hasher::{leaf_hash, parent_hash, ContentHasher};
pub use merkle::{length_of, tree_hash_of, MerkleProof, MerkleTree, Root, Side};
pub use signer::{Signature, SignatureError, SigningKey, VerifyingKey};
