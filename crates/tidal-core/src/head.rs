//! Signed heads and verified block responses.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tidal_crypto::{length_of, tree_hash_of, MerkleProof, Root, Signature, SigningKey, VerifyingKey};
use tidal_types::{CoreKey, Digest, DiscoveryKey};

use crate::error::{CoreError, CoreResult};

/// Writer-signed snapshot of a core: its length and Merkle roots.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedHead {
    pub length: u64,
    pub byte_length: u64,
    pub roots: Vec<Root>,
    pub signature: Signature,
}

impl SignedHead {
    /// Sign the current state of a core.
    pub fn sign(
        signer: &SigningKey,
        discovery_key: &DiscoveryKey,
        byte_length: u64,
        roots: Vec<Root>,
    ) -> Self {
        let length = length_of(&roots);
        let message = signable(discovery_key, length, byte_length, &tree_hash_of(&roots));
        Self {
            length,
            byte_length,
            roots,
            signature: signer.sign(&message),
        }
    }

    /// Tree hash committed by this head.
    pub fn tree_hash(&self) -> Digest {
        tree_hash_of(&self.roots)
    }

    /// Check that the roots describe `length` blocks and that the signature
    /// was made by the holder of `key`.
    pub fn verify(&self, key: &CoreKey) -> CoreResult<()> {
        if length_of(&self.roots) != self.length {
            return Err(CoreError::Verification(format!(
                "head claims length {} but roots cover {}",
                self.length,
                length_of(&self.roots)
            )));
        }
        let verifier = VerifyingKey::from_core_key(key)?;
        let message = signable(
            &key.discovery_key(),
            self.length,
            self.byte_length,
            &self.tree_hash(),
        );
        verifier
            .verify(&message, &self.signature)
            .map_err(|_| CoreError::Verification("bad head signature".into()))
    }
}

fn signable(discovery_key: &DiscoveryKey, length: u64, byte_length: u64, tree_hash: &Digest) -> Vec<u8> {
    let mut message = Vec::with_capacity(14 + 32 + 16 + 32);
    message.extend_from_slice(b"tidal-head-v1:");
    message.extend_from_slice(discovery_key.as_bytes());
    message.extend_from_slice(&length.to_le_bytes());
    message.extend_from_slice(&byte_length.to_le_bytes());
    message.extend_from_slice(tree_hash.as_bytes());
    message
}

/// A block served by a peer, with everything needed to verify it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockResponse {
    pub index: u64,
    pub data: Bytes,
    pub proof: MerkleProof,
    pub head: SignedHead,
}

impl BlockResponse {
    /// Verify the response for block `index` of the core identified by `key`.
    pub fn verify(&self, key: &CoreKey, index: u64) -> CoreResult<()> {
        if self.index != index || self.proof.index != index {
            return Err(CoreError::Verification(format!(
                "asked for block {index}, got {}",
                self.index
            )));
        }
        self.head.verify(key)?;
        if index >= self.head.length {
            return Err(CoreError::Verification(format!(
                "block {index} beyond signed length {}",
                self.head.length
            )));
        }
        if !self.proof.verify_block(&self.data, &self.head.roots) {
            return Err(CoreError::Verification(format!(
                "merkle proof failed for block {index}"
            )));
        }
        Ok(())
    }
}
