use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Public verification key of an append-only core.
///
/// A `CoreKey` is the raw Ed25519 public key of the core's writer. It is the
/// stable identity of the core: anyone holding it can verify signed heads,
/// only the holder of the matching secret key can append.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoreKey([u8; 32]);

impl CoreKey {
    /// Create from raw public key bytes.
    pub fn from_raw(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random key for tests and demos. Not a valid Ed25519 point in general.
    pub fn ephemeral() -> Self {
        let mut bytes = [0u8; 32];
        rand::Rng::fill(&mut rand::thread_rng(), &mut bytes);
        Self(bytes)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding. This is the core's printable id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        format!("core:{}", hex::encode(&self.0[..4]))
    }

    /// Parse from 64 hex characters, with or without the `core:` prefix.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let s = s.strip_prefix("core:").unwrap_or(s);
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| TypeError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            })?;
        Ok(Self(arr))
    }

    /// Topic identifier peers use to find this core without learning its key.
    pub fn discovery_key(&self) -> DiscoveryKey {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tidal-discovery-v1:");
        hasher.update(&self.0);
        DiscoveryKey(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for CoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoreKey({})", self.short_id())
    }
}

impl fmt::Display for CoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Discovery topic of a core, derived one-way from its [`CoreKey`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiscoveryKey([u8; 32]);

impl DiscoveryKey {
    /// Create from a raw hash. Use [`CoreKey::discovery_key`] in production code.
    pub fn from_raw(hash: [u8; 32]) -> Self {
        Self(hash)
    }

    /// The raw 32 bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Full hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short identifier (first 8 hex characters).
    pub fn short_id(&self) -> String {
        format!("topic:{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DiscoveryKey({})", self.short_id())
    }
}

impl fmt::Display for DiscoveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_key_is_deterministic() {
        let key = CoreKey::from_raw([42u8; 32]);
        assert_eq!(key.discovery_key(), key.discovery_key());
    }

    #[test]
    fn discovery_key_differs_from_key() {
        let key = CoreKey::from_raw([7u8; 32]);
        assert_ne!(key.discovery_key().as_bytes(), key.as_bytes());
    }

    #[test]
    fn different_keys_different_topics() {
        let a = CoreKey::from_raw([1u8; 32]).discovery_key();
        let b = CoreKey::from_raw([2u8; 32]).discovery_key();
        assert_ne!(a, b);
    }

    #[test]
    fn ephemeral_keys_are_unique() {
        assert_ne!(CoreKey::ephemeral(), CoreKey::ephemeral());
    }

    #[test]
    fn short_id_format() {
        let short = CoreKey::from_raw([0; 32]).short_id();
        assert!(short.starts_with("core:"));
        assert_eq!(short.len(), 13);
    }

    #[test]
    fn hex_roundtrip_with_prefix() {
        let key = CoreKey::from_raw([99; 32]);
        let prefixed = format!("core:{}", key.to_hex());
        assert_eq!(CoreKey::from_hex(&prefixed).unwrap(), key);
        assert_eq!(CoreKey::from_hex(&key.to_hex()).unwrap(), key);
    }

    #[test]
    fn from_hex_rejects_garbage() {
        assert!(matches!(
            CoreKey::from_hex("not-hex"),
            Err(TypeError::InvalidHex(_))
        ));
    }

    #[test]
    fn serde_roundtrip() {
        let key = CoreKey::from_raw([10; 32]);
        let json = serde_json::to_string(&key).unwrap();
        let parsed: CoreKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, parsed);
    }
}
