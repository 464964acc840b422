//! Content hashing
//!
//! Every blob in the store is addressed by the SHA256 digest of its bytes.
//! Same bytes = same hash, on every machine.

use crate::error::{StockpileError, StockpileResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a content hash in bytes
pub const HASH_LEN: usize = 32;

/// SHA256 digest identifying a blob of content
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; HASH_LEN]);

impl ContentHash {
    /// Hash a complete buffer
    pub fn of(bytes: &[u8]) -> Self {
        let mut hasher = ContentHasher::new();
        hasher.update(bytes);
        hasher.finalize()
    }

    /// Wrap raw digest bytes
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Full lowercase hex representation
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 12 hex characters, for display
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl FromStr for ContentHash {
    type Err = StockpileError;

    fn from_str(s: &str) -> StockpileResult<Self> {
        if s.len() != HASH_LEN * 2 {
            return Err(StockpileError::InvalidHash(s.to_string()));
        }

        let mut bytes = [0u8; HASH_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| StockpileError::InvalidHash(s.to_string()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Incremental hasher for content that arrives in chunks
#[derive(Default)]
pub struct ContentHasher {
    inner: Sha256,
    bytes: u64,
}

impl ContentHasher {
    /// Create an empty hasher
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finish and produce the content hash
    pub fn finalize(self) -> ContentHash {
        let digest = self.inner.finalize();
        let mut bytes = [0u8; HASH_LEN];
        bytes.copy_from_slice(&digest);
        ContentHash(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_deterministic() {
        assert_eq!(ContentHash::of(b"test content"), ContentHash::of(b"test content"));
        assert_ne!(ContentHash::of(b"content 1"), ContentHash::of(b"content 2"));
    }

    #[test]
    fn hash_known_digest() {
        // sha256("")
        assert_eq!(
            ContentHash::of(b"").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn incremental_matches_oneshot() {
        let mut hasher = ContentHasher::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.bytes_hashed(), 11);
        assert_eq!(hasher.finalize(), ContentHash::of(b"hello world"));
    }

    #[test]
    fn parse_hex() {
        let hash = ContentHash::of(b"abc");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_eq!(hash.short().len(), 12);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!("abc".parse::<ContentHash>().is_err());
        assert!("z".repeat(64).parse::<ContentHash>().is_err());
    }

    #[test]
    fn serializes_as_hex_string() {
        let hash = ContentHash::of(b"abc");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));
    }
}
