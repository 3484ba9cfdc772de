//! Content-addressed digest types

use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// Hash function used to address blob content
///
/// SHA-256 is the general CAS default; BLAKE3 is used for snapshot
/// content where hashing throughput dominates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestFunction {
    #[default]
    Sha256,
    Blake3,
}

impl DigestFunction {
    /// Length of the hex-encoded hash for this function
    #[must_use]
    pub fn hex_len(&self) -> usize {
        // Both produce 32-byte digests; keep the match so adding a
        // function forces a decision here.
        match self {
            DigestFunction::Sha256 => 64,
            DigestFunction::Blake3 => 64,
        }
    }

    /// Hash `bytes` and return the hex-encoded digest
    #[must_use]
    pub fn hash_hex(&self, bytes: &[u8]) -> String {
        match self {
            DigestFunction::Sha256 => {
                let mut hasher = Sha256::new();
                hasher.update(bytes);
                format!("{:x}", hasher.finalize())
            }
            DigestFunction::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        }
    }

    /// Parse a digest function from its lowercase wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sha256" => Some(DigestFunction::Sha256),
            "blake3" => Some(DigestFunction::Blake3),
            _ => None,
        }
    }

    /// Lowercase wire name, as embedded in byte-stream resource paths
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DigestFunction::Sha256 => "sha256",
            DigestFunction::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for DigestFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A content-addressed digest (hash + size)
///
/// Two digests are equal iff both fields are equal. The digest function
/// travels separately, on the enclosing request or resource name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Digest {
    /// Hash in lowercase hex format
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Create a new digest, validating the hash against `function`
    pub fn new(hash: impl Into<String>, size_bytes: i64, function: DigestFunction) -> Result<Self> {
        let hash = hash.into();

        if hash.len() != function.hex_len()
            || !hash.bytes().all(|c| matches!(c, b'0'..=b'9' | b'a'..=b'f'))
        {
            return Err(ProxyError::invalid_argument(format!(
                "invalid {} hash: expected {} lowercase hex characters, got {:?}",
                function,
                function.hex_len(),
                hash
            )));
        }
        if size_bytes < 0 {
            return Err(ProxyError::invalid_argument(format!(
                "invalid digest size: {size_bytes}"
            )));
        }

        Ok(Self { hash, size_bytes })
    }

    /// Compute the digest of `bytes` under `function`
    #[must_use]
    pub fn of(bytes: &[u8], function: DigestFunction) -> Self {
        Self {
            hash: function.hash_hex(bytes),
            size_bytes: bytes.len() as i64,
        }
    }

    /// Parse a digest from "hash/size" format
    pub fn parse(s: &str, function: DigestFunction) -> Result<Self> {
        let (hash, size) = s.split_once('/').ok_or_else(|| {
            ProxyError::invalid_argument(format!(
                "invalid digest format: expected 'hash/size', got {s:?}"
            ))
        })?;

        let size_bytes: i64 = size.parse().map_err(|_| {
            ProxyError::invalid_argument(format!("invalid size in digest: {size:?}"))
        })?;

        Self::new(hash, size_bytes, function)
    }

    /// Check if this is an empty digest
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Stable map key, equal for equal digests
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.hash, self.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}
