//! Resource names for blobs in the byte-stream namespace

use crate::digest::{Digest, DigestFunction};
use crate::error::{ProxyError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which logical cache a resource belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Cas,
    ActionCache,
}

/// Wire compression applied to blob bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compressor {
    #[default]
    Identity,
    Zstd,
}

impl Compressor {
    fn as_str(&self) -> &'static str {
        match self {
            Compressor::Identity => "identity",
            Compressor::Zstd => "zstd",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "identity" => Some(Compressor::Identity),
            "zstd" => Some(Compressor::Zstd),
            _ => None,
        }
    }
}

/// Uniquely names a blob within a tenant/instance
///
/// Formats and parses the byte-stream path grammar:
///
/// - download: `{instance}/blobs/{hash}/{size}`
/// - upload:   `{instance}/uploads/{uuid}/blobs/{hash}/{size}`
/// - compressed variants replace `blobs` with
///   `compressed-blobs/{compressor}`
/// - a digest function segment precedes the hash for non-SHA256 functions
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceName {
    instance_name: String,
    digest: Digest,
    digest_function: DigestFunction,
    cache_type: CacheType,
    compressor: Compressor,
}

impl ResourceName {
    pub fn new(
        instance_name: impl Into<String>,
        digest: Digest,
        digest_function: DigestFunction,
        cache_type: CacheType,
        compressor: Compressor,
    ) -> Self {
        Self {
            instance_name: instance_name.into(),
            digest,
            digest_function,
            cache_type,
            compressor,
        }
    }

    /// Shorthand for an uncompressed CAS resource
    pub fn cas(
        instance_name: impl Into<String>,
        digest: Digest,
        digest_function: DigestFunction,
    ) -> Self {
        Self::new(
            instance_name,
            digest,
            digest_function,
            CacheType::Cas,
            Compressor::Identity,
        )
    }

    #[must_use]
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    #[must_use]
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    #[must_use]
    pub fn digest_function(&self) -> DigestFunction {
        self.digest_function
    }

    #[must_use]
    pub fn cache_type(&self) -> CacheType {
        self.cache_type
    }

    #[must_use]
    pub fn compressor(&self) -> Compressor {
        self.compressor
    }

    fn blobs_segments(&self) -> String {
        let mut s = String::new();
        match self.compressor {
            Compressor::Identity => s.push_str("blobs"),
            c => {
                s.push_str("compressed-blobs/");
                s.push_str(c.as_str());
            }
        }
        if self.digest_function != DigestFunction::Sha256 {
            s.push('/');
            s.push_str(self.digest_function.as_str());
        }
        s
    }

    /// Byte-stream download path for this resource
    #[must_use]
    pub fn download_string(&self) -> String {
        let prefix = if self.instance_name.is_empty() {
            String::new()
        } else {
            format!("{}/", self.instance_name)
        };
        format!(
            "{}{}/{}/{}",
            prefix,
            self.blobs_segments(),
            self.digest.hash,
            self.digest.size_bytes
        )
    }

    /// Byte-stream upload path for this resource, under a fresh upload id
    #[must_use]
    pub fn upload_string(&self, upload_id: &str) -> String {
        let prefix = if self.instance_name.is_empty() {
            String::new()
        } else {
            format!("{}/", self.instance_name)
        };
        format!(
            "{}uploads/{}/{}/{}/{}",
            prefix,
            upload_id,
            self.blobs_segments(),
            self.digest.hash,
            self.digest.size_bytes
        )
    }

    /// Parse a byte-stream download path
    pub fn parse_download(s: &str) -> Result<Self> {
        let segments: Vec<&str> = s.split('/').collect();
        let marker = segments
            .iter()
            .position(|seg| *seg == "blobs" || *seg == "compressed-blobs")
            .ok_or_else(|| bad_resource(s))?;
        let instance_name = segments[..marker].join("/");
        let (digest, digest_function, compressor) = parse_blob_tail(&segments[marker..], s)?;
        Ok(Self::new(
            instance_name,
            digest,
            digest_function,
            CacheType::Cas,
            compressor,
        ))
    }

    /// Parse a byte-stream upload path; returns the resource and upload id
    pub fn parse_upload(s: &str) -> Result<(Self, String)> {
        let segments: Vec<&str> = s.split('/').collect();
        let marker = segments
            .iter()
            .position(|seg| *seg == "uploads")
            .ok_or_else(|| bad_resource(s))?;
        let instance_name = segments[..marker].join("/");
        let upload_id = segments
            .get(marker + 1)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| bad_resource(s))?
            .to_string();
        let tail = &segments[marker + 2..];
        if !matches!(tail.first(), Some(&"blobs") | Some(&"compressed-blobs")) {
            return Err(bad_resource(s));
        }
        let (digest, digest_function, compressor) = parse_blob_tail(tail, s)?;
        Ok((
            Self::new(
                instance_name,
                digest,
                digest_function,
                CacheType::Cas,
                compressor,
            ),
            upload_id,
        ))
    }
}

impl fmt::Display for ResourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.download_string())
    }
}

fn bad_resource(s: &str) -> ProxyError {
    ProxyError::invalid_argument(format!("malformed resource name: {s:?}"))
}

/// Parse `blobs/...` or `compressed-blobs/{compressor}/...` followed by an
/// optional digest-function segment, then `{hash}/{size}`. Trailing
/// segments (upload metadata) are permitted and ignored.
fn parse_blob_tail(
    tail: &[&str],
    original: &str,
) -> Result<(Digest, DigestFunction, Compressor)> {
    let mut rest = tail;
    let compressor = match rest.first() {
        Some(&"blobs") => {
            rest = &rest[1..];
            Compressor::Identity
        }
        Some(&"compressed-blobs") => {
            let c = rest
                .get(1)
                .and_then(|seg| Compressor::parse(seg))
                .ok_or_else(|| bad_resource(original))?;
            rest = &rest[2..];
            c
        }
        _ => return Err(bad_resource(original)),
    };

    let digest_function = match rest.first().and_then(|seg| DigestFunction::parse(seg)) {
        Some(function) => {
            rest = &rest[1..];
            function
        }
        None => DigestFunction::Sha256,
    };

    let (hash, size) = match rest {
        [hash, size, ..] => (*hash, *size),
        _ => return Err(bad_resource(original)),
    };
    let size_bytes: i64 = size
        .parse()
        .map_err(|_| bad_resource(original))?;
    let digest = Digest::new(hash, size_bytes, digest_function)?;
    Ok((digest, digest_function, compressor))
}
