//! Per-request context: tenant, forwarded headers, and routing flags

use serde::{Deserialize, Serialize};
use tonic::metadata::MetadataMap;

/// Header selecting local-only mode ("true" enables it)
pub const SKIP_REMOTE_HEADER: &str = "skip-remote";

/// Header carrying the caller's tenant/group identity
pub const CLIENT_IDENTITY_HEADER: &str = "client-identity";

/// Header carrying the caller's capability set (comma-separated); when
/// present, writes require the `cache-write` capability
pub const CAPABILITIES_HEADER: &str = "x-sidecas-capabilities";

/// Capability required for cache writes
pub const CACHE_WRITE_CAPABILITY: &str = "cache-write";

/// Auth headers forwarded verbatim on outbound RPCs
pub const AUTH_HEADERS: &[&str] = &["authorization", "x-sidecas-api-key", CLIENT_IDENTITY_HEADER];

/// Usage/origin headers forwarded verbatim on outbound RPCs
pub const USAGE_HEADERS: &[&str] = &["x-sidecas-origin", "x-sidecas-client"];

/// Sentinel tenant for unauthenticated requests
pub const ANONYMOUS_TENANT: &str = "ANON";

/// Billing and isolation boundary, extracted from request context
pub type TenantId = String;

/// Header pairs captured for replay on background RPCs
pub type CapturedHeaders = Vec<(String, String)>;

/// Context accompanying every proxy operation
///
/// Carries the tenant identity, the auth and usage headers to forward
/// verbatim, and the flags that steer routing. Cheap to clone; hit and
/// atime records hold one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestContext {
    /// Tenant/group identifier; `ANONYMOUS_TENANT` when unauthenticated
    pub tenant: TenantId,

    /// Auth headers, forwarded unmodified to the remote and to
    /// background RPCs
    pub auth_headers: CapturedHeaders,

    /// Usage/origin headers, forwarded unmodified
    pub usage_headers: CapturedHeaders,

    /// Local-only mode: reads must not fall through, writes must not
    /// propagate
    pub skip_remote: bool,

    /// Whether the caller holds the cache-write capability
    pub may_write: bool,
}

impl RequestContext {
    /// Context for an anonymous caller with full access
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            tenant: ANONYMOUS_TENANT.to_string(),
            auth_headers: Vec::new(),
            usage_headers: Vec::new(),
            skip_remote: false,
            may_write: true,
        }
    }

    /// Extract a context from inbound request metadata
    #[must_use]
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        let header = |name: &str| -> Option<String> {
            metadata
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        let tenant = header(CLIENT_IDENTITY_HEADER)
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| ANONYMOUS_TENANT.to_string());

        let capture = |names: &[&str]| -> CapturedHeaders {
            names
                .iter()
                .filter_map(|name| header(name).map(|v| (name.to_string(), v)))
                .collect()
        };

        let may_write = match header(CAPABILITIES_HEADER) {
            Some(caps) => caps
                .split(',')
                .any(|c| c.trim() == CACHE_WRITE_CAPABILITY),
            None => true,
        };

        Self {
            tenant,
            auth_headers: capture(AUTH_HEADERS),
            usage_headers: capture(USAGE_HEADERS),
            skip_remote: header(SKIP_REMOTE_HEADER).as_deref() == Some("true"),
            may_write,
        }
    }

    /// All headers to attach to an outbound RPC issued for this context
    #[must_use]
    pub fn forward_headers(&self) -> CapturedHeaders {
        let mut headers = self.auth_headers.clone();
        headers.extend(self.usage_headers.iter().cloned());
        headers
    }
}
