//! Core types for the sidecas cache proxy
//!
//! This crate holds the domain types shared by the proxy request path and
//! the background pipelines: content digests, resource names, the
//! per-request context, the clock abstraction, errors, and metrics.

pub mod clock;
pub mod context;
pub mod digest;
pub mod error;
pub mod metrics;
pub mod resource;

pub use clock::{Clock, FakeClock, SystemClock};
pub use context::{RequestContext, TenantId, ANONYMOUS_TENANT};
pub use digest::{Digest, DigestFunction};
pub use error::{ProxyError, Result};
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use resource::{CacheType, Compressor, ResourceName};
