//! Configuration for the cache proxy

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level proxy configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProxyConfig {
    /// Remote CAS endpoint configuration
    #[serde(default)]
    pub remote: RemoteConfig,

    /// GetTree caching behavior
    #[serde(default)]
    pub get_tree: GetTreeConfig,

    /// Access-time update pipeline
    #[serde(default)]
    pub atime: AtimeConfig,

    /// Hit-tracking pipeline
    #[serde(default)]
    pub hit_tracker: HitTrackerConfig,

    /// Deadline for the best-effort drain on shutdown, in seconds
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
}

impl ProxyConfig {
    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

/// Configuration for the authoritative remote CAS
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteConfig {
    /// Remote CAS endpoint (e.g. "grpcs://cas.example.com")
    #[serde(default)]
    pub endpoint: String,

    /// Instance name for multi-tenant remote servers
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API key the proxy itself authenticates with
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Operation timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            instance_name: default_instance_name(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Configuration for the GetTree tree cache
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GetTreeConfig {
    /// Enables the tree cache; when off, GetTree is a pass-through
    /// streaming RPC
    #[serde(default = "default_true")]
    pub enable_caching: bool,

    /// Maximum number of cached directories
    #[serde(default = "default_tree_cache_capacity")]
    pub cache_capacity: usize,

    /// Entry time-to-live in seconds
    #[serde(default = "default_tree_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for GetTreeConfig {
    fn default() -> Self {
        Self {
            enable_caching: default_true(),
            cache_capacity: default_tree_cache_capacity(),
            cache_ttl_secs: default_tree_cache_ttl_secs(),
        }
    }
}

impl GetTreeConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Configuration for the access-time update pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AtimeConfig {
    /// Wall-clock period between flush attempts, in milliseconds
    #[serde(default = "default_atime_interval_ms")]
    pub update_interval_ms: u64,

    /// Cap on queued entries per tenant; over-cap enqueues are dropped
    #[serde(default = "default_atime_max_pending")]
    pub max_pending_per_tenant: usize,

    /// Cap on entries per outbound RPC; excess is re-queued
    #[serde(default = "default_atime_max_per_update")]
    pub max_per_update: usize,

    /// Worker pool size
    #[serde(default = "default_one")]
    pub workers: usize,

    /// Per-flush RPC deadline, in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for AtimeConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: default_atime_interval_ms(),
            max_pending_per_tenant: default_atime_max_pending(),
            max_per_update: default_atime_max_per_update(),
            workers: default_one(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl AtimeConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }
}

/// Configuration for the hit-tracking pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HitTrackerConfig {
    /// Telemetry endpoint; empty disables hit tracking entirely
    #[serde(default)]
    pub target: String,

    /// Wall-clock period between flush attempts, in milliseconds
    #[serde(default = "default_hit_interval_ms")]
    pub update_interval_ms: u64,

    /// Cap on pending hit records per tenant; over-cap enqueues are
    /// dropped
    #[serde(default = "default_max_pending_hits")]
    pub max_pending_hits_per_group: usize,

    /// Cap on hit records per outbound RPC; excess is re-queued
    #[serde(default = "default_max_hits_per_update")]
    pub max_hits_per_update: usize,

    /// Worker pool size; values below 1 disable hit tracking
    #[serde(default = "default_one")]
    pub workers: usize,

    /// Per-flush RPC deadline, in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
}

impl Default for HitTrackerConfig {
    fn default() -> Self {
        Self {
            target: String::new(),
            update_interval_ms: default_hit_interval_ms(),
            max_pending_hits_per_group: default_max_pending_hits(),
            max_hits_per_update: default_max_hits_per_update(),
            workers: default_one(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
        }
    }
}

impl HitTrackerConfig {
    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Whether the pipeline should run at all
    pub fn enabled(&self) -> bool {
        !self.target.is_empty() && self.workers >= 1
    }
}

// Default value functions

fn default_instance_name() -> String {
    "default".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_shutdown_deadline_secs() -> u64 {
    10
}

fn default_tree_cache_capacity() -> usize {
    100_000
}

fn default_tree_cache_ttl_secs() -> u64 {
    15 * 60
}

fn default_atime_interval_ms() -> u64 {
    60_000
}

fn default_atime_max_pending() -> usize {
    1_000_000
}

fn default_atime_max_per_update() -> usize {
    25_000
}

fn default_hit_interval_ms() -> u64 {
    250
}

fn default_max_pending_hits() -> usize {
    2_500_000
}

fn default_max_hits_per_update() -> usize {
    250_000
}

fn default_one() -> usize {
    1
}

fn default_rpc_timeout_ms() -> u64 {
    5_000
}
