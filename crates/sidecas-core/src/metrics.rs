//! Process-wide counters for the proxy and its background pipelines

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Metrics collector shared across the proxy
///
/// Cheap to clone; all counters are relaxed atomics. Queue-cap drops are
/// counted separately from RPC failures so the two failure modes stay
/// distinguishable.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    state: Arc<MetricsState>,
}

#[derive(Debug)]
struct MetricsState {
    // Request path
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    write_throughs: AtomicU64,
    corrupt_entries_repaired: AtomicU64,
    tree_cache_hits: AtomicU64,
    tree_cache_misses: AtomicU64,

    // Atime pipeline
    atime_enqueued: AtomicU64,
    atime_dropped: AtomicU64,
    atime_flushed: AtomicU64,
    atime_flush_failures: AtomicU64,

    // Hit-tracking pipeline
    hits_enqueued: AtomicU64,
    hits_dropped: AtomicU64,
    hits_flushed: AtomicU64,
    hit_flush_failures: AtomicU64,

    start_time: Instant,
}

macro_rules! counters {
    ($($field:ident => $record:ident),* $(,)?) => {
        $(
            pub fn $record(&self, n: u64) {
                self.state.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(MetricsState {
                local_hits: AtomicU64::new(0),
                local_misses: AtomicU64::new(0),
                write_throughs: AtomicU64::new(0),
                corrupt_entries_repaired: AtomicU64::new(0),
                tree_cache_hits: AtomicU64::new(0),
                tree_cache_misses: AtomicU64::new(0),
                atime_enqueued: AtomicU64::new(0),
                atime_dropped: AtomicU64::new(0),
                atime_flushed: AtomicU64::new(0),
                atime_flush_failures: AtomicU64::new(0),
                hits_enqueued: AtomicU64::new(0),
                hits_dropped: AtomicU64::new(0),
                hits_flushed: AtomicU64::new(0),
                hit_flush_failures: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    counters! {
        local_hits => record_local_hits,
        local_misses => record_local_misses,
        write_throughs => record_write_throughs,
        corrupt_entries_repaired => record_corrupt_entries_repaired,
        tree_cache_hits => record_tree_cache_hits,
        tree_cache_misses => record_tree_cache_misses,
        atime_enqueued => record_atime_enqueued,
        atime_dropped => record_atime_dropped,
        atime_flushed => record_atime_flushed,
        atime_flush_failures => record_atime_flush_failures,
        hits_enqueued => record_hits_enqueued,
        hits_dropped => record_hits_dropped,
        hits_flushed => record_hits_flushed,
        hit_flush_failures => record_hit_flush_failures,
    }

    /// Immutable snapshot of every counter
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let s = &self.state;
        MetricsSnapshot {
            local_hits: s.local_hits.load(Ordering::Relaxed),
            local_misses: s.local_misses.load(Ordering::Relaxed),
            write_throughs: s.write_throughs.load(Ordering::Relaxed),
            corrupt_entries_repaired: s.corrupt_entries_repaired.load(Ordering::Relaxed),
            tree_cache_hits: s.tree_cache_hits.load(Ordering::Relaxed),
            tree_cache_misses: s.tree_cache_misses.load(Ordering::Relaxed),
            atime_enqueued: s.atime_enqueued.load(Ordering::Relaxed),
            atime_dropped: s.atime_dropped.load(Ordering::Relaxed),
            atime_flushed: s.atime_flushed.load(Ordering::Relaxed),
            atime_flush_failures: s.atime_flush_failures.load(Ordering::Relaxed),
            hits_enqueued: s.hits_enqueued.load(Ordering::Relaxed),
            hits_dropped: s.hits_dropped.load(Ordering::Relaxed),
            hits_flushed: s.hits_flushed.load(Ordering::Relaxed),
            hit_flush_failures: s.hit_flush_failures.load(Ordering::Relaxed),
            uptime_seconds: s.start_time.elapsed().as_secs(),
        }
    }

    /// Export metrics in Prometheus text format
    #[must_use]
    pub fn export_prometheus(&self) -> String {
        let snap = self.snapshot();
        let mut out = String::new();
        let mut counter = |name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP sidecas_{name} {help}\n# TYPE sidecas_{name} counter\nsidecas_{name} {value}\n\n"
            ));
        };
        counter("local_hits", "Blobs served from the local store", snap.local_hits);
        counter("local_misses", "Local store misses", snap.local_misses);
        counter(
            "write_throughs",
            "Remote blobs written back to the local store",
            snap.write_throughs,
        );
        counter(
            "corrupt_entries_repaired",
            "Local entries deleted after a hash mismatch",
            snap.corrupt_entries_repaired,
        );
        counter("tree_cache_hits", "Tree cache hits", snap.tree_cache_hits);
        counter("tree_cache_misses", "Tree cache misses", snap.tree_cache_misses);
        counter("atime_enqueued", "Atime updates enqueued", snap.atime_enqueued);
        counter(
            "atime_dropped",
            "Atime updates dropped at the per-tenant cap",
            snap.atime_dropped,
        );
        counter("atime_flushed", "Atime updates delivered", snap.atime_flushed);
        counter(
            "atime_flush_failures",
            "Failed atime flush RPCs",
            snap.atime_flush_failures,
        );
        counter("hits_enqueued", "Hit records enqueued", snap.hits_enqueued);
        counter(
            "hits_dropped",
            "Hit records dropped at the per-tenant cap",
            snap.hits_dropped,
        );
        counter("hits_flushed", "Hit records delivered", snap.hits_flushed);
        counter(
            "hit_flush_failures",
            "Failed hit-tracking flush RPCs",
            snap.hit_flush_failures,
        );
        out.push_str(&format!(
            "# HELP sidecas_uptime_seconds Uptime in seconds\n# TYPE sidecas_uptime_seconds counter\nsidecas_uptime_seconds {}\n",
            snap.uptime_seconds
        ));
        out
    }

    /// Export metrics as JSON for structured logging
    #[must_use]
    pub fn export_json(&self) -> String {
        let snap = self.snapshot();
        serde_json::json!({
            "request_path": {
                "local_hits": snap.local_hits,
                "local_misses": snap.local_misses,
                "write_throughs": snap.write_throughs,
                "corrupt_entries_repaired": snap.corrupt_entries_repaired,
                "tree_cache_hits": snap.tree_cache_hits,
                "tree_cache_misses": snap.tree_cache_misses,
            },
            "atime": {
                "enqueued": snap.atime_enqueued,
                "dropped": snap.atime_dropped,
                "flushed": snap.atime_flushed,
                "flush_failures": snap.atime_flush_failures,
            },
            "hit_tracker": {
                "enqueued": snap.hits_enqueued,
                "dropped": snap.hits_dropped,
                "flushed": snap.hits_flushed,
                "flush_failures": snap.hit_flush_failures,
            },
            "uptime_seconds": snap.uptime_seconds,
        })
        .to_string()
    }
}

/// Point-in-time view of the collector
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub write_throughs: u64,
    pub corrupt_entries_repaired: u64,
    pub tree_cache_hits: u64,
    pub tree_cache_misses: u64,
    pub atime_enqueued: u64,
    pub atime_dropped: u64,
    pub atime_flushed: u64,
    pub atime_flush_failures: u64,
    pub hits_enqueued: u64,
    pub hits_dropped: u64,
    pub hits_flushed: u64,
    pub hit_flush_failures: u64,
    pub uptime_seconds: u64,
}
