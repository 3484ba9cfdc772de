//! Asynchronous cache-hit accounting
//!
//! Every locally-served request produces a hit record. Records queue per
//! tenant with a ready-tenant FIFO so no tenant starves another: a worker
//! pops one tenant batch per RPC and re-queues the remainder at the tail
//! when a batch exceeds the per-update cap. Hit records are never
//! coalesced.

use crate::config::HitTrackerConfig;
use crate::convert::resource_to_proto;
use crate::hitpb;
use crate::reapi;
use crate::remote::HitSink;
use async_trait::async_trait;
use parking_lot::Mutex;
use sidecas_core::context::CapturedHeaders;
use sidecas_core::{Clock, MetricsCollector, RequestContext, ResourceName, TenantId};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Produces per-request hit trackers
pub trait HitTrackerFactory: Send + Sync {
    fn cas_tracker(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker>;

    fn ac_tracker(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker>;
}

/// Records served cache operations for one request
pub trait HitTracker: Send + Sync {
    /// Start timing a read served to the client
    fn track_download(&self, resource: ResourceName) -> Box<dyn TransferTimer>;

    /// Start timing a write accepted from the client
    ///
    /// Writes that reach the backing cache are tracked there; only
    /// skip-remote uploads are recorded by the proxy.
    fn track_upload(&self, resource: ResourceName) -> Box<dyn TransferTimer>;

    /// Misses are accounted by the backing cache, which sees them as
    /// fall-through reads.
    fn track_miss(&self, digest: &sidecas_core::Digest);

    /// Action metadata accounting belongs to the remote.
    fn set_executed_action_metadata(&self);
}

/// Completes one timed transfer
#[async_trait]
pub trait TransferTimer: Send {
    async fn close_with_bytes_transferred(self: Box<Self>, bytes_to_client: i64);
}

/// Factory that silently accepts and discards all events
///
/// Selected when no telemetry target is configured or the worker count
/// disables the pipeline.
#[derive(Debug, Default)]
pub struct NoOpHitTrackerFactory;

impl HitTrackerFactory for NoOpHitTrackerFactory {
    fn cas_tracker(
        &self,
        _ctx: &RequestContext,
        _metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker> {
        Box::new(NoOpHitTracker)
    }

    fn ac_tracker(
        &self,
        _ctx: &RequestContext,
        _metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker> {
        Box::new(NoOpHitTracker)
    }
}

struct NoOpHitTracker;

impl HitTracker for NoOpHitTracker {
    fn track_download(&self, _resource: ResourceName) -> Box<dyn TransferTimer> {
        Box::new(NoOpTransferTimer)
    }

    fn track_upload(&self, _resource: ResourceName) -> Box<dyn TransferTimer> {
        Box::new(NoOpTransferTimer)
    }

    fn track_miss(&self, _digest: &sidecas_core::Digest) {}

    fn set_executed_action_metadata(&self) {}
}

struct NoOpTransferTimer;

#[async_trait]
impl TransferTimer for NoOpTransferTimer {
    async fn close_with_bytes_transferred(self: Box<Self>, _bytes_to_client: i64) {}
}

/// Hit-tracking pipeline delivering batched records to a remote
/// telemetry service
pub struct HitTrackerClient {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn HitSink>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    config: HitTrackerConfig,

    state: Mutex<QueueState>,
    quit: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    by_tenant: HashMap<TenantId, Arc<TenantHits>>,
    queue: VecDeque<Arc<TenantHits>>,
}

struct TenantHits {
    tenant: TenantId,
    state: Mutex<TenantHitsState>,
}

#[derive(Default)]
struct TenantHitsState {
    /// Latest headers seen for this tenant; last writer wins
    headers: CapturedHeaders,
    hits: Vec<hitpb::CacheHit>,
}

impl HitTrackerClient {
    /// Start the pipeline with `config.workers` flush workers
    pub fn new(
        sink: Arc<dyn HitSink>,
        clock: Arc<dyn Clock>,
        metrics: MetricsCollector,
        config: HitTrackerConfig,
    ) -> Self {
        let (quit, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            sink,
            clock,
            metrics,
            config,
            state: Mutex::new(QueueState::default()),
            quit,
            workers: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
        });

        let mut workers = inner.workers.lock();
        for _ in 0..inner.config.workers {
            let inner = Arc::clone(&inner);
            workers.push(tokio::spawn(async move { run_worker(inner).await }));
        }
        drop(workers);

        Self { inner }
    }

    /// Signal shutdown, wait for workers, then best-effort drain
    ///
    /// Idempotent; callers bound the drain with their own deadline.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.quit.send(true);
        let workers: Vec<_> = self.inner.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }

        // Make a best-effort attempt to flush pending updates.
        while send_track_request(&self.inner).await > 0 {}
    }

    /// Pending record count across all tenants (test hook)
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .queue
            .iter()
            .map(|tenant| tenant.state.lock().hits.len())
            .sum()
    }
}

impl HitTrackerFactory for HitTrackerClient {
    fn cas_tracker(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker> {
        Box::new(RecordingHitTracker {
            inner: Arc::clone(&self.inner),
            ctx: ctx.clone(),
            metadata,
        })
    }

    fn ac_tracker(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
    ) -> Box<dyn HitTracker> {
        if !ctx.skip_remote {
            // AC hit-tracking against the backing cache is the remote's
            // job; a tracker here means a routing bug upstream.
            debug!("AC hit tracker requested without skip-remote");
        }
        Box::new(RecordingHitTracker {
            inner: Arc::clone(&self.inner),
            ctx: ctx.clone(),
            metadata,
        })
    }
}

struct RecordingHitTracker {
    inner: Arc<Inner>,
    ctx: RequestContext,
    metadata: Option<reapi::RequestMetadata>,
}

impl HitTracker for RecordingHitTracker {
    fn track_download(&self, resource: ResourceName) -> Box<dyn TransferTimer> {
        Box::new(RecordingTransferTimer {
            inner: Arc::clone(&self.inner),
            ctx: self.ctx.clone(),
            metadata: self.metadata.clone(),
            resource,
            start: self.inner.clock.now(),
            request_type: hitpb::RequestType::Read,
        })
    }

    fn track_upload(&self, resource: ResourceName) -> Box<dyn TransferTimer> {
        if self.ctx.skip_remote {
            return Box::new(RecordingTransferTimer {
                inner: Arc::clone(&self.inner),
                ctx: self.ctx.clone(),
                metadata: self.metadata.clone(),
                resource,
                start: self.inner.clock.now(),
                request_type: hitpb::RequestType::Write,
            });
        }
        // Writes that reach the backing cache are tracked there.
        Box::new(NoOpTransferTimer)
    }

    fn track_miss(&self, _digest: &sidecas_core::Digest) {
        // Local misses fall through to the backing cache, which accounts
        // them.
    }

    fn set_executed_action_metadata(&self) {}
}

struct RecordingTransferTimer {
    inner: Arc<Inner>,
    ctx: RequestContext,
    metadata: Option<reapi::RequestMetadata>,
    resource: ResourceName,
    start: Instant,
    request_type: hitpb::RequestType,
}

#[async_trait]
impl TransferTimer for RecordingTransferTimer {
    async fn close_with_bytes_transferred(self: Box<Self>, bytes_to_client: i64) {
        let elapsed = self.inner.clock.now().saturating_duration_since(self.start);
        let hit = hitpb::CacheHit {
            request_metadata: self.metadata,
            resource: Some(resource_to_proto(&self.resource)),
            size_bytes: bytes_to_client,
            duration: prost_types::Duration::try_from(elapsed).ok(),
            cache_request_type: self.request_type as i32,
        };
        enqueue(&self.inner, &self.ctx, hit).await;
    }
}

async fn enqueue(inner: &Arc<Inner>, ctx: &RequestContext, hit: hitpb::CacheHit) {
    if inner.shutdown_started.load(Ordering::SeqCst) {
        debug!(tenant = %ctx.tenant, "enqueue after worker shutdown, sending RPC synchronously");
        let request = hitpb::TrackRequest { hits: vec![hit] };
        match inner.sink.track(&ctx.forward_headers(), request).await {
            Ok(()) => inner.metrics.record_hits_flushed(1),
            Err(e) => {
                inner.metrics.record_hit_flush_failures(1);
                warn!(error = %e, "Error sending synchronous Track RPC");
            }
        }
        return;
    }

    let tenant_hits = {
        let mut state = inner.state.lock();
        match state.by_tenant.get(&ctx.tenant) {
            Some(tenant_hits) => Arc::clone(tenant_hits),
            None => {
                let tenant_hits = Arc::new(TenantHits {
                    tenant: ctx.tenant.clone(),
                    state: Mutex::new(TenantHitsState::default()),
                });
                state
                    .by_tenant
                    .insert(ctx.tenant.clone(), Arc::clone(&tenant_hits));
                state.queue.push_back(Arc::clone(&tenant_hits));
                tenant_hits
            }
        }
    };

    let accepted = {
        let mut tenant_state = tenant_hits.state.lock();
        if tenant_state.hits.len() >= inner.config.max_pending_hits_per_group {
            false
        } else {
            // Store the latest headers for this tenant for use in the
            // async RPC; last writer wins.
            tenant_state.headers = ctx.forward_headers();
            tenant_state.hits.push(hit);
            true
        }
    };

    if accepted {
        inner.metrics.record_hits_enqueued(1);
    } else {
        inner.metrics.record_hits_dropped(1);
    }
}

async fn run_worker(inner: Arc<Inner>) {
    let mut quit = inner.quit.subscribe();
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = inner.clock.sleep(inner.config.update_interval()) => {}
        }
        // Keep flushing until there is nothing to flush.
        while send_track_request(&inner).await > 0 {}
    }
}

/// Sends the oldest pending batch of hits from the queue. Issues at most
/// one RPC and returns the number of records delivered.
async fn send_track_request(inner: &Arc<Inner>) -> usize {
    let (tenant, headers, hits) = {
        let mut state = inner.state.lock();
        let Some(tenant_hits) = state.queue.pop_front() else {
            return 0;
        };
        let mut tenant_state = tenant_hits.state.lock();
        if tenant_state.hits.len() <= inner.config.max_hits_per_update {
            state.by_tenant.remove(&tenant_hits.tenant);
            (
                tenant_hits.tenant.clone(),
                tenant_state.headers.clone(),
                std::mem::take(&mut tenant_state.hits),
            )
        } else {
            let remainder = tenant_state.hits.split_off(inner.config.max_hits_per_update);
            let requeued = Arc::new(TenantHits {
                tenant: tenant_hits.tenant.clone(),
                state: Mutex::new(TenantHitsState {
                    headers: tenant_state.headers.clone(),
                    hits: remainder,
                }),
            });
            state
                .by_tenant
                .insert(tenant_hits.tenant.clone(), Arc::clone(&requeued));
            state.queue.push_back(requeued);
            (
                tenant_hits.tenant.clone(),
                tenant_state.headers.clone(),
                std::mem::take(&mut tenant_state.hits),
            )
        }
    };

    if hits.is_empty() {
        return 0;
    }

    let count = hits.len();
    let request = hitpb::TrackRequest { hits: hits.clone() };
    let rpc = inner.sink.track(&headers, request);
    match tokio::time::timeout(inner.config.rpc_timeout(), rpc).await {
        Ok(Ok(())) => {
            inner.metrics.record_hits_flushed(count as u64);
            count
        }
        Ok(Err(e)) if e.is_deadline_exceeded() => {
            warn!(tenant = %tenant, error = %e, "Track RPC deadline exceeded, re-queueing batch");
            inner.metrics.record_hit_flush_failures(1);
            requeue(inner, &tenant, headers, hits);
            0
        }
        Ok(Err(e)) => {
            warn!(tenant = %tenant, error = %e, "Error sending Track RPC");
            inner.metrics.record_hit_flush_failures(1);
            0
        }
        Err(_) => {
            warn!(tenant = %tenant, "Track RPC timed out, re-queueing batch");
            inner.metrics.record_hit_flush_failures(1);
            requeue(inner, &tenant, headers, hits);
            0
        }
    }
}

/// Re-insert a timed-out batch at the tail, honoring the per-tenant cap
fn requeue(
    inner: &Arc<Inner>,
    tenant: &TenantId,
    headers: CapturedHeaders,
    hits: Vec<hitpb::CacheHit>,
) {
    let mut state = inner.state.lock();
    let tenant_hits = match state.by_tenant.get(tenant) {
        Some(tenant_hits) => Arc::clone(tenant_hits),
        None => {
            let tenant_hits = Arc::new(TenantHits {
                tenant: tenant.clone(),
                state: Mutex::new(TenantHitsState::default()),
            });
            state
                .by_tenant
                .insert(tenant.clone(), Arc::clone(&tenant_hits));
            state.queue.push_back(Arc::clone(&tenant_hits));
            tenant_hits
        }
    };
    let mut tenant_state = tenant_hits.state.lock();
    if tenant_state.headers.is_empty() {
        tenant_state.headers = headers;
    }
    let capacity = inner
        .config
        .max_pending_hits_per_group
        .saturating_sub(tenant_state.hits.len());
    let total = hits.len();
    tenant_state.hits.extend(hits.into_iter().take(capacity));
    if total > capacity {
        inner.metrics.record_hits_dropped((total - capacity) as u64);
    }
}
