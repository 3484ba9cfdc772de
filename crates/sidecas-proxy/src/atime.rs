//! Asynchronous access-time updates
//!
//! When a read is served from the local store, the authoritative cache
//! never sees it and its eviction metadata goes stale. This pipeline
//! batches the resources served locally and notifies the remote
//! periodically, per tenant, with the same ready-tenant FIFO discipline
//! as the hit tracker. Entries coalesce by resource within a flush
//! window; duplicates carry no extra information for atime purposes.

use crate::atimepb;
use crate::config::AtimeConfig;
use crate::convert::resource_to_proto;
use crate::remote::AtimeSink;
use parking_lot::Mutex;
use sidecas_core::context::CapturedHeaders;
use sidecas_core::{Clock, MetricsCollector, RequestContext, ResourceName, TenantId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Access-time update pipeline
pub struct AtimeUpdater {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Arc<dyn AtimeSink>,
    clock: Arc<dyn Clock>,
    metrics: MetricsCollector,
    config: AtimeConfig,

    state: Mutex<QueueState>,
    quit: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown_started: AtomicBool,
}

#[derive(Default)]
struct QueueState {
    by_tenant: HashMap<TenantId, Arc<TenantQueue>>,
    queue: VecDeque<Arc<TenantQueue>>,
}

struct TenantQueue {
    tenant: TenantId,
    state: Mutex<TenantQueueState>,
}

#[derive(Default)]
struct TenantQueueState {
    /// Latest headers seen for this tenant; last writer wins
    headers: CapturedHeaders,
    resources: Vec<ResourceName>,
    seen: HashSet<String>,
}

impl AtimeUpdater {
    /// Start the pipeline with `config.workers` flush workers
    pub fn new(
        sink: Arc<dyn AtimeSink>,
        clock: Arc<dyn Clock>,
        metrics: MetricsCollector,
        config: AtimeConfig,
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

    /// Record that `resource` was served from the local store
    pub async fn enqueue(&self, ctx: &RequestContext, resource: ResourceName) {
        let inner = &self.inner;
        if inner.shutdown_started.load(Ordering::SeqCst) {
            debug!(tenant = %ctx.tenant, "enqueue after worker shutdown, sending RPC synchronously");
            let request = atimepb::UpdateAccessTimesRequest {
                resources: vec![resource_to_proto(&resource)],
            };
            match inner.sink.update_access_times(&ctx.forward_headers(), request).await {
                Ok(()) => inner.metrics.record_atime_flushed(1),
                Err(e) => {
                    inner.metrics.record_atime_flush_failures(1);
                    warn!(error = %e, "Error sending synchronous UpdateAccessTimes RPC");
                }
            }
            return;
        }

        let tenant_queue = {
            let mut state = inner.state.lock();
            match state.by_tenant.get(&ctx.tenant) {
                Some(queue) => Arc::clone(queue),
                None => {
                    let queue = Arc::new(TenantQueue {
                        tenant: ctx.tenant.clone(),
                        state: Mutex::new(TenantQueueState::default()),
                    });
                    state.by_tenant.insert(ctx.tenant.clone(), Arc::clone(&queue));
                    state.queue.push_back(Arc::clone(&queue));
                    queue
                }
            }
        };

        enum Outcome {
            Enqueued,
            Coalesced,
            Dropped,
        }

        let outcome = {
            let mut queue_state = tenant_queue.state.lock();
            let key = format!("{}|{}", resource.instance_name(), resource.digest());
            if queue_state.seen.contains(&key) {
                queue_state.headers = ctx.forward_headers();
                Outcome::Coalesced
            } else if queue_state.resources.len() >= inner.config.max_pending_per_tenant {
                Outcome::Dropped
            } else {
                queue_state.headers = ctx.forward_headers();
                queue_state.seen.insert(key);
                queue_state.resources.push(resource);
                Outcome::Enqueued
            }
        };

        match outcome {
            Outcome::Enqueued | Outcome::Coalesced => inner.metrics.record_atime_enqueued(1),
            Outcome::Dropped => inner.metrics.record_atime_dropped(1),
        }
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

        while send_update(&self.inner).await > 0 {}
    }

    /// Pending resource count across all tenants (test hook)
    #[must_use]
    pub fn pending(&self) -> usize {
        let state = self.inner.state.lock();
        state
            .queue
            .iter()
            .map(|queue| queue.state.lock().resources.len())
            .sum()
    }
}

async fn run_worker(inner: Arc<Inner>) {
    let mut quit = inner.quit.subscribe();
    loop {
        tokio::select! {
            _ = quit.changed() => return,
            _ = inner.clock.sleep(inner.config.update_interval()) => {}
        }
        while send_update(&inner).await > 0 {}
    }
}

/// Sends the oldest pending tenant batch. Issues at most one RPC and
/// returns the number of resources delivered.
async fn send_update(inner: &Arc<Inner>) -> usize {
    let (tenant, headers, resources) = {
        let mut state = inner.state.lock();
        let Some(tenant_queue) = state.queue.pop_front() else {
            return 0;
        };
        let mut queue_state = tenant_queue.state.lock();
        if queue_state.resources.len() <= inner.config.max_per_update {
            state.by_tenant.remove(&tenant_queue.tenant);
            (
                tenant_queue.tenant.clone(),
                queue_state.headers.clone(),
                std::mem::take(&mut queue_state.resources),
            )
        } else {
            let remainder = queue_state.resources.split_off(inner.config.max_per_update);
            let seen = remainder
                .iter()
                .map(|r| format!("{}|{}", r.instance_name(), r.digest()))
                .collect();
            let requeued = Arc::new(TenantQueue {
                tenant: tenant_queue.tenant.clone(),
                state: Mutex::new(TenantQueueState {
                    headers: queue_state.headers.clone(),
                    resources: remainder,
                    seen,
                }),
            });
            state
                .by_tenant
                .insert(tenant_queue.tenant.clone(), Arc::clone(&requeued));
            state.queue.push_back(requeued);
            (
                tenant_queue.tenant.clone(),
                queue_state.headers.clone(),
                std::mem::take(&mut queue_state.resources),
            )
        }
    };

    if resources.is_empty() {
        return 0;
    }

    let count = resources.len();
    let request = atimepb::UpdateAccessTimesRequest {
        resources: resources.iter().map(resource_to_proto).collect(),
    };
    let rpc = inner.sink.update_access_times(&headers, request);
    match tokio::time::timeout(inner.config.rpc_timeout(), rpc).await {
        Ok(Ok(())) => {
            inner.metrics.record_atime_flushed(count as u64);
            count
        }
        Ok(Err(e)) if e.is_deadline_exceeded() => {
            warn!(tenant = %tenant, error = %e, "UpdateAccessTimes deadline exceeded, re-queueing batch");
            inner.metrics.record_atime_flush_failures(1);
            requeue(inner, &tenant, headers, resources);
            0
        }
        Ok(Err(e)) => {
            warn!(tenant = %tenant, error = %e, "Error sending UpdateAccessTimes RPC");
            inner.metrics.record_atime_flush_failures(1);
            0
        }
        Err(_) => {
            warn!(tenant = %tenant, "UpdateAccessTimes RPC timed out, re-queueing batch");
            inner.metrics.record_atime_flush_failures(1);
            requeue(inner, &tenant, headers, resources);
            0
        }
    }
}

/// Re-insert a timed-out batch at the tail, honoring the per-tenant cap
fn requeue(
    inner: &Arc<Inner>,
    tenant: &TenantId,
    headers: CapturedHeaders,
    resources: Vec<ResourceName>,
) {
    let mut state = inner.state.lock();
    let tenant_queue = match state.by_tenant.get(tenant) {
        Some(queue) => Arc::clone(queue),
        None => {
            let queue = Arc::new(TenantQueue {
                tenant: tenant.clone(),
                state: Mutex::new(TenantQueueState::default()),
            });
            state.by_tenant.insert(tenant.clone(), Arc::clone(&queue));
            state.queue.push_back(Arc::clone(&queue));
            queue
        }
    };
    let mut queue_state = tenant_queue.state.lock();
    if queue_state.headers.is_empty() {
        queue_state.headers = headers;
    }
    let mut dropped = 0u64;
    for resource in resources {
        let key = format!("{}|{}", resource.instance_name(), resource.digest());
        if queue_state.seen.contains(&key) {
            continue;
        }
        if queue_state.resources.len() >= inner.config.max_pending_per_tenant {
            dropped += 1;
            continue;
        }
        queue_state.seen.insert(key);
        queue_state.resources.push(resource);
    }
    if dropped > 0 {
        inner.metrics.record_atime_dropped(dropped);
    }
}
