//! Wiring and lifecycle for the cache proxy
//!
//! Builds the store, remote clients, tree cache, and background
//! pipelines from configuration, serves the two tonic services, and
//! drains the pipelines on shutdown.

use crate::atime::AtimeUpdater;
use crate::bspb::byte_stream_server::ByteStreamServer;
use crate::bytestream_proxy::{ByteStreamProxy, ByteStreamService};
use crate::cas_proxy::{CasProxy, CasService};
use crate::channel::GrpcChannel;
use crate::config::ProxyConfig;
use crate::hit_tracker::{HitTrackerClient, HitTrackerFactory, NoOpHitTrackerFactory};
use crate::reapi::content_addressable_storage_server::ContentAddressableStorageServer;
use crate::remote::{AtimeSink, GrpcAtimeSink, GrpcHitSink, GrpcRemoteCas, HitSink, RemoteCas};
use crate::tree_cache::TreeCache;
use sidecas_core::{Clock, MetricsCollector, ProxyError, Result, SystemClock};
use sidecas_store::BlobStore;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A fully wired cache proxy
pub struct CacheProxy {
    cas: Arc<CasProxy>,
    bytestream: Arc<ByteStreamProxy>,
    atime: Arc<AtimeUpdater>,
    hits: Option<Arc<HitTrackerClient>>,
    metrics: MetricsCollector,
    shutdown_deadline: Duration,
}

impl CacheProxy {
    /// Connect to the configured remote endpoints and wire everything up
    pub async fn connect(config: ProxyConfig, store: Arc<dyn BlobStore>) -> Result<Self> {
        if config.remote.endpoint.is_empty() {
            return Err(ProxyError::config("remote endpoint is required"));
        }

        let channel = GrpcChannel::connect(&config.remote.endpoint, &config.remote).await?;
        let remote: Arc<dyn RemoteCas> =
            Arc::new(GrpcRemoteCas::from_channel(&channel, &config.remote));
        let atime_sink: Arc<dyn AtimeSink> =
            Arc::new(GrpcAtimeSink::from_channel(&channel, &config.remote));

        let hit_sink: Option<Arc<dyn HitSink>> = if config.hit_tracker.enabled() {
            let hit_channel =
                GrpcChannel::connect(&config.hit_tracker.target, &config.remote).await?;
            Some(Arc::new(GrpcHitSink::from_channel(
                &hit_channel,
                &config.remote,
            )))
        } else {
            None
        };

        Self::assemble(config, store, remote, atime_sink, hit_sink, Arc::new(SystemClock))
    }

    /// Wire a proxy from pre-built collaborators (tests substitute
    /// fakes at these seams)
    pub fn assemble(
        config: ProxyConfig,
        store: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteCas>,
        atime_sink: Arc<dyn AtimeSink>,
        hit_sink: Option<Arc<dyn HitSink>>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let metrics = MetricsCollector::new();

        let atime = Arc::new(AtimeUpdater::new(
            atime_sink,
            Arc::clone(&clock),
            metrics.clone(),
            config.atime.clone(),
        ));

        let (hits, hit_factory): (Option<Arc<HitTrackerClient>>, Arc<dyn HitTrackerFactory>) =
            match hit_sink {
                Some(sink) if config.hit_tracker.enabled() => {
                    let client = Arc::new(HitTrackerClient::new(
                        sink,
                        Arc::clone(&clock),
                        metrics.clone(),
                        config.hit_tracker.clone(),
                    ));
                    (Some(Arc::clone(&client)), client)
                }
                _ => {
                    info!("hit tracking disabled, events will be discarded");
                    (None, Arc::new(NoOpHitTrackerFactory))
                }
            };

        let tree_cache = if config.get_tree.enable_caching {
            Some(Arc::new(TreeCache::new(
                config.get_tree.cache_capacity,
                config.get_tree.cache_ttl(),
            )?))
        } else {
            None
        };

        let cas = Arc::new(CasProxy::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&atime),
            Arc::clone(&hit_factory),
            tree_cache,
            metrics.clone(),
        ));
        let bytestream = Arc::new(ByteStreamProxy::new(
            store,
            remote,
            Arc::clone(&atime),
            hit_factory,
            metrics.clone(),
        ));

        Ok(Self {
            cas,
            bytestream,
            atime,
            hits,
            metrics,
            shutdown_deadline: config.shutdown_deadline(),
        })
    }

    pub fn cas(&self) -> Arc<CasProxy> {
        Arc::clone(&self.cas)
    }

    pub fn bytestream(&self) -> Arc<ByteStreamProxy> {
        Arc::clone(&self.bytestream)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Serve both tonic services until `shutdown` resolves, then drain
    pub async fn serve(
        &self,
        addr: SocketAddr,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        info!(%addr, "Serving cache proxy");
        tonic::transport::Server::builder()
            .add_service(ContentAddressableStorageServer::new(CasService(Arc::clone(
                &self.cas,
            ))))
            .add_service(ByteStreamServer::new(ByteStreamService(Arc::clone(
                &self.bytestream,
            ))))
            .serve_with_shutdown(addr, shutdown)
            .await
            .map_err(|e| ProxyError::config(format!("server error: {e}")))?;

        self.shutdown().await;
        Ok(())
    }

    /// Drain both background pipelines, bounded by the configured
    /// deadline. Idempotent.
    pub async fn shutdown(&self) {
        let drain = async {
            self.atime.shutdown().await;
            if let Some(hits) = &self.hits {
                hits.shutdown().await;
            }
        };
        if tokio::time::timeout(self.shutdown_deadline, drain)
            .await
            .is_err()
        {
            warn!(
                deadline_secs = self.shutdown_deadline.as_secs(),
                "Shutdown drain exceeded its deadline, records may be lost"
            );
        }
    }
}
