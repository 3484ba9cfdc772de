//! Shared fakes and harness for the proxy integration tests
//!
//! `FakeRemote` plays the authoritative CAS with RPC counters, mirroring
//! request-counting interceptors; the sinks record every background RPC.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use prost::Message;
use sidecas_core::context::CapturedHeaders;
use sidecas_core::{
    Digest, DigestFunction, FakeClock, MetricsCollector, ProxyError, RequestContext, ResourceName,
    Result,
};
use sidecas_proxy::atime::AtimeUpdater;
use sidecas_proxy::bytestream_proxy::ByteStreamProxy;
use sidecas_proxy::cas_proxy::CasProxy;
use sidecas_proxy::config::{AtimeConfig, HitTrackerConfig};
use sidecas_proxy::hit_tracker::{HitTrackerClient, HitTrackerFactory, NoOpHitTrackerFactory};
use sidecas_proxy::remote::{AtimeSink, HitSink, RemoteCas};
use sidecas_proxy::tree_cache::TreeCache;
use sidecas_proxy::{atimepb, bspb, hitpb, reapi};
use sidecas_store::MemoryBlobStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const ATIME_INTERVAL: Duration = Duration::from_secs(60);
pub const HIT_INTERVAL: Duration = Duration::from_millis(250);

pub fn digest_of(data: &[u8]) -> Digest {
    Digest::of(data, DigestFunction::Sha256)
}

fn rpc_status(code: tonic::Code, message: &str) -> sidecas_proxy::proto::google::rpc::Status {
    sidecas_proxy::proto::google::rpc::Status {
        code: code as i32,
        message: message.to_string(),
        details: vec![],
    }
}

/// In-memory authoritative CAS with unary/stream RPC counters
#[derive(Default)]
pub struct FakeRemote {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    unary_calls: AtomicU32,
    stream_calls: AtomicU32,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Seed a blob directly into the remote
    pub fn insert(&self, data: &[u8]) -> Digest {
        let digest = digest_of(data);
        self.blobs.lock().insert(digest.key(), data.to_vec());
        digest
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.lock().contains_key(&digest.key())
    }

    pub fn unary_calls(&self) -> u32 {
        self.unary_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> u32 {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.unary_calls.store(0, Ordering::SeqCst);
        self.stream_calls.store(0, Ordering::SeqCst);
    }

    fn get(&self, digest: &Digest) -> Option<Vec<u8>> {
        self.blobs.lock().get(&digest.key()).cloned()
    }
}

#[async_trait]
impl RemoteCas for FakeRemote {
    async fn find_missing_blobs(
        &self,
        _ctx: &RequestContext,
        request: reapi::FindMissingBlobsRequest,
    ) -> Result<reapi::FindMissingBlobsResponse> {
        self.unary_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock();
        let missing = request
            .blob_digests
            .into_iter()
            .filter(|d| !blobs.contains_key(&format!("{}/{}", d.hash, d.size_bytes)))
            .collect();
        Ok(reapi::FindMissingBlobsResponse {
            missing_blob_digests: missing,
        })
    }

    async fn batch_read_blobs(
        &self,
        _ctx: &RequestContext,
        request: reapi::BatchReadBlobsRequest,
    ) -> Result<reapi::BatchReadBlobsResponse> {
        self.unary_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock();
        let responses = request
            .digests
            .into_iter()
            .map(|digest| {
                let key = format!("{}/{}", digest.hash, digest.size_bytes);
                match blobs.get(&key) {
                    Some(data) => reapi::batch_read_blobs_response::Response {
                        digest: Some(digest),
                        data: data.clone(),
                        status: Some(rpc_status(tonic::Code::Ok, "")),
                        compressor: reapi::compressor::Value::Identity as i32,
                    },
                    None => reapi::batch_read_blobs_response::Response {
                        digest: Some(digest),
                        data: vec![],
                        status: Some(rpc_status(tonic::Code::NotFound, "blob not found")),
                        compressor: reapi::compressor::Value::Identity as i32,
                    },
                }
            })
            .collect();
        Ok(reapi::BatchReadBlobsResponse { responses })
    }

    async fn batch_update_blobs(
        &self,
        _ctx: &RequestContext,
        request: reapi::BatchUpdateBlobsRequest,
    ) -> Result<reapi::BatchUpdateBlobsResponse> {
        self.unary_calls.fetch_add(1, Ordering::SeqCst);
        let mut blobs = self.blobs.lock();
        let responses = request
            .requests
            .into_iter()
            .map(|entry| {
                let digest = entry.digest.unwrap_or_default();
                blobs.insert(
                    format!("{}/{}", digest.hash, digest.size_bytes),
                    entry.data,
                );
                reapi::batch_update_blobs_response::Response {
                    digest: Some(digest),
                    status: Some(rpc_status(tonic::Code::Ok, "")),
                }
            })
            .collect();
        Ok(reapi::BatchUpdateBlobsResponse { responses })
    }

    async fn get_tree(
        &self,
        _ctx: &RequestContext,
        request: reapi::GetTreeRequest,
    ) -> Result<BoxStream<'static, Result<reapi::GetTreeResponse>>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let blobs = self.blobs.lock();
        let root = request
            .root_digest
            .ok_or_else(|| ProxyError::invalid_argument("root_digest is required"))?;

        let mut directories = Vec::new();
        let mut level = vec![format!("{}/{}", root.hash, root.size_bytes)];
        while let Some(key) = level.pop() {
            let data = blobs
                .get(&key)
                .ok_or_else(|| ProxyError::not_found(key.clone()))?;
            let directory = reapi::Directory::decode(data.as_slice())
                .map_err(|e| ProxyError::internal(format!("bad directory blob: {e}")))?;
            for child in &directory.directories {
                if let Some(digest) = &child.digest {
                    level.push(format!("{}/{}", digest.hash, digest.size_bytes));
                }
            }
            directories.push(directory);
        }

        let response = reapi::GetTreeResponse {
            directories,
            next_page_token: String::new(),
        };
        Ok(tokio_stream::iter(vec![Ok(response)]).boxed())
    }

    async fn read_blob(
        &self,
        _ctx: &RequestContext,
        request: bspb::ReadRequest,
    ) -> Result<BoxStream<'static, Result<bspb::ReadResponse>>> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let resource = ResourceName::parse_download(&request.resource_name)?;
        let Some(data) = self.get(resource.digest()) else {
            return Err(ProxyError::grpc(
                "ByteStream.Read",
                tonic::Status::not_found(resource.digest().to_string()),
            ));
        };
        let chunks: Vec<Result<bspb::ReadResponse>> = data
            .chunks(3)
            .map(|chunk| Ok(bspb::ReadResponse {
                data: chunk.to_vec(),
            }))
            .collect();
        Ok(tokio_stream::iter(chunks).boxed())
    }

    async fn write_blob(
        &self,
        _ctx: &RequestContext,
        mut requests: BoxStream<'static, bspb::WriteRequest>,
    ) -> Result<bspb::WriteResponse> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let mut resource: Option<ResourceName> = None;
        let mut data = Vec::new();
        while let Some(message) = requests.next().await {
            if resource.is_none() {
                resource = Some(ResourceName::parse_upload(&message.resource_name)?.0);
            }
            data.extend_from_slice(&message.data);
            if message.finish_write {
                break;
            }
        }
        let resource =
            resource.ok_or_else(|| ProxyError::invalid_argument("empty write stream"))?;
        let committed_size = data.len() as i64;
        self.blobs.lock().insert(resource.digest().key(), data);
        Ok(bspb::WriteResponse { committed_size })
    }

    async fn query_write_status(
        &self,
        _ctx: &RequestContext,
        request: bspb::QueryWriteStatusRequest,
    ) -> Result<bspb::QueryWriteStatusResponse> {
        self.unary_calls.fetch_add(1, Ordering::SeqCst);
        let (resource, _) = ResourceName::parse_upload(&request.resource_name)?;
        match self.get(resource.digest()) {
            Some(data) => Ok(bspb::QueryWriteStatusResponse {
                committed_size: data.len() as i64,
                complete: true,
            }),
            None => Ok(bspb::QueryWriteStatusResponse {
                committed_size: 0,
                complete: false,
            }),
        }
    }
}

/// Records every atime flush
#[derive(Default)]
pub struct FakeAtimeSink {
    calls: AtomicU32,
    pub batches: Mutex<Vec<(CapturedHeaders, atimepb::UpdateAccessTimesRequest)>>,
}

impl FakeAtimeSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AtimeSink for FakeAtimeSink {
    async fn update_access_times(
        &self,
        headers: &CapturedHeaders,
        request: atimepb::UpdateAccessTimesRequest,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batches.lock().push((headers.clone(), request));
        Ok(())
    }
}

/// Records every hit flush; can be made to fail
#[derive(Default)]
pub struct FakeHitSink {
    calls: AtomicU32,
    pub batches: Mutex<Vec<(CapturedHeaders, hitpb::TrackRequest)>>,
    pub fail_with: Mutex<Option<tonic::Code>>,
}

impl FakeHitSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Total hit records delivered across all batches
    pub fn delivered(&self) -> usize {
        self.batches.lock().iter().map(|(_, r)| r.hits.len()).sum()
    }
}

#[async_trait]
impl HitSink for FakeHitSink {
    async fn track(&self, headers: &CapturedHeaders, request: hitpb::TrackRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = *self.fail_with.lock() {
            return Err(ProxyError::grpc("Track", tonic::Status::new(code, "injected")));
        }
        self.batches.lock().push((headers.clone(), request));
        Ok(())
    }
}

pub struct HarnessOptions {
    pub tree_caching: bool,
    pub store_max_blob_size: Option<u64>,
    pub atime: AtimeConfig,
    pub hits: HitTrackerConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            tree_caching: true,
            store_max_blob_size: None,
            atime: AtimeConfig {
                update_interval_ms: ATIME_INTERVAL.as_millis() as u64,
                max_pending_per_tenant: 1_000,
                max_per_update: 1_000,
                workers: 1,
                rpc_timeout_ms: 1_000,
            },
            hits: HitTrackerConfig {
                target: "grpc://telemetry:1985".to_string(),
                update_interval_ms: HIT_INTERVAL.as_millis() as u64,
                max_pending_hits_per_group: 1_000,
                max_hits_per_update: 1_000,
                workers: 1,
                rpc_timeout_ms: 1_000,
            },
        }
    }
}

pub struct Harness {
    pub proxy: CasProxy,
    pub bytestream: ByteStreamProxy,
    pub store: Arc<MemoryBlobStore>,
    pub remote: Arc<FakeRemote>,
    pub atime_sink: Arc<FakeAtimeSink>,
    pub hit_sink: Arc<FakeHitSink>,
    pub clock: Arc<FakeClock>,
    pub atime: Arc<AtimeUpdater>,
    pub hits: Arc<HitTrackerClient>,
    pub metrics: MetricsCollector,
}

/// Build a proxy over fakes and wait for the flush workers to park on
/// the fake clock
pub async fn harness(options: HarnessOptions) -> Harness {
    let store = Arc::new(match options.store_max_blob_size {
        Some(cap) => MemoryBlobStore::with_max_blob_size(cap),
        None => MemoryBlobStore::new(),
    });
    let remote = FakeRemote::new();
    let atime_sink = FakeAtimeSink::new();
    let hit_sink = FakeHitSink::new();
    let clock = FakeClock::new();
    let metrics = MetricsCollector::new();

    let atime = Arc::new(AtimeUpdater::new(
        atime_sink.clone(),
        clock.clone(),
        metrics.clone(),
        options.atime,
    ));
    let hits = Arc::new(HitTrackerClient::new(
        hit_sink.clone(),
        clock.clone(),
        metrics.clone(),
        options.hits,
    ));
    let hit_factory: Arc<dyn HitTrackerFactory> = hits.clone();

    let tree_cache = if options.tree_caching {
        Some(Arc::new(
            TreeCache::new(10_000, Duration::from_secs(900)).unwrap(),
        ))
    } else {
        None
    };

    let proxy = CasProxy::new(
        store.clone(),
        remote.clone(),
        atime.clone(),
        hit_factory.clone(),
        tree_cache,
        metrics.clone(),
    );
    let bytestream = ByteStreamProxy::new(
        store.clone(),
        remote.clone(),
        atime.clone(),
        hit_factory,
        metrics.clone(),
    );

    // Both flush workers must be parked on the clock before tests start
    // advancing it.
    assert!(
        wait_for(|| clock.sleeper_count() >= 2).await,
        "flush workers never parked"
    );

    Harness {
        proxy,
        bytestream,
        store,
        remote,
        atime_sink,
        hit_sink,
        clock,
        atime,
        hits,
        metrics,
    }
}

/// Build a harness whose hit tracking is disabled (no-op factory)
pub async fn harness_without_hit_tracking() -> (CasProxy, Arc<MemoryBlobStore>, Arc<FakeRemote>) {
    let store = Arc::new(MemoryBlobStore::new());
    let remote = FakeRemote::new();
    let clock = FakeClock::new();
    let metrics = MetricsCollector::new();
    let atime = Arc::new(AtimeUpdater::new(
        FakeAtimeSink::new(),
        clock.clone(),
        metrics.clone(),
        AtimeConfig::default(),
    ));
    let proxy = CasProxy::new(
        store.clone(),
        remote.clone(),
        atime,
        Arc::new(NoOpHitTrackerFactory),
        None,
        metrics,
    );
    (proxy, store, remote)
}

/// Exponential poll for a condition driven by a background task
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    let mut wait = Duration::from_millis(1);
    for _ in 0..12 {
        if condition() {
            return true;
        }
        tokio::time::sleep(wait).await;
        wait = (wait * 2).min(Duration::from_millis(100));
    }
    condition()
}

/// Advance past one flush tick and expect exactly one more atime RPC
pub async fn expect_atime_rpc(h: &Harness) {
    let before = h.atime_sink.calls();
    h.clock.advance(ATIME_INTERVAL + Duration::from_secs(1));
    assert!(
        wait_for(|| h.atime_sink.calls() == before + 1).await,
        "timed out waiting for remote atime update"
    );
}

/// Advance many flush ticks and expect no atime RPCs at all
pub async fn expect_no_atime_rpc(h: &Harness) {
    let before = h.atime_sink.calls();
    for _ in 0..10 {
        h.clock.advance(ATIME_INTERVAL + Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(before, h.atime_sink.calls(), "unexpected atime update");
}

pub fn ctx() -> RequestContext {
    RequestContext::anonymous()
}

pub fn skip_remote_ctx() -> RequestContext {
    RequestContext {
        skip_remote: true,
        ..RequestContext::anonymous()
    }
}

pub fn tenant_ctx(tenant: &str) -> RequestContext {
    RequestContext {
        tenant: tenant.to_string(),
        auth_headers: vec![("client-identity".to_string(), tenant.to_string())],
        ..RequestContext::anonymous()
    }
}

pub fn find_request(digests: &[&Digest]) -> reapi::FindMissingBlobsRequest {
    reapi::FindMissingBlobsRequest {
        instance_name: String::new(),
        blob_digests: digests.iter().map(|d| proto_digest(d)).collect(),
        digest_function: reapi::digest_function::Value::Sha256 as i32,
    }
}

pub fn read_request(digests: &[&Digest]) -> reapi::BatchReadBlobsRequest {
    reapi::BatchReadBlobsRequest {
        instance_name: String::new(),
        digests: digests.iter().map(|d| proto_digest(d)).collect(),
        acceptable_compressors: vec![reapi::compressor::Value::Identity as i32],
        digest_function: reapi::digest_function::Value::Sha256 as i32,
    }
}

pub fn update_request(blobs: &[&[u8]]) -> reapi::BatchUpdateBlobsRequest {
    reapi::BatchUpdateBlobsRequest {
        instance_name: String::new(),
        requests: blobs
            .iter()
            .map(|data| reapi::batch_update_blobs_request::Request {
                digest: Some(proto_digest(&digest_of(data))),
                data: data.to_vec(),
                compressor: reapi::compressor::Value::Identity as i32,
            })
            .collect(),
        digest_function: reapi::digest_function::Value::Sha256 as i32,
    }
}

pub fn proto_digest(digest: &Digest) -> reapi::Digest {
    reapi::Digest {
        hash: digest.hash.clone(),
        size_bytes: digest.size_bytes,
    }
}

/// Encode a directory and return (digest, bytes)
pub fn encode_directory(directory: &reapi::Directory) -> (Digest, Vec<u8>) {
    let bytes = directory.encode_to_vec();
    (digest_of(&bytes), bytes)
}

/// Build a perfect binary directory tree of the given depth; returns the
/// root digest and every directory blob in the tree
pub fn make_tree(depth: usize, label: &str) -> (Digest, Vec<(Digest, Vec<u8>)>) {
    assert!(depth >= 1);
    if depth == 1 {
        let leaf = reapi::Directory {
            files: vec![reapi::FileNode {
                name: format!("{label}.txt"),
                digest: Some(proto_digest(&digest_of(label.as_bytes()))),
                is_executable: false,
            }],
            directories: vec![],
            symlinks: vec![],
        };
        let (digest, bytes) = encode_directory(&leaf);
        return (digest.clone(), vec![(digest, bytes)]);
    }

    let (left_digest, mut left_blobs) = make_tree(depth - 1, &format!("{label}l"));
    let (right_digest, right_blobs) = make_tree(depth - 1, &format!("{label}r"));
    let root = reapi::Directory {
        files: vec![],
        directories: vec![
            reapi::DirectoryNode {
                name: "left".to_string(),
                digest: Some(proto_digest(&left_digest)),
            },
            reapi::DirectoryNode {
                name: "right".to_string(),
                digest: Some(proto_digest(&right_digest)),
            },
        ],
        symlinks: vec![],
    };
    let (root_digest, root_bytes) = encode_directory(&root);
    left_blobs.extend(right_blobs);
    left_blobs.push((root_digest.clone(), root_bytes));
    (root_digest, left_blobs)
}

/// Drain a GetTree stream into its directories
pub async fn collect_tree(
    stream: BoxStream<'static, std::result::Result<reapi::GetTreeResponse, tonic::Status>>,
) -> std::result::Result<Vec<reapi::Directory>, tonic::Status> {
    let mut stream = stream;
    let mut directories = Vec::new();
    while let Some(response) = stream.next().await {
        directories.extend(response?.directories);
    }
    Ok(directories)
}
