//! The CAS proxy request path
//!
//! Serves the REAPI ContentAddressableStorage surface against the local
//! blob store with remote fall-through. Local hits feed the atime and
//! hit-tracking pipelines; remote reads are written back to the local
//! store.

use crate::atime::AtimeUpdater;
use crate::convert::{
    context_from_request, digest_function_from_proto, digest_function_to_proto, digest_to_proto,
    proto_to_digest, status_from_error, status_ok,
};
use crate::hit_tracker::HitTrackerFactory;
use crate::reapi;
use crate::remote::RemoteCas;
use crate::tree_cache::TreeCache;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use prost::Message;
use sidecas_core::{
    Digest, DigestFunction, MetricsCollector, ProxyError, RequestContext, ResourceName, Result,
};
use sidecas_store::BlobStore;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{instrument, warn};

/// Directories per GetTree response message when the client does not ask
/// for a page size
const DEFAULT_TREE_PAGE_SIZE: usize = 1000;

/// The CAS proxy core
///
/// Stateless per request; all coordination lives in the store, the tree
/// cache, and the background pipelines.
pub struct CasProxy {
    store: Arc<dyn BlobStore>,
    remote: Arc<dyn RemoteCas>,
    atime: Arc<AtimeUpdater>,
    hits: Arc<dyn HitTrackerFactory>,
    tree_cache: Option<Arc<TreeCache>>,
    metrics: MetricsCollector,
}

impl CasProxy {
    pub fn new(
        store: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteCas>,
        atime: Arc<AtimeUpdater>,
        hits: Arc<dyn HitTrackerFactory>,
        tree_cache: Option<Arc<TreeCache>>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            remote,
            atime,
            hits,
            tree_cache,
            metrics,
        }
    }

    async fn read_local_verified(
        &self,
        digest: &Digest,
        function: DigestFunction,
    ) -> Result<Option<Bytes>> {
        read_local_verified(self.store.as_ref(), &self.metrics, digest, function).await
    }

    /// Write a blob back to the local store if it fits the store's cap
    async fn write_back(&self, digest: &Digest, data: &[u8]) {
        if let Some(cap) = self.store.max_blob_size() {
            if data.len() as u64 > cap {
                return;
            }
        }
        match self.store.put(digest, Bytes::copy_from_slice(data)).await {
            Ok(()) => self.metrics.record_write_throughs(1),
            Err(e) => warn!(digest = %digest, error = %e, "write-back to local store failed"),
        }
    }

    /// FindMissingBlobs: local-only presence under skip-remote, otherwise
    /// the remote answers authoritatively
    ///
    /// The local store is deliberately not consulted on the remote path:
    /// a blob present locally but absent upstream still needs uploading,
    /// and answering "not missing" would prevent that.
    #[instrument(skip_all, fields(digest_count = request.blob_digests.len(), skip_remote = ctx.skip_remote))]
    pub async fn find_missing(
        &self,
        ctx: &RequestContext,
        request: reapi::FindMissingBlobsRequest,
    ) -> Result<reapi::FindMissingBlobsResponse> {
        let function = digest_function_from_proto(request.digest_function)?;
        let digests: Vec<Digest> = request
            .blob_digests
            .iter()
            .map(|d| proto_to_digest(d, function))
            .collect::<Result<_>>()?;

        if !ctx.skip_remote {
            return self.remote.find_missing_blobs(ctx, request).await;
        }

        let mut missing = Vec::new();
        let mut seen = HashSet::new();
        for digest in &digests {
            if !seen.insert(digest.key()) {
                continue;
            }
            if !self.store.contains(digest).await {
                missing.push(digest_to_proto(digest));
            }
        }
        Ok(reapi::FindMissingBlobsResponse {
            missing_blob_digests: missing,
        })
    }

    /// BatchReadBlobs: local first, then one batched remote call for the
    /// misses, written through to the local store
    #[instrument(skip_all, fields(digest_count = request.digests.len(), skip_remote = ctx.skip_remote))]
    pub async fn batch_read(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        request: reapi::BatchReadBlobsRequest,
    ) -> Result<reapi::BatchReadBlobsResponse> {
        let function = digest_function_from_proto(request.digest_function)?;
        let identity = reapi::compressor::Value::Identity as i32;
        if !request.acceptable_compressors.is_empty()
            && !request.acceptable_compressors.contains(&identity)
        {
            return Err(ProxyError::invalid_argument(
                "only identity compression is supported",
            ));
        }
        let digests: Vec<Digest> = request
            .digests
            .iter()
            .map(|d| proto_to_digest(d, function))
            .collect::<Result<_>>()?;

        let tracker = self.hits.cas_tracker(ctx, metadata);

        // Local pass, once per unique digest.
        let mut local: HashMap<String, Bytes> = HashMap::new();
        let mut missing: Vec<Digest> = Vec::new();
        let mut missing_keys: HashSet<String> = HashSet::new();
        for digest in &digests {
            let key = digest.key();
            if local.contains_key(&key) || missing_keys.contains(&key) {
                continue;
            }
            match self.read_local_verified(digest, function).await? {
                Some(bytes) => {
                    self.metrics.record_local_hits(1);
                    let resource =
                        ResourceName::cas(&request.instance_name, digest.clone(), function);
                    self.atime.enqueue(ctx, resource.clone()).await;
                    tracker
                        .track_download(resource)
                        .close_with_bytes_transferred(bytes.len() as i64)
                        .await;
                    local.insert(key, bytes);
                }
                None => {
                    self.metrics.record_local_misses(1);
                    missing_keys.insert(key);
                    missing.push(digest.clone());
                }
            }
        }

        // Remote pass: the whole miss set in a single batched call.
        let mut from_remote: HashMap<String, reapi::batch_read_blobs_response::Response> =
            HashMap::new();
        if !missing.is_empty() && !ctx.skip_remote {
            let remote_request = reapi::BatchReadBlobsRequest {
                instance_name: request.instance_name.clone(),
                digests: missing.iter().map(digest_to_proto).collect(),
                acceptable_compressors: request.acceptable_compressors.clone(),
                digest_function: request.digest_function,
            };
            let response = self.remote.batch_read_blobs(ctx, remote_request).await?;
            for resp in response.responses {
                let Some(proto_digest) = resp.digest.clone() else {
                    continue;
                };
                let key = format!("{}/{}", proto_digest.hash, proto_digest.size_bytes);
                let ok = resp.status.as_ref().map_or(true, |s| s.code == 0);
                if !ok {
                    from_remote.insert(key, resp);
                    continue;
                }
                let digest = proto_to_digest(&proto_digest, function)?;
                if Digest::of(&resp.data, function) != digest {
                    // Never hand out bytes that hash differently than
                    // requested.
                    let err = ProxyError::internal(format!(
                        "remote returned bytes with mismatched hash for {digest}"
                    ));
                    from_remote.insert(
                        key,
                        reapi::batch_read_blobs_response::Response {
                            digest: Some(proto_digest),
                            data: vec![],
                            status: Some(status_from_error(&err)),
                            compressor: identity,
                        },
                    );
                    continue;
                }
                self.write_back(&digest, &resp.data).await;
                from_remote.insert(key, resp);
            }
        }

        // Assemble responses in request order, duplicates preserved.
        let responses = digests
            .iter()
            .map(|digest| {
                let key = digest.key();
                if let Some(bytes) = local.get(&key) {
                    reapi::batch_read_blobs_response::Response {
                        digest: Some(digest_to_proto(digest)),
                        data: bytes.to_vec(),
                        status: Some(status_ok()),
                        compressor: identity,
                    }
                } else if let Some(resp) = from_remote.get(&key) {
                    resp.clone()
                } else {
                    let err = ProxyError::not_found(digest.to_string());
                    reapi::batch_read_blobs_response::Response {
                        digest: Some(digest_to_proto(digest)),
                        data: vec![],
                        status: Some(status_from_error(&err)),
                        compressor: identity,
                    }
                }
            })
            .collect();

        Ok(reapi::BatchReadBlobsResponse { responses })
    }

    /// BatchUpdateBlobs: write locally, forward to the remote in one
    /// batched call unless skip-remote
    ///
    /// Remote per-entry statuses win for entries that succeeded locally;
    /// a remote failure never rolls back the local write.
    #[instrument(skip_all, fields(blob_count = request.requests.len(), skip_remote = ctx.skip_remote))]
    pub async fn batch_update(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        request: reapi::BatchUpdateBlobsRequest,
    ) -> Result<reapi::BatchUpdateBlobsResponse> {
        if !ctx.may_write {
            return Err(ProxyError::permission_denied(
                "cache-write capability required",
            ));
        }
        let function = digest_function_from_proto(request.digest_function)?;
        let tracker = self.hits.cas_tracker(ctx, metadata);

        let mut statuses: Vec<(reapi::Digest, crate::proto::google::rpc::Status)> =
            Vec::with_capacity(request.requests.len());
        for entry in &request.requests {
            let Some(proto_digest) = entry.digest.clone() else {
                let err = ProxyError::invalid_argument("request is missing a digest");
                statuses.push((reapi::Digest::default(), status_from_error(&err)));
                continue;
            };
            let status = match self
                .update_one(tracker.as_ref(), &request.instance_name, &proto_digest, entry, function)
                .await
            {
                Ok(()) => status_ok(),
                Err(e) => status_from_error(&e),
            };
            statuses.push((proto_digest, status));
        }

        if !ctx.skip_remote {
            let response = self.remote.batch_update_blobs(ctx, request).await?;
            let remote_statuses: HashMap<String, crate::proto::google::rpc::Status> = response
                .responses
                .into_iter()
                .filter_map(|resp| {
                    let digest = resp.digest?;
                    Some((
                        format!("{}/{}", digest.hash, digest.size_bytes),
                        resp.status.unwrap_or_else(status_ok),
                    ))
                })
                .collect();
            for (digest, status) in statuses.iter_mut() {
                if status.code != tonic::Code::Ok as i32 {
                    continue;
                }
                let key = format!("{}/{}", digest.hash, digest.size_bytes);
                if let Some(remote_status) = remote_statuses.get(&key) {
                    *status = remote_status.clone();
                }
            }
        }

        Ok(reapi::BatchUpdateBlobsResponse {
            responses: statuses
                .into_iter()
                .map(
                    |(digest, status)| reapi::batch_update_blobs_response::Response {
                        digest: Some(digest),
                        status: Some(status),
                    },
                )
                .collect(),
        })
    }

    async fn update_one(
        &self,
        tracker: &dyn crate::hit_tracker::HitTracker,
        instance_name: &str,
        proto_digest: &reapi::Digest,
        entry: &reapi::batch_update_blobs_request::Request,
        function: DigestFunction,
    ) -> Result<()> {
        if entry.compressor != reapi::compressor::Value::Identity as i32 {
            return Err(ProxyError::invalid_argument(
                "only identity compression is supported",
            ));
        }
        let digest = proto_to_digest(proto_digest, function)?;
        if Digest::of(&entry.data, function) != digest {
            return Err(ProxyError::invalid_argument(format!(
                "data does not hash to the request digest {digest}"
            )));
        }
        let resource = ResourceName::cas(instance_name, digest.clone(), function);
        let timer = tracker.track_upload(resource);
        self.store
            .put(&digest, Bytes::copy_from_slice(&entry.data))
            .await?;
        // Only skip-remote uploads bypass the backing cache's own
        // accounting; the timer is a no-op otherwise.
        timer
            .close_with_bytes_transferred(entry.data.len() as i64)
            .await;
        Ok(())
    }

    /// GetTree: serve from the tree cache and local store, with one
    /// batched unary remote read per tree level for anything missing
    ///
    /// With the cache disabled (and remote reachable), the call is a
    /// single pass-through streaming RPC.
    #[instrument(skip_all, fields(skip_remote = ctx.skip_remote))]
    pub async fn get_tree(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        request: reapi::GetTreeRequest,
    ) -> Result<BoxStream<'static, std::result::Result<reapi::GetTreeResponse, tonic::Status>>>
    {
        let function = digest_function_from_proto(request.digest_function)?;
        if !request.page_token.is_empty() {
            return Err(ProxyError::invalid_argument(
                "page tokens are not supported",
            ));
        }
        let root = request
            .root_digest
            .as_ref()
            .ok_or_else(|| ProxyError::invalid_argument("root_digest is required"))?;
        let root = proto_to_digest(root, function)?;

        if self.tree_cache.is_none() && !ctx.skip_remote {
            let stream = self.remote.get_tree(ctx, request).await?;
            return Ok(stream.map(|item| item.map_err(tonic::Status::from)).boxed());
        }

        let directories = self
            .assemble_tree(ctx, metadata, &request.instance_name, root, function)
            .await?;
        let page_size = if request.page_size > 0 {
            request.page_size as usize
        } else {
            DEFAULT_TREE_PAGE_SIZE
        };
        let responses: Vec<std::result::Result<reapi::GetTreeResponse, tonic::Status>> =
            directories
                .chunks(page_size)
                .map(|chunk| {
                    Ok(reapi::GetTreeResponse {
                        directories: chunk.to_vec(),
                        next_page_token: String::new(),
                    })
                })
                .collect();
        Ok(tokio_stream::iter(responses).boxed())
    }

    /// Resolve the whole tree breadth-first: tree cache, then local
    /// store, then one batched remote read per level
    async fn assemble_tree(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        instance_name: &str,
        root: Digest,
        function: DigestFunction,
    ) -> Result<Vec<reapi::Directory>> {
        let tracker = self.hits.cas_tracker(ctx, metadata);
        let root_resource = ResourceName::cas(instance_name, root.clone(), function);
        let timer = tracker.track_download(root_resource);

        let mut result = Vec::new();
        let mut level = vec![root.clone()];
        let mut visited: HashSet<String> = HashSet::from([root.key()]);
        let mut local_bytes = 0i64;

        while !level.is_empty() {
            let mut resolved: HashMap<String, reapi::Directory> = HashMap::new();
            let mut missing: Vec<Digest> = Vec::new();

            for digest in &level {
                if let Some(cache) = &self.tree_cache {
                    if let Some(directory) = cache.get(digest) {
                        self.metrics.record_tree_cache_hits(1);
                        resolved.insert(digest.key(), directory);
                        continue;
                    }
                    self.metrics.record_tree_cache_misses(1);
                }
                match self.read_local_verified(digest, function).await? {
                    Some(bytes) => {
                        let directory = decode_directory(digest, &bytes)?;
                        if let Some(cache) = &self.tree_cache {
                            cache.insert(digest, directory.clone());
                        }
                        self.atime
                            .enqueue(
                                ctx,
                                ResourceName::cas(instance_name, digest.clone(), function),
                            )
                            .await;
                        local_bytes += bytes.len() as i64;
                        resolved.insert(digest.key(), directory);
                    }
                    None => missing.push(digest.clone()),
                }
            }

            if !missing.is_empty() {
                if ctx.skip_remote {
                    return Err(ProxyError::not_found(missing[0].to_string()));
                }
                let remote_request = reapi::BatchReadBlobsRequest {
                    instance_name: instance_name.to_string(),
                    digests: missing.iter().map(digest_to_proto).collect(),
                    acceptable_compressors: vec![],
                    digest_function: digest_function_to_proto(function),
                };
                let response = self.remote.batch_read_blobs(ctx, remote_request).await?;
                for resp in response.responses {
                    let Some(proto_digest) = &resp.digest else {
                        continue;
                    };
                    let ok = resp.status.as_ref().map_or(true, |s| s.code == 0);
                    if !ok {
                        return Err(ProxyError::not_found(format!(
                            "{}/{}",
                            proto_digest.hash, proto_digest.size_bytes
                        )));
                    }
                    let digest = proto_to_digest(proto_digest, function)?;
                    let directory = decode_directory(&digest, &resp.data)?;
                    // Cache the directory blob locally before inserting
                    // into the tree cache.
                    self.write_back(&digest, &resp.data).await;
                    if let Some(cache) = &self.tree_cache {
                        cache.insert(&digest, directory.clone());
                    }
                    resolved.insert(digest.key(), directory);
                }
                for digest in &missing {
                    if !resolved.contains_key(&digest.key()) {
                        return Err(ProxyError::not_found(digest.to_string()));
                    }
                }
            }

            let mut next = Vec::new();
            for digest in &level {
                let directory = resolved.remove(&digest.key()).ok_or_else(|| {
                    ProxyError::internal(format!("directory {digest} resolved twice or not at all"))
                })?;
                for child in &directory.directories {
                    let Some(child_digest) = &child.digest else {
                        continue;
                    };
                    let child_digest = proto_to_digest(child_digest, function)?;
                    if visited.insert(child_digest.key()) {
                        next.push(child_digest);
                    }
                }
                result.push(directory);
            }
            level = next;
        }

        if local_bytes > 0 {
            timer.close_with_bytes_transferred(local_bytes).await;
        }
        Ok(result)
    }
}

/// Read a blob from the local store, verifying its content hash
///
/// Bytes that hash differently than their digest violate content
/// addressing; the entry is deleted and the read treated as a miss.
pub(crate) async fn read_local_verified(
    store: &dyn BlobStore,
    metrics: &MetricsCollector,
    digest: &Digest,
    function: DigestFunction,
) -> Result<Option<Bytes>> {
    let Some(bytes) = store.get(digest).await? else {
        return Ok(None);
    };
    if Digest::of(&bytes, function) == *digest {
        return Ok(Some(bytes));
    }
    warn!(digest = %digest, "local store returned bytes with mismatched hash, deleting entry");
    metrics.record_corrupt_entries_repaired(1);
    let _ = store.delete(digest).await;
    Ok(None)
}

fn decode_directory(digest: &Digest, bytes: &[u8]) -> Result<reapi::Directory> {
    reapi::Directory::decode(bytes).map_err(|e| {
        ProxyError::invalid_argument(format!("blob {digest} is not a Directory message: {e}"))
    })
}

/// tonic service wrapper exposing the proxy on the wire
#[derive(Clone)]
pub struct CasService(pub Arc<CasProxy>);

#[tonic::async_trait]
impl reapi::content_addressable_storage_server::ContentAddressableStorage for CasService {
    async fn find_missing_blobs(
        &self,
        request: tonic::Request<reapi::FindMissingBlobsRequest>,
    ) -> std::result::Result<tonic::Response<reapi::FindMissingBlobsResponse>, tonic::Status> {
        let (ctx, _) = context_from_request(&request);
        let response = self.0.find_missing(&ctx, request.into_inner()).await?;
        Ok(tonic::Response::new(response))
    }

    async fn batch_update_blobs(
        &self,
        request: tonic::Request<reapi::BatchUpdateBlobsRequest>,
    ) -> std::result::Result<tonic::Response<reapi::BatchUpdateBlobsResponse>, tonic::Status> {
        let (ctx, metadata) = context_from_request(&request);
        let response = self
            .0
            .batch_update(&ctx, metadata, request.into_inner())
            .await?;
        Ok(tonic::Response::new(response))
    }

    async fn batch_read_blobs(
        &self,
        request: tonic::Request<reapi::BatchReadBlobsRequest>,
    ) -> std::result::Result<tonic::Response<reapi::BatchReadBlobsResponse>, tonic::Status> {
        let (ctx, metadata) = context_from_request(&request);
        let response = self
            .0
            .batch_read(&ctx, metadata, request.into_inner())
            .await?;
        Ok(tonic::Response::new(response))
    }

    type GetTreeStream = BoxStream<'static, std::result::Result<reapi::GetTreeResponse, tonic::Status>>;

    async fn get_tree(
        &self,
        request: tonic::Request<reapi::GetTreeRequest>,
    ) -> std::result::Result<tonic::Response<Self::GetTreeStream>, tonic::Status> {
        let (ctx, metadata) = context_from_request(&request);
        let stream = self.0.get_tree(&ctx, metadata, request.into_inner()).await?;
        Ok(tonic::Response::new(stream))
    }
}
