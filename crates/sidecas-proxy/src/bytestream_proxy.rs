//! Byte-stream Read/Write proxying
//!
//! Reads short-circuit through the local store when the named blob is
//! present; otherwise the remote stream is proxied and, for whole-blob
//! reads, teed back into the local store. Writes tee to the local store
//! and stream through to the remote unless skip-remote.

use crate::atime::AtimeUpdater;
use crate::bspb;
use crate::cas_proxy::read_local_verified;
use crate::hit_tracker::HitTrackerFactory;
use crate::reapi;
use crate::remote::RemoteCas;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use sidecas_core::{
    Digest, MetricsCollector, ProxyError, RequestContext, ResourceName, Result,
};
use sidecas_store::BlobStore;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{instrument, warn};

/// Chunk size for streaming local blobs to the client
const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// The byte-stream proxy core
pub struct ByteStreamProxy {
    store: Arc<dyn BlobStore>,
    remote: Arc<dyn RemoteCas>,
    atime: Arc<AtimeUpdater>,
    hits: Arc<dyn HitTrackerFactory>,
    metrics: MetricsCollector,
}

impl ByteStreamProxy {
    pub fn new(
        store: Arc<dyn BlobStore>,
        remote: Arc<dyn RemoteCas>,
        atime: Arc<AtimeUpdater>,
        hits: Arc<dyn HitTrackerFactory>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            store,
            remote,
            atime,
            hits,
            metrics,
        }
    }

    /// Serve a Read: local short-circuit, otherwise proxy the remote
    /// stream with write-back for whole-blob reads
    #[instrument(skip_all, fields(resource = %request.resource_name, skip_remote = ctx.skip_remote))]
    pub async fn handle_read(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        request: bspb::ReadRequest,
    ) -> Result<BoxStream<'static, std::result::Result<bspb::ReadResponse, tonic::Status>>> {
        if request.read_offset < 0 || request.read_limit < 0 {
            return Err(ProxyError::invalid_argument(
                "read_offset and read_limit must be non-negative",
            ));
        }
        let resource = ResourceName::parse_download(&request.resource_name)?;
        let digest = resource.digest().clone();
        let function = resource.digest_function();

        if let Some(bytes) =
            read_local_verified(self.store.as_ref(), &self.metrics, &digest, function).await?
        {
            self.metrics.record_local_hits(1);
            let offset = request.read_offset as usize;
            if offset > bytes.len() {
                return Err(ProxyError::invalid_argument(format!(
                    "read_offset {} is past the end of {}",
                    offset, digest
                )));
            }
            let mut slice = bytes.slice(offset..);
            if request.read_limit > 0 {
                let limit = (request.read_limit as usize).min(slice.len());
                slice = slice.slice(..limit);
            }

            self.atime.enqueue(ctx, resource.clone()).await;
            let tracker = self.hits.cas_tracker(ctx, metadata);
            tracker
                .track_download(resource)
                .close_with_bytes_transferred(slice.len() as i64)
                .await;

            let chunks: Vec<_> = slice
                .chunks(READ_CHUNK_SIZE)
                .map(|chunk| Ok(bspb::ReadResponse {
                    data: chunk.to_vec(),
                }))
                .collect();
            return Ok(tokio_stream::iter(chunks).boxed());
        }

        self.metrics.record_local_misses(1);
        if ctx.skip_remote {
            return Err(ProxyError::not_found(digest.to_string()));
        }

        let whole_blob = request.read_offset == 0 && request.read_limit == 0;
        let remote_stream = self.remote.read_blob(ctx, request).await?;

        if !whole_blob {
            return Ok(remote_stream
                .map(|item| item.map_err(tonic::Status::from))
                .boxed());
        }

        // Tee the remote stream: forward chunks as they arrive and commit
        // the full blob to the local store at the end.
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let store = Arc::clone(&self.store);
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut remote_stream = remote_stream;
            let cap = store.max_blob_size().unwrap_or(u64::MAX);
            let mut buffer = Vec::new();
            let mut complete = true;
            while let Some(item) = remote_stream.next().await {
                match item {
                    Ok(response) => {
                        if (buffer.len() + response.data.len()) as u64 <= cap {
                            buffer.extend_from_slice(&response.data);
                        } else {
                            complete = false;
                        }
                        if tx.send(Ok(response)).await.is_err() {
                            // Client went away; keep what we have.
                            complete = false;
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(tonic::Status::from(e))).await;
                        return;
                    }
                }
            }
            if complete && Digest::of(&buffer, function) == digest {
                match store.put(&digest, Bytes::from(buffer)).await {
                    Ok(()) => metrics.record_write_throughs(1),
                    Err(e) => warn!(digest = %digest, error = %e, "write-back failed"),
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Serve a Write: tee chunks to the remote as they arrive and commit
    /// the blob locally once the stream finishes
    #[instrument(skip_all, fields(skip_remote = ctx.skip_remote))]
    pub async fn handle_write<S>(
        &self,
        ctx: &RequestContext,
        metadata: Option<reapi::RequestMetadata>,
        inbound: S,
    ) -> Result<bspb::WriteResponse>
    where
        S: Stream<Item = std::result::Result<bspb::WriteRequest, tonic::Status>>
            + Send
            + Unpin
            + 'static,
    {
        if !ctx.may_write {
            return Err(ProxyError::permission_denied(
                "cache-write capability required",
            ));
        }

        let mut inbound = inbound;
        let first = inbound
            .next()
            .await
            .ok_or_else(|| ProxyError::invalid_argument("empty write stream"))?
            .map_err(|s| ProxyError::grpc("ByteStream.Write inbound", s))?;
        let (resource, _upload_id) = ResourceName::parse_upload(&first.resource_name)?;
        let digest = resource.digest().clone();
        let function = resource.digest_function();

        let tracker = self.hits.cas_tracker(ctx, metadata);
        let timer = tracker.track_upload(resource.clone());

        // Start the remote write up front so chunks stream through as
        // they are received.
        let mut remote_call = if ctx.skip_remote {
            None
        } else {
            let (tx, rx) = tokio::sync::mpsc::channel::<bspb::WriteRequest>(16);
            let remote = Arc::clone(&self.remote);
            let remote_ctx = ctx.clone();
            let handle = tokio::spawn(async move {
                remote
                    .write_blob(&remote_ctx, ReceiverStream::new(rx).boxed())
                    .await
            });
            Some((tx, handle))
        };

        let mut buffer: Vec<u8> = Vec::new();
        let mut finished = false;
        // Re-key the upstream upload under a proxy-owned session id.
        let mut message = first;
        message.resource_name = resource.upload_string(&uuid::Uuid::new_v4().to_string());
        loop {
            if message.write_offset != buffer.len() as i64 {
                return Err(ProxyError::invalid_argument(format!(
                    "write_offset {} does not match received byte count {}",
                    message.write_offset,
                    buffer.len()
                )));
            }
            buffer.extend_from_slice(&message.data);
            let finish_write = message.finish_write;
            if let Some((tx, _)) = &remote_call {
                if tx.send(message).await.is_err() {
                    // The remote call ended early; its result carries the
                    // error.
                    break;
                }
            }
            if finish_write {
                finished = true;
                break;
            }
            match inbound.next().await {
                Some(Ok(next)) => message = next,
                Some(Err(s)) => return Err(ProxyError::grpc("ByteStream.Write inbound", s)),
                None => break,
            }
        }

        let committed_size = match remote_call.take() {
            Some((tx, handle)) => {
                drop(tx);
                let response = handle
                    .await
                    .map_err(|e| ProxyError::internal(format!("remote write task failed: {e}")))??;
                response.committed_size
            }
            None => buffer.len() as i64,
        };

        if finished {
            if Digest::of(&buffer, function) != digest {
                return Err(ProxyError::invalid_argument(format!(
                    "uploaded bytes do not hash to {digest}"
                )));
            }
            let len = buffer.len() as i64;
            self.store.put(&digest, Bytes::from(buffer)).await?;
            timer.close_with_bytes_transferred(len).await;
        }

        Ok(bspb::WriteResponse { committed_size })
    }

    /// QueryWriteStatus: answer from the local store, falling back to the
    /// remote for unknown uploads
    #[instrument(skip_all, fields(resource = %request.resource_name, skip_remote = ctx.skip_remote))]
    pub async fn handle_query_write_status(
        &self,
        ctx: &RequestContext,
        request: bspb::QueryWriteStatusRequest,
    ) -> Result<bspb::QueryWriteStatusResponse> {
        let (resource, _) = ResourceName::parse_upload(&request.resource_name)?;
        let digest: &Digest = resource.digest();
        if self.store.contains(digest).await {
            return Ok(bspb::QueryWriteStatusResponse {
                committed_size: digest.size_bytes,
                complete: true,
            });
        }
        if ctx.skip_remote {
            return Ok(bspb::QueryWriteStatusResponse {
                committed_size: 0,
                complete: false,
            });
        }
        self.remote.query_write_status(ctx, request).await
    }
}

/// tonic service wrapper exposing the byte-stream proxy on the wire
#[derive(Clone)]
pub struct ByteStreamService(pub Arc<ByteStreamProxy>);

#[tonic::async_trait]
impl bspb::byte_stream_server::ByteStream for ByteStreamService {
    type ReadStream = BoxStream<'static, std::result::Result<bspb::ReadResponse, tonic::Status>>;

    async fn read(
        &self,
        request: tonic::Request<bspb::ReadRequest>,
    ) -> std::result::Result<tonic::Response<Self::ReadStream>, tonic::Status> {
        let (ctx, metadata) = crate::convert::context_from_request(&request);
        let stream = self
            .0
            .handle_read(&ctx, metadata, request.into_inner())
            .await?;
        Ok(tonic::Response::new(stream))
    }

    async fn write(
        &self,
        request: tonic::Request<tonic::Streaming<bspb::WriteRequest>>,
    ) -> std::result::Result<tonic::Response<bspb::WriteResponse>, tonic::Status> {
        let (ctx, metadata) = crate::convert::context_from_request(&request);
        let response = self
            .0
            .handle_write(&ctx, metadata, request.into_inner())
            .await?;
        Ok(tonic::Response::new(response))
    }

    async fn query_write_status(
        &self,
        request: tonic::Request<bspb::QueryWriteStatusRequest>,
    ) -> std::result::Result<tonic::Response<bspb::QueryWriteStatusResponse>, tonic::Status> {
        let (ctx, _) = crate::convert::context_from_request(&request);
        let response = self
            .0
            .handle_query_write_status(&ctx, request.into_inner())
            .await?;
        Ok(tonic::Response::new(response))
    }
}
