//! Byte-stream Read/Write proxying

mod common;

use bytes::Bytes;
use common::*;
use futures::StreamExt;
use sidecas_core::{DigestFunction, ResourceName};
use sidecas_proxy::bspb;
use sidecas_store::BlobStore;

fn read_req(resource: &ResourceName) -> bspb::ReadRequest {
    bspb::ReadRequest {
        resource_name: resource.download_string(),
        read_offset: 0,
        read_limit: 0,
    }
}

fn resource(data: &[u8]) -> ResourceName {
    ResourceName::cas("", digest_of(data), DigestFunction::Sha256)
}

async fn collect_read(
    stream: futures::stream::BoxStream<
        'static,
        std::result::Result<bspb::ReadResponse, tonic::Status>,
    >,
) -> std::result::Result<Vec<u8>, tonic::Status> {
    let mut stream = stream;
    let mut data = Vec::new();
    while let Some(chunk) = stream.next().await {
        data.extend(chunk?.data);
    }
    Ok(data)
}

fn write_requests(resource: &ResourceName, data: &[u8], chunk: usize) -> Vec<bspb::WriteRequest> {
    let name = resource.upload_string("11111111-2222-3333-4444-555555555555");
    let mut requests = Vec::new();
    let mut offset = 0usize;
    let chunks: Vec<&[u8]> = if data.is_empty() {
        vec![&data[0..0]]
    } else {
        data.chunks(chunk).collect()
    };
    for (i, piece) in chunks.iter().enumerate() {
        requests.push(bspb::WriteRequest {
            resource_name: if i == 0 { name.clone() } else { String::new() },
            write_offset: offset as i64,
            finish_write: i == chunks.len() - 1,
            data: piece.to_vec(),
        });
        offset += piece.len();
    }
    requests
}

fn inbound(
    requests: Vec<bspb::WriteRequest>,
) -> impl futures::Stream<Item = std::result::Result<bspb::WriteRequest, tonic::Status>> + Send + Unpin + 'static
{
    tokio_stream::iter(requests.into_iter().map(Ok))
}

#[tokio::test]
async fn test_read_local_short_circuit() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"hello byte stream";
    let rn = resource(data);
    h.store
        .put(rn.digest(), Bytes::from_static(data))
        .await
        .unwrap();

    let stream = h
        .bytestream
        .handle_read(&ctx(), None, read_req(&rn))
        .await
        .unwrap();
    let read = collect_read(stream).await.unwrap();

    assert_eq!(read, data);
    assert_eq!(h.remote.stream_calls(), 0);
    expect_atime_rpc(&h).await;
}

#[tokio::test]
async fn test_read_offset_and_limit() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"hello byte stream";
    let rn = resource(data);
    h.store
        .put(rn.digest(), Bytes::from_static(data))
        .await
        .unwrap();

    let request = bspb::ReadRequest {
        resource_name: rn.download_string(),
        read_offset: 6,
        read_limit: 4,
    };
    let stream = h
        .bytestream
        .handle_read(&ctx(), None, request)
        .await
        .unwrap();
    assert_eq!(collect_read(stream).await.unwrap(), b"byte");
}

#[tokio::test]
async fn test_read_fall_through_tees_into_store() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"remote only bytes";
    h.remote.insert(data);
    let rn = resource(data);

    let stream = h
        .bytestream
        .handle_read(&ctx(), None, read_req(&rn))
        .await
        .unwrap();
    let read = collect_read(stream).await.unwrap();

    assert_eq!(read, data);
    assert_eq!(h.remote.stream_calls(), 1);

    // The tee commits the blob locally once the stream finishes.
    assert!(wait_for(|| h.metrics.snapshot().write_throughs == 1).await);
    assert!(h.store.contains(rn.digest()).await);

    // Second read is local.
    h.remote.reset_calls();
    let stream = h
        .bytestream
        .handle_read(&ctx(), None, read_req(&rn))
        .await
        .unwrap();
    assert_eq!(collect_read(stream).await.unwrap(), data);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_read_skip_remote_miss_is_not_found() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"remote only bytes";
    h.remote.insert(data);
    let rn = resource(data);

    let err = h
        .bytestream
        .handle_read(&skip_remote_ctx(), None, read_req(&rn))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_write_tees_to_remote_and_store() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"streamed upload payload";
    let rn = resource(data);

    let response = h
        .bytestream
        .handle_write(&ctx(), None, inbound(write_requests(&rn, data, 5)))
        .await
        .unwrap();

    assert_eq!(response.committed_size, data.len() as i64);
    assert!(h.store.contains(rn.digest()).await);
    assert!(h.remote.contains(rn.digest()));
    assert_eq!(h.remote.stream_calls(), 1);
}

#[tokio::test]
async fn test_write_skip_remote_stays_local() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"local only upload";
    let rn = resource(data);

    let response = h
        .bytestream
        .handle_write(
            &skip_remote_ctx(),
            None,
            inbound(write_requests(&rn, data, 4)),
        )
        .await
        .unwrap();

    assert_eq!(response.committed_size, data.len() as i64);
    assert!(h.store.contains(rn.digest()).await);
    assert!(!h.remote.contains(rn.digest()));
    assert_eq!(h.remote.stream_calls(), 0);

    // skip-remote uploads are still accounted as write hits.
    assert_eq!(h.hits.pending(), 1);
}

#[tokio::test]
async fn test_write_rejects_bad_offset() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"payload";
    let rn = resource(data);

    let mut requests = write_requests(&rn, data, 3);
    requests[1].write_offset = 999;

    let err = h
        .bytestream
        .handle_write(&ctx(), None, inbound(requests))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_write_over_store_cap_fails() {
    let h = harness(HarnessOptions {
        store_max_blob_size: Some(8),
        ..Default::default()
    })
    .await;
    let data = b"this upload is larger than the cap";
    let rn = resource(data);

    let err = h
        .bytestream
        .handle_write(
            &skip_remote_ctx(),
            None,
            inbound(write_requests(&rn, data, 16)),
        )
        .await
        .unwrap_err();

    // The store's per-blob cap surfaces as the entry's failure instead
    // of a false success.
    assert_eq!(err.code(), tonic::Code::Internal);
    assert!(!h.store.contains(rn.digest()).await);
    assert_eq!(h.hits.pending(), 0);
}

#[tokio::test]
async fn test_write_rejects_mismatched_digest() {
    let h = harness(HarnessOptions::default()).await;
    let rn = resource(b"expected payload");

    let err = h
        .bytestream
        .handle_write(
            &skip_remote_ctx(),
            None,
            inbound(write_requests(&rn, b"different payload", 64)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
    assert!(!h.store.contains(rn.digest()).await);
}

#[tokio::test]
async fn test_query_write_status_local_and_remote() {
    let h = harness(HarnessOptions::default()).await;
    let data = b"present locally";
    let rn = resource(data);
    h.store
        .put(rn.digest(), Bytes::from_static(data))
        .await
        .unwrap();

    let request = bspb::QueryWriteStatusRequest {
        resource_name: rn.upload_string("11111111-2222-3333-4444-555555555555"),
    };
    let response = h
        .bytestream
        .handle_query_write_status(&ctx(), request)
        .await
        .unwrap();
    assert!(response.complete);
    assert_eq!(response.committed_size, data.len() as i64);

    // Unknown uploads fall through to the remote.
    let missing = resource(b"nowhere");
    let request = bspb::QueryWriteStatusRequest {
        resource_name: missing.upload_string("11111111-2222-3333-4444-555555555555"),
    };
    let response = h
        .bytestream
        .handle_query_write_status(&ctx(), request)
        .await
        .unwrap();
    assert!(!response.complete);
    assert_eq!(h.remote.unary_calls(), 1);
}
