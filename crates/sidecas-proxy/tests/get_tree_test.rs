//! GetTree tree-cache semantics and remote RPC accounting

mod common;

use bytes::Bytes;
use common::*;
use sidecas_core::Digest;
use sidecas_proxy::reapi;
use sidecas_store::BlobStore;

fn tree_request(root: &Digest) -> reapi::GetTreeRequest {
    reapi::GetTreeRequest {
        instance_name: String::new(),
        root_digest: Some(proto_digest(root)),
        page_size: 0,
        page_token: String::new(),
        digest_function: reapi::digest_function::Value::Sha256 as i32,
    }
}

async fn seed_store(h: &Harness, blobs: &[(Digest, Vec<u8>)]) {
    for (digest, bytes) in blobs {
        h.store
            .put(digest, Bytes::from(bytes.clone()))
            .await
            .unwrap();
    }
}

fn seed_remote(h: &Harness, blobs: &[(Digest, Vec<u8>)]) {
    for (_, bytes) in blobs {
        h.remote.insert(bytes);
    }
}

#[tokio::test]
async fn test_remote_tree_fetched_level_by_level_then_cached() {
    let h = harness(HarnessOptions::default()).await;
    let (root, blobs) = make_tree(4, "t");
    seed_remote(&h, &blobs);

    // The tree has 4 levels, so expect 4 unary requests and no
    // streaming pass-through.
    let directories = collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root)).await.unwrap())
        .await
        .unwrap();
    assert_eq!(directories.len(), blobs.len());
    assert_eq!(h.remote.unary_calls(), 4);
    assert_eq!(h.remote.stream_calls(), 0);

    // Second call: fully served from the tree cache.
    h.remote.reset_calls();
    let directories = collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root)).await.unwrap())
        .await
        .unwrap();
    assert_eq!(directories.len(), blobs.len());
    assert_eq!(h.remote.unary_calls(), 0);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_caching_disabled_streams_through() {
    let h = harness(HarnessOptions {
        tree_caching: false,
        ..Default::default()
    })
    .await;
    let (root, blobs) = make_tree(4, "t");
    seed_remote(&h, &blobs);

    for _ in 0..2 {
        h.remote.reset_calls();
        let directories =
            collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root)).await.unwrap())
                .await
                .unwrap();
        assert_eq!(directories.len(), blobs.len());
        // One streaming RPC per call, every time.
        assert_eq!(h.remote.unary_calls(), 0);
        assert_eq!(h.remote.stream_calls(), 1);
    }
}

#[tokio::test]
async fn test_local_tree_serves_without_remote() {
    let h = harness(HarnessOptions::default()).await;
    let (root, blobs) = make_tree(3, "t");
    seed_store(&h, &blobs).await;

    let directories = collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root)).await.unwrap())
        .await
        .unwrap();
    assert_eq!(directories.len(), blobs.len());
    assert_eq!(h.remote.unary_calls(), 0);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_local_subtrees_remote_root() {
    let h = harness(HarnessOptions::default()).await;

    // Two subtrees on the proxy, the root only on the remote.
    let (first, first_blobs) = make_tree(3, "a");
    let (second, second_blobs) = make_tree(3, "b");
    seed_store(&h, &first_blobs).await;
    seed_store(&h, &second_blobs).await;

    let root = reapi::Directory {
        files: vec![],
        directories: vec![
            reapi::DirectoryNode {
                name: "first".to_string(),
                digest: Some(proto_digest(&first)),
            },
            reapi::DirectoryNode {
                name: "second".to_string(),
                digest: Some(proto_digest(&second)),
            },
        ],
        symlinks: vec![],
    };
    let (root_digest, root_bytes) = encode_directory(&root);
    h.remote.insert(&root_bytes);

    // Only the root node is read from the remote.
    let directories =
        collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root_digest)).await.unwrap())
            .await
            .unwrap();
    assert_eq!(
        directories.len(),
        1 + first_blobs.len() + second_blobs.len()
    );
    assert_eq!(h.remote.unary_calls(), 1);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_remote_subtrees_local_root() {
    let h = harness(HarnessOptions::default()).await;

    // The root on the proxy, both depth-3 subtrees only on the remote.
    let (first, first_blobs) = make_tree(3, "a");
    let (second, second_blobs) = make_tree(3, "b");
    seed_remote(&h, &first_blobs);
    seed_remote(&h, &second_blobs);

    let root = reapi::Directory {
        files: vec![],
        directories: vec![
            reapi::DirectoryNode {
                name: "first".to_string(),
                digest: Some(proto_digest(&first)),
            },
            reapi::DirectoryNode {
                name: "second".to_string(),
                digest: Some(proto_digest(&second)),
            },
        ],
        symlinks: vec![],
    };
    let (root_digest, root_bytes) = encode_directory(&root);
    h.store
        .put(&root_digest, Bytes::from(root_bytes))
        .await
        .unwrap();

    // The subtrees are fetched level by level; the root is not.
    let directories =
        collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root_digest)).await.unwrap())
            .await
            .unwrap();
    assert_eq!(
        directories.len(),
        1 + first_blobs.len() + second_blobs.len()
    );
    assert_eq!(h.remote.unary_calls(), 3);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_fetched_directories_land_in_local_store() {
    let h = harness(HarnessOptions::default()).await;
    let (root, blobs) = make_tree(2, "t");
    seed_remote(&h, &blobs);

    collect_tree(h.proxy.get_tree(&ctx(), None, tree_request(&root)).await.unwrap())
        .await
        .unwrap();

    for (digest, _) in &blobs {
        assert!(h.store.contains(digest).await, "missing {digest}");
    }
}

#[tokio::test]
async fn test_skip_remote_missing_tree_is_not_found() {
    let h = harness(HarnessOptions::default()).await;
    let (root, blobs) = make_tree(2, "t");
    seed_remote(&h, &blobs);

    let err = h
        .proxy
        .get_tree(&skip_remote_ctx(), None, tree_request(&root))
        .await
        .unwrap_err();
    assert_eq!(err.code(), tonic::Code::NotFound);
    assert_eq!(h.remote.unary_calls(), 0);
    assert_eq!(h.remote.stream_calls(), 0);
}

#[tokio::test]
async fn test_page_size_chunks_responses() {
    let h = harness(HarnessOptions::default()).await;
    let (root, blobs) = make_tree(3, "t");
    seed_store(&h, &blobs).await;

    let mut request = tree_request(&root);
    request.page_size = 2;
    let mut stream = h.proxy.get_tree(&ctx(), None, request).await.unwrap();

    use futures::StreamExt;
    let mut messages = 0;
    let mut total = 0;
    while let Some(response) = stream.next().await {
        let response = response.unwrap();
        assert!(response.directories.len() <= 2);
        total += response.directories.len();
        messages += 1;
    }
    assert_eq!(total, blobs.len());
    assert!(messages >= blobs.len() / 2);
}
