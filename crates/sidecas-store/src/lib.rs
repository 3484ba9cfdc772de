//! Local blob store seam
//!
//! The proxy treats the local persistent store as an external
//! collaborator: content-addressed put/get/contains/delete behind an
//! async trait. `MemoryBlobStore` is the in-process reference
//! implementation, used by tests and by deployments that want a purely
//! in-memory sidecar.

pub mod memory;

pub use memory::MemoryBlobStore;

use async_trait::async_trait;
use bytes::Bytes;
use sidecas_core::{Digest, Result};

/// Content-addressed local blob storage
///
/// Implementations own their durability and eviction policy. Callers may
/// assume only content addressing: bytes stored under digest D are the
/// bytes any other holder of D stored.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Whether a blob with this digest is present
    async fn contains(&self, digest: &Digest) -> bool;

    /// Fetch a blob's bytes, or `None` when absent
    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>>;

    /// Store a blob under its digest
    ///
    /// Errors when the blob exceeds the store's per-blob cap.
    async fn put(&self, digest: &Digest, data: Bytes) -> Result<()>;

    /// Remove a blob; returns whether it was present
    async fn delete(&self, digest: &Digest) -> Result<bool>;

    /// Per-blob size cap, if the store has one
    ///
    /// The proxy skips write-back for blobs over this cap instead of
    /// round-tripping a doomed put.
    fn max_blob_size(&self) -> Option<u64> {
        None
    }
}
