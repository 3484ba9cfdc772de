//! In-memory blob store

use crate::BlobStore;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use sidecas_core::{Digest, ProxyError, Result};
use std::collections::HashMap;

/// Hash-addressed in-memory store
///
/// Keys are `hash/size` so a truncated write under a reused hash can
/// never alias a different blob.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<String, Bytes>>,
    max_blob_size: Option<u64>,
}

impl MemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects blobs larger than `max_blob_size` bytes
    #[must_use]
    pub fn with_max_blob_size(max_blob_size: u64) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            max_blob_size: Some(max_blob_size),
        }
    }

    /// Number of blobs currently stored
    #[must_use]
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Insert bytes under an arbitrary digest, bypassing the size cap.
    /// Test hook for modelling corrupt or hand-seeded entries.
    pub fn insert_raw(&self, digest: &Digest, data: Bytes) {
        self.blobs.write().insert(digest.key(), data);
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(&digest.key())
    }

    async fn get(&self, digest: &Digest) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().get(&digest.key()).cloned())
    }

    async fn put(&self, digest: &Digest, data: Bytes) -> Result<()> {
        if let Some(cap) = self.max_blob_size {
            if data.len() as u64 > cap {
                return Err(ProxyError::store(format!(
                    "blob {} exceeds per-blob cap of {} bytes",
                    digest, cap
                )));
            }
        }
        self.blobs.write().insert(digest.key(), data);
        Ok(())
    }

    async fn delete(&self, digest: &Digest) -> Result<bool> {
        Ok(self.blobs.write().remove(&digest.key()).is_some())
    }

    fn max_blob_size(&self) -> Option<u64> {
        self.max_blob_size
    }
}
