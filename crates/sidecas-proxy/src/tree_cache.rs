//! Short-lived cache of directory structures for GetTree

use crate::reapi;
use lru::LruCache;
use parking_lot::RwLock;
use sidecas_core::{Digest, ProxyError, Result};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

const SHARD_COUNT: usize = 16;

struct CacheEntry {
    directory: reapi::Directory,
    inserted: Instant,
}

/// Bounded mapping from directory digest to its Directory message
///
/// Entries expire by TTL and by per-shard LRU. Misses are not negatively
/// cached. Keys are digests, collision-free by construction.
pub struct TreeCache {
    shards: Vec<RwLock<LruCache<String, CacheEntry>>>,
    ttl: Duration,
}

impl TreeCache {
    /// Creates a tree cache holding up to `capacity` directories
    ///
    /// # Errors
    ///
    /// Returns an error if capacity is below the shard count.
    pub fn new(capacity: usize, ttl: Duration) -> Result<Self> {
        let per_shard = NonZeroUsize::new(capacity / SHARD_COUNT)
            .ok_or_else(|| ProxyError::config("tree cache capacity must be at least 16"))?;

        let shards = (0..SHARD_COUNT)
            .map(|_| RwLock::new(LruCache::new(per_shard)))
            .collect();

        Ok(Self { shards, ttl })
    }

    fn shard(&self, key: &str) -> &RwLock<LruCache<String, CacheEntry>> {
        // First hex nibble of the hash spreads uniformly.
        let index = key
            .bytes()
            .next()
            .map(|b| (b as usize) % SHARD_COUNT)
            .unwrap_or(0);
        &self.shards[index]
    }

    /// Gets a directory if present and unexpired
    pub fn get(&self, digest: &Digest) -> Option<reapi::Directory> {
        let key = digest.key();
        let mut cache = self.shard(&key).write();

        let expired = match cache.get(&key) {
            Some(entry) if entry.inserted.elapsed() < self.ttl => {
                return Some(entry.directory.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            // Evict the expired entry eagerly so it stops holding LRU
            // space.
            cache.pop_entry(&key);
        }
        None
    }

    /// Inserts a directory under its digest
    pub fn insert(&self, digest: &Digest, directory: reapi::Directory) {
        let key = digest.key();
        self.shard(&key).write().put(
            key,
            CacheEntry {
                directory,
                inserted: Instant::now(),
            },
        );
    }

    /// Number of cached directories, expired entries included
    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.write().clear();
        }
    }
}
