//! Local read cache for control files.
//!
//! Invocation and result envelopes are immutable once written, so
//! re-reads within a short TTL can be served from memory. Lease files
//! are mutable coordination state and must never pass through here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::trace;

use super::BlobStore;
use super::BlobStoreError;
use super::with_retries;

#[derive(Clone)]
struct CacheEntry {
    stored_at: Instant,
    data: Bytes,
}

/// TTL cache over immutable control-file reads.
///
/// A positive TTL serves repeated reads from memory for that long. A
/// zero TTL keeps the cache populated but always re-fetches. A negative
/// TTL disables the cache entirely.
pub struct ControlCache {
    ttl_seconds: i64,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl ControlCache {
    /// Create a cache with the configured TTL behavior.
    pub fn new(ttl_seconds: i64) -> Arc<Self> {
        Arc::new(Self {
            ttl_seconds,
            entries: RwLock::new(HashMap::new()),
        })
    }

    /// Fetch an immutable control file, serving from cache when fresh.
    pub async fn get_through(&self, store: &dyn BlobStore, uri: &str) -> Result<Bytes, BlobStoreError> {
        if self.ttl_seconds > 0 {
            let entries = self.entries.read().await;
            if let Some(entry) = entries.get(uri) {
                if entry.stored_at.elapsed() < Duration::from_secs(self.ttl_seconds as u64) {
                    trace!(uri, "control file served from cache");
                    return Ok(entry.data.clone());
                }
            }
        }

        let data = with_retries("control-get", || store.get(uri)).await?;

        if self.ttl_seconds >= 0 {
            let mut entries = self.entries.write().await;
            entries.insert(
                uri.to_string(),
                CacheEntry {
                    stored_at: Instant::now(),
                    data: data.clone(),
                },
            );
        }
        Ok(data)
    }

    /// Drop a cached entry, e.g. after observing corruption.
    pub async fn invalidate(&self, uri: &str) {
        self.entries.write().await.remove(uri);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    #[tokio::test]
    async fn test_positive_ttl_serves_stale_store() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(3600);
        store.put("memory://t/inv", Bytes::from_static(b"v1"), "bytes").await.unwrap();
        assert_eq!(cache.get_through(&store, "memory://t/inv").await.unwrap(), "v1");
        // Overwrite behind the cache's back; the cached copy still wins.
        store.put("memory://t/inv", Bytes::from_static(b"v2"), "bytes").await.unwrap();
        assert_eq!(cache.get_through(&store, "memory://t/inv").await.unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_negative_ttl_always_fetches() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(-1);
        store.put("memory://t/inv", Bytes::from_static(b"v1"), "bytes").await.unwrap();
        cache.get_through(&store, "memory://t/inv").await.unwrap();
        store.put("memory://t/inv", Bytes::from_static(b"v2"), "bytes").await.unwrap();
        assert_eq!(cache.get_through(&store, "memory://t/inv").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn test_missing_blob_propagates_not_found() {
        let store = MemoryBlobStore::new();
        let cache = ControlCache::new(60);
        let err = cache.get_through(&store, "memory://t/none").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
