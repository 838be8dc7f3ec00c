//! In-memory blob store for testing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::Digest;
use sha2::Sha256;

use super::BlobHead;
use super::BlobStore;
use super::BlobStoreError;

/// A blob store backed by a shared in-process map.
///
/// Clones share the same underlying storage, so a test can hand the
/// same store to an orchestrator and a simulated remote.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, Bytes>>>,
}

impl MemoryBlobStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently stored.
    pub fn len(&self) -> usize {
        self.blobs.read().unwrap().len()
    }

    /// Whether the store holds no blobs.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().unwrap().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, uri: &str, data: Bytes, _content_type: &str) -> Result<(), BlobStoreError> {
        self.blobs.write().unwrap().insert(uri.to_string(), data);
        Ok(())
    }

    async fn get(&self, uri: &str) -> Result<Bytes, BlobStoreError> {
        self.blobs
            .read()
            .unwrap()
            .get(uri)
            .cloned()
            .ok_or_else(|| BlobStoreError::NotFound { uri: uri.to_string() })
    }

    async fn head(&self, uri: &str) -> Result<Option<BlobHead>, BlobStoreError> {
        Ok(self.blobs.read().unwrap().get(uri).map(|data| BlobHead {
            size: data.len() as u64,
            content_hash: Some(hex::encode(Sha256::digest(data))),
        }))
    }

    async fn list(&self, uri_prefix: &str) -> Result<Vec<String>, BlobStoreError> {
        let blobs = self.blobs.read().unwrap();
        Ok(blobs.range(uri_prefix.to_string()..).take_while(|(k, _)| k.starts_with(uri_prefix)).map(|(k, _)| k.clone()).collect())
    }

    async fn delete(&self, uri: &str) -> Result<(), BlobStoreError> {
        match self.blobs.write().unwrap().remove(uri) {
            Some(_) => Ok(()),
            None => Err(BlobStoreError::NotFound { uri: uri.to_string() }),
        }
    }
}
