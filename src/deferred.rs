//! Deferred work: lazy uploads and summary writes.
//!
//! Serializing an invocation discovers work (source uploads, hashref
//! sidecars, summary records) that only matters if the call actually
//! dispatches. Each call collects that work into a batch; the batch is
//! drained fully before the invocation is declared written, and simply
//! dropped on a cache hit. A process-wide semaphore bounds concurrency
//! and a shared seen-set deduplicates uploads by content hash.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::MuninnError;
use crate::source::local_bytes;
use crate::source::shared_uri;
use crate::source::upload_source;
use crate::source::write_hashref;
use crate::source::ContentHash;
use crate::source::SharedRef;
use crate::store::with_retries;
use crate::store::BlobStore;
use crate::summary::RunSummary;
use crate::summary::SummaryRecord;

/// Process-wide deferred work pool.
pub struct DeferredWork {
    permits: Arc<Semaphore>,
    uploaded: Mutex<HashSet<ContentHash>>,
    shared_uploaded: Mutex<HashSet<String>>,
}

impl DeferredWork {
    /// Create a pool with a bounded number of concurrent tasks.
    pub fn new(max_workers: usize) -> Arc<Self> {
        Arc::new(Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            uploaded: Mutex::new(HashSet::new()),
            shared_uploaded: Mutex::new(HashSet::new()),
        })
    }

    /// Open a batch for one call's deferred work.
    pub fn batch(self: &Arc<Self>) -> DeferredBatch {
        DeferredBatch {
            pool: self.clone(),
            handles: Vec::new(),
        }
    }

    fn claim_hash(&self, hash: &ContentHash) -> bool {
        self.uploaded.lock().unwrap().insert(*hash)
    }

    fn unclaim_hash(&self, hash: &ContentHash) {
        self.uploaded.lock().unwrap().remove(hash);
    }

    fn claim_shared(&self, uri: &str) -> bool {
        self.shared_uploaded.lock().unwrap().insert(uri.to_string())
    }

    fn unclaim_shared(&self, uri: &str) {
        self.shared_uploaded.lock().unwrap().remove(uri);
    }
}

/// One call's collected deferred work.
pub struct DeferredBatch {
    pool: Arc<DeferredWork>,
    handles: Vec<JoinHandle<Result<(), MuninnError>>>,
}

impl DeferredBatch {
    /// Schedule the upload of a locally-known source plus its hashref.
    ///
    /// Deduplicated process-wide by content hash; a hash that has been
    /// (or is being) uploaded is skipped.
    pub fn upload_source(&mut self, store: Arc<dyn BlobStore>, root: String, hash: ContentHash) {
        if !self.pool.claim_hash(&hash) {
            debug!(%hash, "source upload already scheduled; skipping");
            return;
        }
        let pool = self.pool.clone();
        self.handles.push(tokio::spawn(async move {
            let _permit = pool.permits.acquire().await.expect("deferred pool semaphore closed");
            let outcome = async {
                let Some(data) = local_bytes(&hash).await? else {
                    // Nothing local to upload: the reference must already
                    // be resolvable remotely, so there is no work.
                    return Ok(());
                };
                let uri = upload_source(store.as_ref(), &root, &hash, data).await?;
                write_hashref(store.as_ref(), &root, &hash, &uri).await
            }
            .await;
            if outcome.is_err() {
                pool.unclaim_hash(&hash);
            }
            outcome
        }));
    }

    /// Schedule the once-per-pipeline upload of a shared object.
    pub fn upload_shared(&mut self, store: Arc<dyn BlobStore>, root: String, pipeline_id: String, shared: SharedRef) {
        let uri = shared_uri(&root, &pipeline_id, &shared);
        if !self.pool.claim_shared(&uri) {
            return;
        }
        let pool = self.pool.clone();
        self.handles.push(tokio::spawn(async move {
            let _permit = pool.permits.acquire().await.expect("deferred pool semaphore closed");
            let outcome = async {
                let Some(data) = local_bytes(&shared.hash).await? else {
                    return Err(MuninnError::Serialization {
                        path: format!("shared.{}", shared.name),
                        reason: "shared object bytes are not known to this process".to_string(),
                    });
                };
                let existing = with_retries("shared-head", || store.head(&uri))
                    .await
                    .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;
                if existing.is_none() {
                    with_retries("shared-put", || store.put(&uri, data.clone(), "application/json"))
                        .await
                        .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;
                    debug!(uri = %uri, "shared object uploaded");
                }
                Ok(())
            }
            .await;
            if outcome.is_err() {
                pool.unclaim_shared(&uri);
            }
            outcome
        }));
    }

    /// Schedule a summary append.
    pub fn write_summary(&mut self, summary: Arc<RunSummary>, record: SummaryRecord) {
        let pool = self.pool.clone();
        self.handles.push(tokio::spawn(async move {
            let _permit = pool.permits.acquire().await.expect("deferred pool semaphore closed");
            summary.append(&record).await;
            Ok(())
        }));
    }

    /// Whether any work is pending.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every scheduled task; the first failure wins.
    pub async fn drain(&mut self) -> Result<(), MuninnError> {
        let mut first_error = None;
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => first_error = first_error.or(Some(err)),
                Err(join_err) => {
                    first_error = first_error.or(Some(MuninnError::TaskFailed {
                        reason: join_err.to_string(),
                    }))
                }
            }
        }
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::content_uri;
    use crate::source::Source;
    use crate::store::MemoryBlobStore;
    use bytes::Bytes;

    const ROOT: &str = "memory://t";

    #[tokio::test]
    async fn test_upload_is_deduplicated_across_batches() {
        let pool = DeferredWork::new(4);
        let store = Arc::new(MemoryBlobStore::new());
        let source = Source::from_bytes(Bytes::from_static(b"dedup across batches"), None);
        let hash = source.to_ref().hash;

        let mut first = pool.batch();
        first.upload_source(store.clone(), ROOT.to_string(), hash);
        first.drain().await.unwrap();
        assert!(store.head(&content_uri(ROOT, &hash)).await.unwrap().is_some());

        let mut second = pool.batch();
        second.upload_source(store.clone(), ROOT.to_string(), hash);
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_drain_surfaces_failures() {
        let pool = DeferredWork::new(2);
        let store = Arc::new(MemoryBlobStore::new());
        // A shared ref whose bytes were never registered cannot upload.
        let shared = SharedRef {
            name: "ghost".to_string(),
            hash: ContentHash::of(b"never registered anywhere"),
        };
        let mut batch = pool.batch();
        batch.upload_shared(store, ROOT.to_string(), "p".to_string(), shared);
        let err = batch.drain().await.unwrap_err();
        assert!(matches!(err, MuninnError::Serialization { .. }));
    }

    #[tokio::test]
    async fn test_failed_upload_can_be_retried() {
        let pool = DeferredWork::new(2);
        let store = Arc::new(MemoryBlobStore::new());
        let shared = SharedRef {
            name: "ghost".to_string(),
            hash: ContentHash::of(b"still not registered"),
        };
        let mut batch = pool.batch();
        batch.upload_shared(store.clone(), ROOT.to_string(), "p".to_string(), shared.clone());
        assert!(batch.drain().await.is_err());
        // The claim was rolled back, so a retry schedules again.
        let mut retry = pool.batch();
        retry.upload_shared(store, ROOT.to_string(), "p".to_string(), shared);
        assert!(!retry.is_empty());
        let _ = retry.drain().await;
    }
}
