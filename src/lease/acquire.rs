//! Lease acquisition and the holder's handle.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use bytes::Bytes;
use chrono::DateTime;
use chrono::Utc;
use tracing::debug;
use tracing::instrument;
use tracing::warn;

use crate::error::MuninnError;
use crate::store::with_retries;
use crate::store::BlobStore;

use super::lock_uri;
use super::new_writer_id;
use super::process_hostname;
use super::LeaseConfig;
use super::LeaseState;

/// Result of one acquisition attempt.
pub enum AcquireOutcome {
    /// This writer now holds the lease and must maintain it.
    Acquired(Arc<LeaseHandle>),
    /// A different writer holds a fresh lease.
    HeldByOther {
        /// Writer id of the current holder.
        holder: String,
    },
}

/// An acquirable lease over one memo URI's lock file.
pub struct Lease {
    store: Arc<dyn BlobStore>,
    lock_uri: String,
    writer_id: String,
    config: LeaseConfig,
}

impl Lease {
    /// Create a lease handle for a memo URI with a fresh writer id.
    pub fn new(store: Arc<dyn BlobStore>, memo_uri: &str, config: LeaseConfig) -> Self {
        Self {
            store,
            lock_uri: lock_uri(memo_uri),
            writer_id: new_writer_id(),
            config,
        }
    }

    /// The writer id this lease will acquire under.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    async fn read_state(&self) -> Result<Option<LeaseState>, MuninnError> {
        read_lease(self.store.as_ref(), &self.lock_uri).await
    }

    fn make_state(&self, write_count: u64, first_acquired_at: Option<DateTime<Utc>>, extra: &BTreeMap<String, String>) -> LeaseState {
        LeaseState {
            writer_id: self.writer_id.clone(),
            written_at: Some(Utc::now()),
            ttl_seconds: self.config.ttl_seconds,
            first_acquired_at,
            released_at: None,
            write_count,
            hostname: process_hostname(),
            pid: std::process::id(),
            extra: extra.clone(),
        }
    }

    /// Attempt to acquire the lease once.
    ///
    /// If the lock is absent, expired, or released, we write our state,
    /// wait out the confirmation delay, and read back: whoever's write
    /// survived is the holder. The delay is sized so that a concurrent
    /// writer is extremely unlikely to still be inside its own write
    /// window when we read.
    #[instrument(skip(self, extra), fields(lock = %self.lock_uri, writer = %self.writer_id))]
    pub async fn try_acquire(&self, extra: &BTreeMap<String, String>) -> Result<AcquireOutcome, MuninnError> {
        let before_read = Instant::now();
        if let Some(current) = self.read_state().await? {
            if current.is_fresh() && !current.is_released() && current.writer_id != self.writer_id {
                debug!(holder = %current.writer_id, "lease held by another writer");
                return Ok(AcquireOutcome::HeldByOther { holder: current.writer_id });
            }
            if !current.is_fresh() && !current.is_released() {
                debug!(previous = %current.writer_id, "lease expired, attempting to take it");
            }
        }

        let state = self.make_state(1, None, extra);
        self.write_state(&state).await?;

        let read_write_delay = before_read.elapsed();
        let confirm_delay = self.config.confirm_margin.max(read_write_delay * 2);
        if read_write_delay > self.config.confirm_margin {
            warn!(
                observed_ms = read_write_delay.as_millis() as u64,
                margin_ms = self.config.confirm_margin.as_millis() as u64,
                "lease check-to-write latency exceeded the confirmation margin; raising the delay"
            );
        }
        tokio::time::sleep(confirm_delay).await;

        match self.read_state().await? {
            Some(current) if current.writer_id == self.writer_id => {
                let handle = LeaseHandle {
                    store: self.store.clone(),
                    lock_uri: self.lock_uri.clone(),
                    writer_id: self.writer_id.clone(),
                    config: self.config.clone(),
                    can_release: true,
                    stolen: AtomicBool::new(false),
                    inner: Mutex::new(HandleInner {
                        write_count: state.write_count,
                        first_acquired_at: Utc::now(),
                        extra: extra.clone(),
                    }),
                };
                // Record first_acquired_at for posterity; latency here is
                // off the critical path since the lease is already ours.
                handle.write_fresh().await?;
                debug!("lease acquired");
                Ok(AcquireOutcome::Acquired(Arc::new(handle)))
            }
            Some(current) => {
                debug!(holder = %current.writer_id, "lost the acquisition race");
                Ok(AcquireOutcome::HeldByOther { holder: current.writer_id })
            }
            None => {
                // Deleted between our write and the confirmation read; a
                // releasing holder raced us. Treat as contention.
                Ok(AcquireOutcome::HeldByOther { holder: String::new() })
            }
        }
    }

    async fn write_state(&self, state: &LeaseState) -> Result<(), MuninnError> {
        write_lease(self.store.as_ref(), &self.lock_uri, state).await
    }
}

#[derive(Debug)]
struct HandleInner {
    write_count: u64,
    first_acquired_at: DateTime<Utc>,
    extra: BTreeMap<String, String>,
}

/// A held (or co-maintained) lease.
///
/// The orchestrator-side holder can maintain and release. The remote
/// co-owner maintains only; releasing stays the orchestrator's job.
#[derive(Debug)]
pub struct LeaseHandle {
    store: Arc<dyn BlobStore>,
    lock_uri: String,
    writer_id: String,
    config: LeaseConfig,
    can_release: bool,
    stolen: AtomicBool,
    inner: Mutex<HandleInner>,
}

impl LeaseHandle {
    pub(super) fn co_owner(
        store: Arc<dyn BlobStore>,
        lock_uri: String,
        state: &LeaseState,
        config: LeaseConfig,
    ) -> Self {
        Self {
            store,
            lock_uri,
            writer_id: state.writer_id.clone(),
            config,
            can_release: false,
            stolen: AtomicBool::new(false),
            inner: Mutex::new(HandleInner {
                write_count: state.write_count,
                first_acquired_at: state.first_acquired_at.unwrap_or_else(Utc::now),
                extra: state.extra.clone(),
            }),
        }
    }

    /// Writer id this handle maintains under.
    pub fn writer_id(&self) -> &str {
        &self.writer_id
    }

    /// Heartbeat period configured for this lease.
    pub fn heartbeat(&self) -> Duration {
        self.config.heartbeat
    }

    /// Whether a maintenance pass observed a foreign writer.
    pub fn was_stolen(&self) -> bool {
        self.stolen.load(Ordering::SeqCst)
    }

    fn next_state(&self) -> LeaseState {
        let mut inner = self.inner.lock().unwrap();
        inner.write_count += 1;
        LeaseState {
            writer_id: self.writer_id.clone(),
            written_at: Some(Utc::now()),
            ttl_seconds: self.config.ttl_seconds,
            first_acquired_at: Some(inner.first_acquired_at),
            released_at: None,
            write_count: inner.write_count,
            hostname: process_hostname(),
            pid: std::process::id(),
            extra: inner.extra.clone(),
        }
    }

    async fn write_fresh(&self) -> Result<(), MuninnError> {
        let state = self.next_state();
        write_lease(self.store.as_ref(), &self.lock_uri, &state).await
    }

    /// Refresh `written_at` to keep the lease fresh.
    ///
    /// Never overwrites a foreign lease: observing a different writer id
    /// marks this handle stolen and fails, and the caller must abort its
    /// invocation chain.
    pub async fn maintain(&self) -> Result<(), MuninnError> {
        match read_lease(self.store.as_ref(), &self.lock_uri).await? {
            Some(current) if current.writer_id == self.writer_id => self.write_fresh().await,
            Some(current) => {
                self.stolen.store(true, Ordering::SeqCst);
                Err(MuninnError::LockWasStolen {
                    memo_uri: self.lock_uri.clone(),
                    current_writer: current.writer_id,
                })
            }
            None => {
                self.stolen.store(true, Ordering::SeqCst);
                Err(MuninnError::LockWasStolen {
                    memo_uri: self.lock_uri.clone(),
                    current_writer: "none (lock deleted)".to_string(),
                })
            }
        }
    }

    /// Release the lease: write a tombstone, then delete the lock.
    ///
    /// Quietly does nothing if another writer has taken over, or if this
    /// handle is a remote co-owner.
    pub async fn release(&self) -> Result<(), MuninnError> {
        if !self.can_release {
            return Ok(());
        }
        match read_lease(self.store.as_ref(), &self.lock_uri).await? {
            Some(current) if current.writer_id == self.writer_id => {
                let mut tombstone = self.next_state();
                tombstone.released_at = tombstone.written_at.take();
                write_lease(self.store.as_ref(), &self.lock_uri, &tombstone).await?;
                match with_retries("lease-delete", || self.store.delete(&self.lock_uri)).await {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {}
                    Err(source) => {
                        return Err(MuninnError::Storage {
                            uri: self.lock_uri.clone(),
                            source,
                        })
                    }
                }
                debug!(lock = %self.lock_uri, writer = %self.writer_id, "lease released");
                Ok(())
            }
            _ => {
                debug!(lock = %self.lock_uri, "lease already gone or foreign; skipping release");
                Ok(())
            }
        }
    }
}

pub(super) async fn read_lease(store: &dyn BlobStore, lock_uri: &str) -> Result<Option<LeaseState>, MuninnError> {
    // Never served from any cache: coordination state must be current.
    match with_retries("lease-get", || store.get(lock_uri)).await {
        Ok(data) => {
            let state = serde_json::from_slice(&data).map_err(|e| MuninnError::CorruptControlFile {
                uri: lock_uri.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(state))
        }
        Err(err) if err.is_not_found() => Ok(None),
        Err(source) => Err(MuninnError::Storage {
            uri: lock_uri.to_string(),
            source,
        }),
    }
}

pub(super) async fn write_lease(store: &dyn BlobStore, lock_uri: &str, state: &LeaseState) -> Result<(), MuninnError> {
    let data = serde_json::to_vec(state).map_err(|e| MuninnError::Serialization {
        path: "$".to_string(),
        reason: e.to_string(),
    })?;
    with_retries("lease-put", || store.put(lock_uri, Bytes::from(data.clone()), "application/json"))
        .await
        .map_err(|source| MuninnError::Storage {
            uri: lock_uri.to_string(),
            source,
        })
}
