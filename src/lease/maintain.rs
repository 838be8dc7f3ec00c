//! Background lease maintenance.
//!
//! One scheduler per process services every held lease: a heap of
//! heartbeat deadlines drained by a single task, so ten thousand
//! in-flight calls cost ten thousand heap entries, not ten thousand
//! timers. The remote side registers here too, as a co-owner that
//! keeps the orchestrator's lease alive without ever acquiring it.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Notify;
use tracing::debug;
use tracing::warn;

use crate::error::MuninnError;
use crate::store::BlobStore;

use super::acquire::read_lease;
use super::lock_uri;
use super::LeaseConfig;
use super::LeaseHandle;

struct Beat {
    due: Instant,
    handle: Arc<LeaseHandle>,
    active: Arc<AtomicBool>,
    period: Duration,
}

impl PartialEq for Beat {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for Beat {}

impl PartialOrd for Beat {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Beat {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Soonest deadline first.
        other.due.cmp(&self.due)
    }
}

/// Shared heartbeat scheduler for every lease this process maintains.
pub struct LeaseMaintainer {
    heap: Mutex<BinaryHeap<Beat>>,
    notify: Notify,
    started: AtomicBool,
}

impl LeaseMaintainer {
    /// Create a scheduler; its background task starts on first use.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            notify: Notify::new(),
            started: AtomicBool::new(false),
        })
    }

    /// The process-wide scheduler shared by every runner and remote
    /// entry in this process.
    pub fn global() -> Arc<Self> {
        static GLOBAL: std::sync::OnceLock<Arc<LeaseMaintainer>> = std::sync::OnceLock::new();
        GLOBAL.get_or_init(Self::new).clone()
    }

    /// Begin maintaining a lease; returns a guard that stops it.
    pub fn register(self: &Arc<Self>, handle: Arc<LeaseHandle>) -> MaintenanceGuard {
        let active = Arc::new(AtomicBool::new(true));
        let period = handle.heartbeat();
        {
            let mut heap = self.heap.lock().unwrap();
            heap.push(Beat {
                due: Instant::now() + period,
                handle: handle.clone(),
                active: active.clone(),
                period,
            });
        }
        if !self.started.swap(true, Ordering::SeqCst) {
            let scheduler = self.clone();
            tokio::spawn(async move { scheduler.run().await });
        }
        self.notify.notify_one();
        MaintenanceGuard { handle, active }
    }

    async fn run(self: Arc<Self>) {
        debug!("lease maintenance scheduler started");
        loop {
            let next_due = self.heap.lock().unwrap().peek().map(|beat| beat.due);
            match next_due {
                None => self.notify.notified().await,
                Some(due) => {
                    let now = Instant::now();
                    if due > now {
                        tokio::select! {
                            _ = tokio::time::sleep(due - now) => {}
                            _ = self.notify.notified() => continue,
                        }
                    }
                    self.service_due().await;
                }
            }
        }
    }

    async fn service_due(&self) {
        loop {
            let beat = {
                let mut heap = self.heap.lock().unwrap();
                match heap.peek() {
                    Some(beat) if beat.due <= Instant::now() => heap.pop().unwrap(),
                    _ => return,
                }
            };
            if !beat.active.load(Ordering::SeqCst) {
                continue;
            }
            match beat.handle.maintain().await {
                Ok(()) => {
                    let mut heap = self.heap.lock().unwrap();
                    heap.push(Beat {
                        due: Instant::now() + beat.period,
                        ..beat
                    });
                }
                Err(MuninnError::LockWasStolen { memo_uri, current_writer }) => {
                    warn!(lock = %memo_uri, thief = %current_writer, "stopping maintenance: lease was stolen");
                    // Dropped from the heap; the handle's stolen flag is
                    // already set and its owner will observe it.
                }
                Err(err) => {
                    warn!(writer = %beat.handle.writer_id(), error = %err, "lease maintenance failed; will retry");
                    let mut heap = self.heap.lock().unwrap();
                    heap.push(Beat {
                        due: Instant::now() + beat.period / 2,
                        ..beat
                    });
                }
            }
        }
    }
}

/// Stops maintenance of one lease when asked (or when dropped).
pub struct MaintenanceGuard {
    handle: Arc<LeaseHandle>,
    active: Arc<AtomicBool>,
}

impl MaintenanceGuard {
    /// The maintained handle.
    pub fn handle(&self) -> &Arc<LeaseHandle> {
        &self.handle
    }

    /// Stop heartbeats without releasing the lease.
    pub fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    /// Stop heartbeats and release the lease.
    pub async fn stop_and_release(self) -> Result<(), MuninnError> {
        self.stop();
        self.handle.release().await
    }
}

impl Drop for MaintenanceGuard {
    fn drop(&mut self) {
        // The lease itself expires via TTL if release was skipped.
        self.active.store(false, Ordering::SeqCst);
    }
}

/// Build a co-owner handle for the remote side of an invocation.
///
/// The remote never acquires: it reads the lock once and from then on
/// keeps `written_at` current. Returns `Ok(None)` when no lock exists
/// (leases disabled, or the orchestrator released before we started).
/// Fails with `LockWasStolen` when the lock's writer id is not the one
/// this remote was dispatched with, in which case the remote must exit
/// before running the user function.
pub async fn remote_lease_writer(
    store: Arc<dyn BlobStore>,
    memo_uri: &str,
    expected_writer_id: &str,
) -> Result<Option<Arc<LeaseHandle>>, MuninnError> {
    let uri = lock_uri(memo_uri);
    let Some(state) = read_lease(store.as_ref(), &uri).await? else {
        return Ok(None);
    };
    if state.is_released() {
        return Ok(None);
    }
    if !expected_writer_id.is_empty() && state.writer_id != expected_writer_id {
        return Err(MuninnError::LockWasStolen {
            memo_uri: memo_uri.to_string(),
            current_writer: state.writer_id,
        });
    }
    if state.ttl_seconds <= 0.0 {
        return Ok(None);
    }
    let config = LeaseConfig {
        ttl_seconds: state.ttl_seconds,
        // Derive a safe heartbeat from the lock's own TTL so orchestrator
        // and remote agree even across configuration drift.
        heartbeat: Duration::from_secs_f64(state.ttl_seconds / 4.0),
        confirm_margin: Duration::from_millis(0),
    };
    Ok(Some(Arc::new(LeaseHandle::co_owner(store, uri, &state, config))))
}
