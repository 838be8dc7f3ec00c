//! Expiring leases over blob storage.
//!
//! The lease is a best-effort lock built from nothing but `get`, `put`
//! and `delete` on a single blob. Under degenerate network conditions
//! two holders can briefly both believe they own it, so it is a
//! performance optimization with deterministic convergence, never a
//! correctness guarantee. Ties between racing writers resolve
//! last-writer-wins after a confirmation delay, and a remote worker
//! that observes a foreign writer id exits instead of running.

mod acquire;
mod maintain;

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::constants::DEFAULT_CONFIRM_DELAY;
use crate::constants::DEFAULT_LEASE_HEARTBEAT;
use crate::constants::DEFAULT_LEASE_TTL;
use crate::constants::LOCK;
use crate::humenc;
use crate::store::join_uri;

pub use acquire::AcquireOutcome;
pub use acquire::Lease;
pub use acquire::LeaseHandle;
pub use maintain::remote_lease_writer;
pub use maintain::LeaseMaintainer;
pub use maintain::MaintenanceGuard;

/// The serialized `lock` control file.
///
/// `written_at` is the liveness signal: a lease is fresh while
/// `now - written_at < ttl`. A released lease keeps its final state as
/// a tombstone until the blob is deleted, so late readers can tell
/// release from expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseState {
    /// Opaque token identifying the current holder.
    pub writer_id: String,
    /// Instant of the most recent maintenance write; `None` once released.
    pub written_at: Option<DateTime<Utc>>,
    /// Freshness interval in seconds.
    pub ttl_seconds: f64,
    /// When the holder first confirmed acquisition.
    pub first_acquired_at: Option<DateTime<Utc>>,
    /// Set by an explicit release.
    pub released_at: Option<DateTime<Utc>>,
    /// Number of writes of this lease by its holder.
    pub write_count: u64,
    /// Hostname of the writing process.
    pub hostname: String,
    /// Pid of the writing process.
    pub pid: u32,
    /// Free-form extras; the orchestrator stows invocation metadata here
    /// so the remote can echo it into result metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl LeaseState {
    /// Whether this lease was explicitly released.
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    /// Whether this lease counts as fresh right now.
    pub fn is_fresh(&self) -> bool {
        match self.written_at {
            Some(written_at) => {
                let age = Utc::now().signed_duration_since(written_at);
                age.num_milliseconds() as f64 / 1000.0 < self.ttl_seconds
            }
            None => false,
        }
    }
}

/// Tuning for lease acquisition and maintenance.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    /// Freshness interval. Non-positive disables leasing entirely.
    pub ttl_seconds: f64,
    /// Heartbeat period for maintenance writes. Must be < ttl/3.
    pub heartbeat: std::time::Duration,
    /// Minimum confirmation delay after an acquisition write. The
    /// effective delay is raised to twice the observed read-to-write
    /// latency when that is larger.
    pub confirm_margin: std::time::Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_LEASE_TTL.as_secs_f64(),
            heartbeat: DEFAULT_LEASE_HEARTBEAT,
            confirm_margin: DEFAULT_CONFIRM_DELAY,
        }
    }
}

impl LeaseConfig {
    /// Whether leasing is turned off.
    pub fn disabled(&self) -> bool {
        self.ttl_seconds <= 0.0
    }
}

/// URI of the lock control file under a memo URI.
pub fn lock_uri(memo_uri: &str) -> String {
    join_uri(memo_uri, [LOCK])
}

/// Generate a fresh writer id.
pub fn new_writer_id() -> String {
    humenc::encode(Uuid::new_v4().as_bytes())
}

pub(crate) fn process_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(written_secs_ago: i64, ttl: f64) -> LeaseState {
        LeaseState {
            writer_id: "w".to_string(),
            written_at: Some(Utc::now() - chrono::Duration::seconds(written_secs_ago)),
            ttl_seconds: ttl,
            first_acquired_at: None,
            released_at: None,
            write_count: 1,
            hostname: "h".to_string(),
            pid: 1,
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_fresh_within_ttl() {
        assert!(state(1, 30.0).is_fresh());
        assert!(!state(31, 30.0).is_fresh());
    }

    #[test]
    fn test_released_is_never_fresh() {
        let mut lease = state(0, 30.0);
        lease.released_at = lease.written_at;
        lease.written_at = None;
        assert!(lease.is_released());
        assert!(!lease.is_fresh());
    }

    #[test]
    fn test_writer_ids_are_unique() {
        assert_ne!(new_writer_id(), new_writer_id());
    }

    #[test]
    fn test_lease_state_json_roundtrip() {
        let lease = state(0, 90.0);
        let json = serde_json::to_string(&lease).unwrap();
        let back: LeaseState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, lease);
    }
}
