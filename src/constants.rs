//! Fixed names and limits for the runner protocol.
//!
//! These values are part of the on-store layout: changing any of them
//! invalidates every previously memoized result.

use std::time::Duration;

/// Namespace segment inserted between the blob root and the pipeline id.
/// Kept stable across versions so older memoized results stay reachable.
pub const RUNNER_PREFIX: &str = "mops2-mpf";

/// Envelope format marker pinned into every serialized control file.
/// Bump only with a deliberate cache-invalidation migration.
pub const SER_PROTOCOL: &str = "muninn/1";

/// Control file holding the serialized invocation. Written at most once
/// per memo URI and immutable thereafter.
pub const INVOCATION: &str = "invocation";

/// Control file holding the current lease state.
pub const LOCK: &str = "lock";

/// Directory of result envelopes, one per remote run id.
pub const RESULT_DIR: &str = "result";

/// Directory of exception envelopes, one per remote run id.
pub const EXCEPTION_DIR: &str = "exception";

/// Directory of human-readable metadata sidecars, one per remote run id.
pub const RESULT_METADATA_DIR: &str = "result-metadata";

/// Namespace for content-addressed source bytes under a storage root.
pub const CAS_PREFIX: &str = "mops2-cas";

/// Namespace for hashref sidecars under a storage root.
pub const HASHREF_PREFIX: &str = "mops2-hashrefs";

/// Namespace for pipeline-scoped shared objects under a storage root.
pub const SHARED_PREFIX: &str = "mops2-shared";

/// Path segment prefix marking a called-subfunction logic key inside a
/// memo URI.
pub const CALLS_PREFIX: &str = "calls-";

/// Default lease freshness interval.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(90);

/// Default lease heartbeat period. Must stay under a third of the TTL so
/// a single missed heartbeat cannot expire the lease.
pub const DEFAULT_LEASE_HEARTBEAT: Duration = Duration::from_secs(25);

/// Default minimum confirmation delay between writing a lease and reading
/// it back to decide whether the write won.
pub const DEFAULT_CONFIRM_DELAY: Duration = Duration::from_millis(500);

/// Sleep between result re-probes while another party holds the lease.
pub const LEASE_WAIT_INTERVAL: Duration = Duration::from_secs(22);

/// Default cap on concurrent deferred-work tasks.
pub const DEFAULT_DEFERRED_WORK_MAX: usize = 16;

/// Default cap on concurrent store operations per runner phase.
pub const MAX_CONCURRENT_STORE_OPS: usize = 8;

/// Maximum attempts for a retriable blob-store operation.
pub const STORE_RETRY_ATTEMPTS: u32 = 5;

/// Initial backoff for blob-store retries.
pub const STORE_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(50);

/// Maximum backoff between blob-store retries.
pub const STORE_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);

const _: () = assert!(DEFAULT_LEASE_HEARTBEAT.as_secs() * 3 < DEFAULT_LEASE_TTL.as_secs());
const _: () = assert!(DEFAULT_CONFIRM_DELAY.as_millis() * 2 < DEFAULT_LEASE_TTL.as_millis());
const _: () = assert!(STORE_RETRY_ATTEMPTS > 0);
