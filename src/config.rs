//! Runner configuration.
//!
//! A single source of truth for every tunable, loadable from `MUNINN_*`
//! environment variables with sensible defaults and validation.

use std::path::PathBuf;
use std::time::Duration;

use crate::constants::DEFAULT_DEFERRED_WORK_MAX;
use crate::constants::DEFAULT_LEASE_HEARTBEAT;
use crate::constants::DEFAULT_LEASE_TTL;
use crate::constants::RUNNER_PREFIX;
use crate::error::MuninnError;
use crate::lease::LeaseConfig;

/// Where artifacts are stored and summarized.
#[derive(Debug, Clone)]
pub struct StorageSettings {
    /// Base URI under which all memo URIs are built.
    pub blob_root: String,
    /// Fixed namespace segment inside the blob root.
    pub runner_prefix: String,
    /// Local TTL for recently-read control files, in seconds.
    /// Zero reads through; negative disables the cache.
    pub control_cache_ttl_seconds: i64,
    /// Directory for per-process summary files.
    pub summary_dir: Option<PathBuf>,
}

impl StorageSettings {
    fn load(blob_root: Option<String>) -> Result<Self, MuninnError> {
        let blob_root = blob_root
            .or_else(|| std::env::var("MUNINN_BLOB_ROOT").ok())
            .ok_or_else(|| MuninnError::Config {
                key: "MUNINN_BLOB_ROOT".to_string(),
                reason: "a blob root URI is required".to_string(),
            })?;
        if !blob_root.contains("://") {
            return Err(MuninnError::Config {
                key: "MUNINN_BLOB_ROOT".to_string(),
                reason: format!("'{blob_root}' is not a URI (missing scheme)"),
            });
        }
        Ok(Self {
            blob_root,
            runner_prefix: std::env::var("MUNINN_RUNNER_PREFIX").unwrap_or_else(|_| RUNNER_PREFIX.to_string()),
            control_cache_ttl_seconds: env_parsed("MUNINN_CONTROL_CACHE_TTL_SECONDS", 0),
            summary_dir: Some(
                std::env::var("MUNINN_SUMMARY_DIR")
                    .map(PathBuf::from)
                    .unwrap_or_else(|_| PathBuf::from(".muninn/summary")),
            ),
        })
    }
}

/// Lease tuning.
#[derive(Debug, Clone)]
pub struct LeaseSettings {
    /// Lease freshness interval in seconds; negative disables leasing.
    pub ttl_seconds: f64,
    /// Heartbeat period; must be under a third of the TTL.
    pub heartbeat: Duration,
    /// Minimum confirmation delay after an acquisition write.
    pub confirm_margin: Duration,
    /// Whether the orchestrator maintains leases in the background.
    pub maintain_locks: bool,
}

impl LeaseSettings {
    fn load() -> Result<Self, MuninnError> {
        let ttl_seconds = env_parsed("MUNINN_LEASE_TTL_SECONDS", DEFAULT_LEASE_TTL.as_secs_f64());
        let heartbeat_seconds = env_parsed("MUNINN_LEASE_HEARTBEAT_SECONDS", DEFAULT_LEASE_HEARTBEAT.as_secs_f64());
        let confirm_seconds = env_parsed(
            "MUNINN_LEASE_CONFIRM_MARGIN_SECONDS",
            crate::constants::DEFAULT_CONFIRM_DELAY.as_secs_f64(),
        );
        let settings = Self {
            ttl_seconds,
            heartbeat: Duration::from_secs_f64(heartbeat_seconds.max(0.001)),
            confirm_margin: Duration::from_secs_f64(confirm_seconds.max(0.0)),
            maintain_locks: env_parsed("MUNINN_MAINTAIN_LOCKS", true),
        };
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), MuninnError> {
        if self.ttl_seconds > 0.0 && self.heartbeat.as_secs_f64() * 3.0 >= self.ttl_seconds {
            return Err(MuninnError::Config {
                key: "MUNINN_LEASE_HEARTBEAT_SECONDS".to_string(),
                reason: format!(
                    "heartbeat {}s must be less than a third of the lease TTL {}s",
                    self.heartbeat.as_secs_f64(),
                    self.ttl_seconds
                ),
            });
        }
        Ok(())
    }

    /// Render as the lease module's config.
    pub fn to_lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl_seconds: self.ttl_seconds,
            heartbeat: self.heartbeat,
            confirm_margin: self.confirm_margin,
        }
    }
}

/// Orchestration behavior.
#[derive(Debug, Clone)]
pub struct RunSettings {
    /// Pipeline grouping label; generated per process when unset.
    pub pipeline_id: Option<String>,
    /// Cap on concurrent deferred-work tasks.
    pub deferred_work_max: usize,
    /// Fail any call whose result is not already memoized.
    pub require_all_results: bool,
    /// Treat memoized exceptions as transient and re-dispatch.
    pub rerun_exceptions: bool,
}

impl RunSettings {
    fn load() -> Result<Self, MuninnError> {
        Ok(Self {
            pipeline_id: std::env::var("MUNINN_PIPELINE_ID").ok(),
            deferred_work_max: env_parsed("MUNINN_DEFERRED_WORK_MAX", DEFAULT_DEFERRED_WORK_MAX).max(1),
            require_all_results: env_parsed("MUNINN_REQUIRE_ALL_RESULTS", false),
            rerun_exceptions: env_parsed("MUNINN_RERUN_EXCEPTIONS", true),
        })
    }
}

/// Complete runner configuration.
#[derive(Debug, Clone)]
pub struct MuninnConfig {
    /// Storage layout and caching.
    pub storage: StorageSettings,
    /// Lease tuning.
    pub lease: LeaseSettings,
    /// Orchestration behavior.
    pub run: RunSettings,
}

impl MuninnConfig {
    /// Load from the environment, with the blob root given explicitly.
    pub fn load(blob_root: impl Into<String>) -> Result<Self, MuninnError> {
        Ok(Self {
            storage: StorageSettings::load(Some(blob_root.into()))?,
            lease: LeaseSettings::load()?,
            run: RunSettings::load()?,
        })
    }

    /// Load entirely from the environment.
    pub fn from_env() -> Result<Self, MuninnError> {
        Ok(Self {
            storage: StorageSettings::load(None)?,
            lease: LeaseSettings::load()?,
            run: RunSettings::load()?,
        })
    }
}

fn env_parsed<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_with_defaults() {
        let config = MuninnConfig::load("memory://test-root").unwrap();
        assert_eq!(config.storage.blob_root, "memory://test-root");
        assert_eq!(config.storage.runner_prefix, RUNNER_PREFIX);
        assert!(config.lease.ttl_seconds > 0.0);
        assert!(config.run.rerun_exceptions);
    }

    #[test]
    fn test_blob_root_must_be_a_uri() {
        let err = MuninnConfig::load("/not/a/uri").unwrap_err();
        assert!(matches!(err, MuninnError::Config { .. }));
    }

    #[test]
    fn test_heartbeat_must_undershoot_ttl() {
        let settings = LeaseSettings {
            ttl_seconds: 30.0,
            heartbeat: Duration::from_secs(15),
            confirm_margin: Duration::from_millis(500),
            maintain_locks: true,
        };
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_negative_ttl_skips_heartbeat_validation() {
        let settings = LeaseSettings {
            ttl_seconds: -1.0,
            heartbeat: Duration::from_secs(15),
            confirm_margin: Duration::from_millis(500),
            maintain_locks: true,
        };
        assert!(settings.validate().is_ok());
        assert!(settings.to_lease_config().disabled());
    }
}
