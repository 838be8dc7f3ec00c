//! Explicit run context.
//!
//! The pipeline id and related per-call state are plain values threaded
//! through the runner rather than ambient globals; the only process
//! global is the fallback pipeline id generated when an application
//! never pins one, which deliberately defeats memoization until it does.

use std::sync::OnceLock;

use chrono::Utc;
use tracing::warn;

/// Per-call context the runner composes keys under.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Pipeline grouping label for memo URIs.
    pub pipeline_id: String,
}

impl RunContext {
    /// Build a context with the given pipeline id.
    pub fn new(pipeline_id: impl Into<String>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
        }
    }

    /// Build a context from an optional configured id, falling back to
    /// the per-process generated one.
    pub fn from_configured(pipeline_id: Option<&str>) -> Self {
        match pipeline_id {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::new(generated_pipeline_id()),
        }
    }
}

/// The per-process fallback pipeline id.
///
/// Unique per process start: without a pinned pipeline id there is no
/// assurance the code has not changed between runs, so every run gets
/// its own memospace and nothing is reused.
pub fn generated_pipeline_id() -> String {
    static GENERATED: OnceLock<String> = OnceLock::new();
    GENERATED
        .get_or_init(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
            let id = format!(
                "{}/{}-p{}",
                hostname,
                Utc::now().format("%Y-%m-%dT%H:%M:%S"),
                std::process::id()
            );
            warn!(pipeline_id = %id, "no pipeline id configured; generated one for this run (memoization will not persist across runs)");
            id
        })
        .clone()
}
