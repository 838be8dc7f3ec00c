//! Invocation and result metadata.
//!
//! Metadata is anything useful for debugging and monitoring that is not
//! required for the core protocol. It travels from the orchestrator to
//! the remote as `key=value` shim arguments, and comes back embedded in
//! result envelopes plus a human-readable sidecar.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::MuninnError;

/// Metadata captured on the orchestrator at invocation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationMetadata {
    /// When the orchestrator issued the call.
    pub invoked_at: DateTime<Utc>,
    /// Semantic identity of the caller (`user@host` by default).
    pub invoked_by: String,
    /// Version of the orchestrator's code.
    pub invoker_code_version: String,
    /// Writer id of the lease this invocation dispatched under.
    pub invoker_uuid: String,
    /// Pipeline grouping label for the call.
    pub pipeline_id: String,
}

impl InvocationMetadata {
    /// Build metadata for a new invocation.
    pub fn new(pipeline_id: &str, invoker_uuid: &str) -> Self {
        Self {
            invoked_at: Utc::now(),
            invoked_by: default_invoked_by(),
            invoker_code_version: invoker_code_version(),
            invoker_uuid: invoker_uuid.to_string(),
            pipeline_id: pipeline_id.to_string(),
        }
    }

    /// Render as `key=value` strings for shim argument lists.
    ///
    /// Values may not contain spaces; the rendering is also used in
    /// result sidecars where lines are split on whitespace.
    pub fn to_args(&self) -> Vec<String> {
        vec![
            format!("invoked-at={}", self.invoked_at.to_rfc3339()),
            format!("invoked-by={}", self.invoked_by),
            format!("invoker-code-version={}", self.invoker_code_version),
            format!("invoker-uuid={}", self.invoker_uuid),
            format!("pipeline-id={}", self.pipeline_id),
        ]
    }

    /// Parse `key=value` strings produced by [`Self::to_args`].
    ///
    /// Unknown keys are ignored so newer orchestrators can add fields.
    pub fn from_args(args: &[String]) -> Result<Self, MuninnError> {
        let mut fields: BTreeMap<&str, &str> = BTreeMap::new();
        for arg in args {
            if let Some((key, value)) = arg.split_once('=') {
                fields.insert(key, value);
            }
        }
        let get = |key: &str| -> Result<String, MuninnError> {
            fields.get(key).map(|v| v.to_string()).ok_or_else(|| MuninnError::Config {
                key: key.to_string(),
                reason: "missing invocation metadata argument".to_string(),
            })
        };
        let invoked_at = DateTime::parse_from_rfc3339(&get("invoked-at")?)
            .map_err(|e| MuninnError::Config {
                key: "invoked-at".to_string(),
                reason: e.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self {
            invoked_at,
            invoked_by: get("invoked-by")?,
            invoker_code_version: get("invoker-code-version")?,
            invoker_uuid: get("invoker-uuid")?,
            pipeline_id: get("pipeline-id")?,
        })
    }
}

/// Metadata attached to every result or exception envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetadata {
    /// The originating invocation metadata.
    #[serde(flatten)]
    pub invocation: InvocationMetadata,
    /// Version of the code that ran remotely.
    pub remote_code_version: String,
    /// When the remote began running the user function.
    pub remote_started_at: DateTime<Utc>,
    /// When the remote finished running the user function.
    pub remote_ended_at: DateTime<Utc>,
    /// Wall seconds between remote start and end.
    pub remote_wall_seconds: f64,
    /// Wall seconds between invocation and remote end.
    pub result_wall_seconds: f64,
    /// Backend-specific extras (hostname, pod name, exit details).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl ResultMetadata {
    /// Derive result metadata from the invocation plus remote timings.
    pub fn from_invocation(
        invocation: InvocationMetadata,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
    ) -> Self {
        let remote_wall_seconds = (ended_at - started_at).num_milliseconds() as f64 / 1000.0;
        let result_wall_seconds = (ended_at - invocation.invoked_at).num_milliseconds() as f64 / 1000.0;
        Self {
            invocation,
            remote_code_version: remote_code_version(),
            remote_started_at: started_at,
            remote_ended_at: ended_at,
            remote_wall_seconds,
            result_wall_seconds,
            extra: BTreeMap::new(),
        }
    }

    /// Render the human-readable sidecar body: one `key=value` per line.
    pub fn to_sidecar(&self) -> String {
        let mut lines = self.invocation.to_args();
        lines.push(format!("remote-code-version={}", self.remote_code_version));
        lines.push(format!("remote-started-at={}", self.remote_started_at.to_rfc3339()));
        lines.push(format!("remote-ended-at={}", self.remote_ended_at.to_rfc3339()));
        lines.push(format!("remote-wall-seconds={:.3}", self.remote_wall_seconds));
        lines.push(format!("result-wall-seconds={:.3}", self.result_wall_seconds));
        for (key, value) in &self.extra {
            lines.push(format!("extra-{key}={value}"));
        }
        lines.join("\n") + "\n"
    }
}

fn default_invoked_by() -> String {
    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_else(|_| "unknown".to_string());
    format!("{user}@{}", hostname())
}

fn hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}

fn invoker_code_version() -> String {
    std::env::var("MUNINN_CODE_VERSION").unwrap_or_else(|_| "unknown".to_string())
}

fn remote_code_version() -> String {
    std::env::var("MUNINN_REMOTE_CODE_VERSION")
        .or_else(|_| std::env::var("MUNINN_CODE_VERSION"))
        .unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_args_roundtrip() {
        let meta = InvocationMetadata::new("pipelines/test", "writer-123");
        let parsed = InvocationMetadata::from_args(&meta.to_args()).unwrap();
        // RFC 3339 parsing preserves the instant.
        assert_eq!(parsed.invoked_at.timestamp_millis(), meta.invoked_at.timestamp_millis());
        assert_eq!(parsed.pipeline_id, meta.pipeline_id);
        assert_eq!(parsed.invoker_uuid, "writer-123");
    }

    #[test]
    fn test_missing_field_is_config_error() {
        let err = InvocationMetadata::from_args(&["invoked-by=x".to_string()]).unwrap_err();
        assert!(matches!(err, MuninnError::Config { .. }));
    }

    #[test]
    fn test_result_metadata_wall_seconds() {
        let invocation = InvocationMetadata::new("p", "w");
        let started = invocation.invoked_at + Duration::seconds(2);
        let ended = started + Duration::seconds(3);
        let result = ResultMetadata::from_invocation(invocation, started, ended);
        assert!((result.remote_wall_seconds - 3.0).abs() < 0.01);
        assert!((result.result_wall_seconds - 5.0).abs() < 0.01);
    }

    #[test]
    fn test_sidecar_is_line_per_field() {
        let invocation = InvocationMetadata::new("p", "w");
        let result = ResultMetadata::from_invocation(invocation, Utc::now(), Utc::now());
        let sidecar = result.to_sidecar();
        assert!(sidecar.lines().any(|l| l.starts_with("pipeline-id=")));
        assert!(sidecar.lines().any(|l| l.starts_with("remote-wall-seconds=")));
        assert!(sidecar.ends_with('\n'));
    }
}
