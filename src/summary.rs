//! Per-process run summary.
//!
//! Every call appends one JSON record to an append-only log under a
//! run directory named for this process. The summary is best-effort
//! observability: failures to write it are logged and swallowed, never
//! surfaced to the caller.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::humenc;

/// How a call was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationType {
    /// Returned from cache without dispatching.
    Memoized,
    /// Dispatched through the shim by this process.
    Invoked,
    /// Another party ran it; this process waited and read the result.
    Awaited,
}

/// One record in the summary log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRecord {
    /// Memo URI of the call.
    pub memo_uri: String,
    /// `module--name` of the function.
    pub function_name: String,
    /// How the call was satisfied.
    pub status: InvocationType,
    /// When the record was written.
    pub timestamp: DateTime<Utc>,
    /// Whether the outcome was an exception.
    pub was_error: bool,
    /// Pipeline id the call ran under.
    pub pipeline_id: String,
    /// Remote wall seconds, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub remote_wall_seconds: Option<f64>,
    /// Wall seconds from invocation to result, when known.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result_wall_seconds: Option<f64>,
    /// Content-addressed URIs discovered in the return value.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub source_uris: Vec<String>,
}

/// The append-only summary log for this process.
pub struct RunSummary {
    file: Option<Mutex<tokio::fs::File>>,
    directory: Option<PathBuf>,
}

impl RunSummary {
    /// Open a run directory and its log file. A `None` directory (or a
    /// directory that cannot be created) disables summarizing.
    pub async fn create(summary_dir: Option<PathBuf>) -> Arc<Self> {
        let Some(base) = summary_dir else {
            return Arc::new(Self {
                file: None,
                directory: None,
            });
        };
        let suffix: u8 = rand::rng().random();
        let run_name = format!(
            "{}-p{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S"),
            std::process::id(),
            humenc::word(suffix),
        );
        let directory = base.join(run_name);
        match tokio::fs::create_dir_all(&directory).await {
            Ok(()) => {}
            Err(e) => {
                warn!(directory = %directory.display(), error = %e, "cannot create summary directory; summaries disabled");
                return Arc::new(Self {
                    file: None,
                    directory: None,
                });
            }
        }
        let path = directory.join("calls.jsonl");
        match tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(file) => {
                debug!(path = %path.display(), "run summary opened");
                Arc::new(Self {
                    file: Some(Mutex::new(file)),
                    directory: Some(directory),
                })
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open summary log; summaries disabled");
                Arc::new(Self {
                    file: None,
                    directory: None,
                })
            }
        }
    }

    /// The run directory, if summarizing is active.
    pub fn directory(&self) -> Option<&PathBuf> {
        self.directory.as_ref()
    }

    /// Append one record. Failures are logged, never propagated.
    pub async fn append(&self, record: &SummaryRecord) {
        let Some(file) = &self.file else { return };
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "cannot encode summary record");
                return;
            }
        };
        line.push(b'\n');
        let mut file = file.lock().await;
        if let Err(e) = file.write_all(&line).await {
            warn!(error = %e, "cannot append summary record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(status: InvocationType) -> SummaryRecord {
        SummaryRecord {
            memo_uri: "memory://t/mops2-mpf/p/m--f/Hash".to_string(),
            function_name: "m--f".to_string(),
            status,
            timestamp: Utc::now(),
            was_error: false,
            pipeline_id: "p".to_string(),
            remote_wall_seconds: Some(1.5),
            result_wall_seconds: None,
            source_uris: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_appends_one_json_line_per_call() {
        let dir = TempDir::new().unwrap();
        let summary = RunSummary::create(Some(dir.path().to_path_buf())).await;
        summary.append(&record(InvocationType::Invoked)).await;
        summary.append(&record(InvocationType::Memoized)).await;

        let log = summary.directory().unwrap().join("calls.jsonl");
        let contents = std::fs::read_to_string(log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: SummaryRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.status, InvocationType::Invoked);
    }

    #[tokio::test]
    async fn test_disabled_summary_is_silent() {
        let summary = RunSummary::create(None).await;
        summary.append(&record(InvocationType::Awaited)).await;
        assert!(summary.directory().is_none());
    }
}
