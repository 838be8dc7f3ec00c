//! The shim contract: pluggable dispatch of invocations to a runtime.
//!
//! A shim's only job is to get a remote entry running somewhere with the
//! memo URI and writer id, and to say when the backend is done with it.
//! The runner treats a shim's successful return as permission to look
//! for a result, never as a promise that one exists.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use snafu::Snafu;
use tracing::debug;

use crate::error::MuninnError;
use crate::metadata::InvocationMetadata;
use crate::registry::FunctionRegistry;
use crate::remote::run_remote_entry;

/// The argument bundle a shim forwards to a remote entry.
///
/// Everything is a string because dispatch is, in the end, some kind of
/// command line: the first two arguments are always the memo URI and
/// the writer id; the rest are `key=value` metadata pairs.
#[derive(Debug, Clone)]
pub struct ShimCall {
    /// Memo URI of the invocation to run.
    pub memo_uri: String,
    /// Writer id of the lease this dispatch runs under.
    pub writer_id: String,
    /// `key=value` invocation metadata.
    pub metadata_args: Vec<String>,
}

impl ShimCall {
    /// Build the call bundle for a dispatch.
    pub fn new(memo_uri: &str, writer_id: &str, metadata: &InvocationMetadata) -> Self {
        Self {
            memo_uri: memo_uri.to_string(),
            writer_id: writer_id.to_string(),
            metadata_args: metadata.to_args(),
        }
    }

    /// Flatten into the positional argument list a remote entry expects.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.memo_uri.clone(), self.writer_id.clone()];
        args.extend(self.metadata_args.iter().cloned());
        args
    }

    /// Parse the positional argument list back into a call bundle.
    pub fn from_args(args: &[String]) -> Result<Self, MuninnError> {
        if args.len() < 2 {
            return Err(MuninnError::Config {
                key: "shim-args".to_string(),
                reason: format!("expected at least memo_uri and writer_id, got {} arguments", args.len()),
            });
        }
        Ok(Self {
            memo_uri: args[0].clone(),
            writer_id: args[1].clone(),
            metadata_args: args[2..].to_vec(),
        })
    }
}

/// Errors a shim may report.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ShimError {
    /// The backend never started the remote entry.
    #[snafu(display("dispatch failed: {message}"))]
    DispatchFailed {
        /// Backend-reported reason.
        message: String,
    },

    /// The remote started but died before writing any outcome.
    #[snafu(display("remote crashed: {message}"))]
    RemoteCrashed {
        /// Backend-reported reason (exit code, pod status, ...).
        message: String,
    },

    /// The remote exited voluntarily after observing a foreign writer.
    #[snafu(display("remote exited: lock was stolen"))]
    LockWasStolen,
}

impl ShimError {
    /// Lift into the crate error taxonomy for a given memo URI.
    pub fn into_muninn(self, memo_uri: &str) -> MuninnError {
        match self {
            ShimError::DispatchFailed { message } => MuninnError::DispatchFailed {
                memo_uri: memo_uri.to_string(),
                reason: message,
            },
            ShimError::RemoteCrashed { message } => MuninnError::ResultMissing {
                memo_uri: format!("{memo_uri} ({message})"),
            },
            ShimError::LockWasStolen => MuninnError::LockWasStolen {
                memo_uri: memo_uri.to_string(),
                current_writer: String::new(),
            },
        }
    }
}

/// A future resolving when an asynchronous backend finishes the run.
pub type ShimFuture = BoxFuture<'static, Result<(), ShimError>>;

/// A backend that blocks until the remote run has completed.
#[async_trait]
pub trait SyncShim: Send + Sync {
    /// Run the invocation to completion.
    async fn dispatch(&self, call: &ShimCall) -> Result<(), ShimError>;
}

/// A backend that accepts the job and completes later.
#[async_trait]
pub trait FutureShim: Send + Sync {
    /// Submit the invocation; the returned future resolves on completion.
    async fn dispatch(&self, call: &ShimCall) -> Result<ShimFuture, ShimError>;
}

/// A dispatcher, in one of its two shapes.
#[derive(Clone)]
pub enum Shim {
    /// Returns only after the remote has finished.
    Sync(Arc<dyn SyncShim>),
    /// Returns as soon as the backend accepts the job.
    Future(Arc<dyn FutureShim>),
}

impl Shim {
    /// Dispatch and wait for backend completion, whichever shape this is.
    pub async fn dispatch_and_wait(&self, call: &ShimCall) -> Result<(), ShimError> {
        match self {
            Shim::Sync(shim) => shim.dispatch(call).await,
            Shim::Future(shim) => {
                let pending = shim.dispatch(call).await?;
                pending.await
            }
        }
    }
}

/// Runs the remote entry on the current task: memoization and leasing
/// without transferring control to another process.
pub struct InProcessShim {
    registry: Arc<FunctionRegistry>,
}

impl InProcessShim {
    /// Create a shim over the registry the "remote" should resolve with.
    pub fn new(registry: Arc<FunctionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SyncShim for InProcessShim {
    async fn dispatch(&self, call: &ShimCall) -> Result<(), ShimError> {
        debug!(memo_uri = %call.memo_uri, "running invocation in-process");
        match run_remote_entry(&self.registry, &call.to_args()).await {
            Ok(()) => Ok(()),
            Err(MuninnError::LockWasStolen { .. }) => Err(ShimError::LockWasStolen),
            Err(err) => Err(ShimError::RemoteCrashed { message: err.to_string() }),
        }
    }
}

/// Re-enters a remote-entry binary in a subprocess.
pub struct SubprocessShim {
    program: String,
    args_prefix: Vec<String>,
    env: BTreeMap<String, String>,
}

impl SubprocessShim {
    /// Dispatch through `program [prefix args] <memo_uri> <writer_id> ...`.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args_prefix: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Prepend fixed arguments before the shim call arguments.
    pub fn with_args_prefix(mut self, args: Vec<String>) -> Self {
        self.args_prefix = args;
        self
    }

    /// Set an environment variable for the child.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl SyncShim for SubprocessShim {
    async fn dispatch(&self, call: &ShimCall) -> Result<(), ShimError> {
        debug!(memo_uri = %call.memo_uri, program = %self.program, "dispatching to subprocess");
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(&self.args_prefix)
            .args(call.to_args())
            .stdin(Stdio::null())
            .envs(&self.env);
        let status = command
            .status()
            .await
            .map_err(|e| ShimError::DispatchFailed { message: e.to_string() })?;
        if status.success() {
            Ok(())
        } else {
            Err(ShimError::RemoteCrashed {
                message: format!("remote entry exited with {status}"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shim_call_args_roundtrip() {
        let call = ShimCall {
            memo_uri: "memory://t/mops2-mpf/p/m--f/Hash".to_string(),
            writer_id: "BoldBear.xyz".to_string(),
            metadata_args: vec!["pipeline-id=p".to_string()],
        };
        let parsed = ShimCall::from_args(&call.to_args()).unwrap();
        assert_eq!(parsed.memo_uri, call.memo_uri);
        assert_eq!(parsed.writer_id, call.writer_id);
        assert_eq!(parsed.metadata_args, call.metadata_args);
    }

    #[test]
    fn test_too_few_args_is_config_error() {
        let err = ShimCall::from_args(&["only-one".to_string()]).unwrap_err();
        assert!(matches!(err, MuninnError::Config { .. }));
    }

    #[test]
    fn test_shim_error_mapping() {
        let err = ShimError::DispatchFailed { message: "no backend".into() }.into_muninn("memory://m");
        assert!(matches!(err, MuninnError::DispatchFailed { .. }));
        let err = ShimError::LockWasStolen.into_muninn("memory://m");
        assert!(matches!(err, MuninnError::LockWasStolen { .. }));
    }
}
