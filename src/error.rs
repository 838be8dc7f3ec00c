//! Error taxonomy for the runner.
//!
//! Internal failures never masquerade as user errors: an exception raised
//! by the invoked function always surfaces as [`MuninnError::RemoteException`],
//! while everything else in this enum is a failure of the machinery itself.

use snafu::Snafu;

use crate::store::BlobStoreError;

/// Result type for runner operations.
pub type Result<T, E = MuninnError> = std::result::Result<T, E>;

/// Errors that can occur while orchestrating or executing a call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MuninnError {
    /// Blob store operation failed after retries.
    #[snafu(display("storage error at {uri}: {source}"))]
    Storage {
        /// URI of the failing operation.
        uri: String,
        /// Underlying store error.
        source: BlobStoreError,
    },

    /// A value could not be serialized.
    #[snafu(display("cannot serialize value at {path}: {reason}"))]
    Serialization {
        /// Path into the value graph naming the offending element.
        path: String,
        /// Why serialization failed.
        reason: String,
    },

    /// A control file could not be decoded.
    #[snafu(display("corrupt control file at {uri}: {reason}"))]
    CorruptControlFile {
        /// URI of the unreadable control file.
        uri: String,
        /// Why decoding failed.
        reason: String,
    },

    /// The shim never reached the remote runtime.
    #[snafu(display("shim dispatch failed for {memo_uri}: {reason}"))]
    DispatchFailed {
        /// Memo URI of the call being dispatched.
        memo_uri: String,
        /// Backend-reported reason.
        reason: String,
    },

    /// The shim completed but no result or exception was written.
    #[snafu(display("shim for {memo_uri} completed but no result was found"))]
    ResultMissing {
        /// Memo URI of the call that produced nothing.
        memo_uri: String,
    },

    /// Another writer took over the lease; this invocation chain must stop.
    #[snafu(display("lease for {memo_uri} was taken by writer {current_writer}"))]
    LockWasStolen {
        /// Memo URI whose lease changed hands.
        memo_uri: String,
        /// Writer id currently holding the lease.
        current_writer: String,
    },

    /// A content-addressed blob did not match its expected hash.
    #[snafu(display("hash mismatch at {uri}: expected {expected}, got {actual}"))]
    HashMismatch {
        /// URI of the corrupt blob.
        uri: String,
        /// Hash recorded in the reference.
        expected: String,
        /// Hash of the bytes actually read.
        actual: String,
    },

    /// A cache miss occurred while `require_all_results` was set.
    #[snafu(display("required result for {memo_uri} was not found"))]
    RequiredResultMissing {
        /// Memo URI that had no memoized result.
        memo_uri: String,
    },

    /// The remote user function raised; re-raised here with its remote context.
    #[snafu(display("remote function raised {type_name}: {message}"))]
    RemoteException {
        /// Exception type as reported by the remote runtime.
        type_name: String,
        /// Exception message.
        message: String,
        /// Remote traceback, as text.
        traceback: String,
    },

    /// A function reference was not found in the registry.
    #[snafu(display("no registered function named {func_ref}"))]
    UnknownFunction {
        /// The unresolvable function reference.
        func_ref: String,
    },

    /// Invalid runner configuration.
    #[snafu(display("invalid configuration for {key}: {reason}"))]
    Config {
        /// Configuration key.
        key: String,
        /// Why the value is invalid.
        reason: String,
    },

    /// A submitted call's task was cancelled or panicked before completing.
    #[snafu(display("submitted call failed to complete: {reason}"))]
    TaskFailed {
        /// Join failure description.
        reason: String,
    },
}

/// Coarse classification used by retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Temporary; the same call may succeed if repeated.
    Temporary,
    /// Permanent; repeating the call will not help.
    Permanent,
    /// Cooperative control signal, not a failure of this process.
    Cooperative,
}

impl MuninnError {
    /// Classify this error for retry logic.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Storage { source, .. } if source.is_transient() => ErrorKind::Temporary,
            Self::Storage { .. } => ErrorKind::Permanent,
            Self::Serialization { .. } => ErrorKind::Permanent,
            Self::CorruptControlFile { .. } => ErrorKind::Permanent,
            Self::DispatchFailed { .. } => ErrorKind::Temporary,
            Self::ResultMissing { .. } => ErrorKind::Temporary,
            Self::LockWasStolen { .. } => ErrorKind::Cooperative,
            Self::HashMismatch { .. } => ErrorKind::Permanent,
            Self::RequiredResultMissing { .. } => ErrorKind::Permanent,
            Self::RemoteException { .. } => ErrorKind::Permanent,
            Self::UnknownFunction { .. } => ErrorKind::Permanent,
            Self::Config { .. } => ErrorKind::Permanent,
            Self::TaskFailed { .. } => ErrorKind::Temporary,
        }
    }

    /// Check if the error is worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Temporary)
    }
}
