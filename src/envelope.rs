//! Serialized control-file envelopes.
//!
//! Every control file is JSON with a pinned format marker, so stored
//! artifacts remain debuggable with nothing but a text viewer and stay
//! decodable across versions that share the marker.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::Deserialize;
use serde::Serialize;

use crate::constants::SER_PROTOCOL;
use crate::error::MuninnError;
use crate::metadata::ResultMetadata;
use crate::source::SourceRef;
use crate::value::Value;

/// A single invocation: the function reference plus its arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thunk {
    /// Fully qualified name of the callable (`module--name`).
    pub func_ref: String,
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments, ordered by name.
    pub kwargs: BTreeMap<String, Value>,
}

/// The `invocation` control file.
///
/// Contains only deterministic content: two callers producing the same
/// memo URI must produce byte-identical invocation envelopes, which is
/// what makes the write-once rule safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationEnvelope {
    /// Envelope format marker.
    pub format: String,
    /// The serialized call.
    pub thunk: Thunk,
}

impl InvocationEnvelope {
    /// Wrap a thunk in the current envelope format.
    pub fn new(thunk: Thunk) -> Self {
        Self {
            format: SER_PROTOCOL.to_string(),
            thunk,
        }
    }
}

/// Outcome discriminator for result envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeKind {
    /// The function returned a value.
    Ok,
    /// The function raised.
    Err,
}

/// Serialized representation of a remote exception.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExceptionRepr {
    /// Exception type name as reported remotely.
    pub type_name: String,
    /// Exception message.
    pub message: String,
    /// Remote traceback, as text.
    pub traceback: String,
}

/// The `result/<run_id>` or `exception/<run_id>` control file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    /// Envelope format marker.
    pub format: String,
    /// Whether this is a return value or a raised exception.
    pub kind: OutcomeKind,
    /// Returned value (present when `kind` is `ok`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value: Option<Value>,
    /// Raised exception (present when `kind` is `err`).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ExceptionRepr>,
    /// Execution metadata.
    pub metadata: ResultMetadata,
    /// Content-addressed blobs referenced by the value.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceRef>,
}

impl ResultEnvelope {
    /// Build an `ok` envelope around a returned value.
    pub fn ok(value: Value, metadata: ResultMetadata, sources: Vec<SourceRef>) -> Self {
        Self {
            format: SER_PROTOCOL.to_string(),
            kind: OutcomeKind::Ok,
            value: Some(value),
            error: None,
            metadata,
            sources,
        }
    }

    /// Build an `err` envelope around a raised exception.
    pub fn err(error: ExceptionRepr, metadata: ResultMetadata) -> Self {
        Self {
            format: SER_PROTOCOL.to_string(),
            kind: OutcomeKind::Err,
            value: None,
            error: Some(error),
            metadata,
            sources: Vec::new(),
        }
    }
}

/// Encode an envelope as control-file bytes.
pub fn encode<T: Serialize>(envelope: &T) -> Result<Bytes, MuninnError> {
    let data = serde_json::to_vec_pretty(envelope).map_err(|e| MuninnError::Serialization {
        path: "$".to_string(),
        reason: e.to_string(),
    })?;
    Ok(Bytes::from(data))
}

/// Decode control-file bytes read from `uri`.
pub fn decode<T: for<'de> Deserialize<'de>>(uri: &str, data: &[u8]) -> Result<T, MuninnError> {
    serde_json::from_slice(data).map_err(|e| MuninnError::CorruptControlFile {
        uri: uri.to_string(),
        reason: e.to_string(),
    })
}
