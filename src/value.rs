//! Portable value model for invocation arguments and results.
//!
//! Values are what crosses the orchestrator/remote boundary: a small
//! tree of JSON-like data plus two reference forms that the serializer
//! treats specially. [`Value::Source`] embeds only a content-hash
//! reference, with the bytes uploaded separately; [`Value::Shared`]
//! names a pipeline-scoped object uploaded once and re-referenced.
//!
//! The canonical encoding is deterministic: map keys are sorted, sets
//! are ordered by their encoded bytes, and byte strings are base64. The
//! hash of a call's arguments is taken over this canonical form.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::error::MuninnError;
use crate::source::SharedRef;
use crate::source::SourceRef;

/// A portable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number. Non-finite values cannot be serialized.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw bytes, encoded as base64 in the serialized form.
    Bytes(#[serde(with = "b64_bytes")] Vec<u8>),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping. Keys serialize in sorted order.
    Map(BTreeMap<String, Value>),
    /// Unordered collection; canonicalized by encoded-byte order before
    /// hashing so insertion order cannot leak into the memo key.
    Set(Vec<Value>),
    /// Reference to a content-addressed large object.
    Source(SourceRef),
    /// Reference to a pipeline-scoped shared object.
    Shared(SharedRef),
}

mod b64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(&encoded).map_err(serde::de::Error::custom)
    }
}

impl Value {
    /// Produce the canonical encoded bytes of this value.
    ///
    /// Fails with a path-bearing serialization error for values that
    /// have no stable portable form (non-finite floats).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, MuninnError> {
        let mut canonical = self.clone();
        canonical.canonicalize("$")?;
        serde_json::to_vec(&canonical).map_err(|e| MuninnError::Serialization {
            path: "$".to_string(),
            reason: e.to_string(),
        })
    }

    /// Canonicalize in place: validate leaves and sort sets.
    ///
    /// `path` names this value's position in the enclosing graph and is
    /// carried into any error.
    pub fn canonicalize(&mut self, path: &str) -> Result<(), MuninnError> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(MuninnError::Serialization {
                path: path.to_string(),
                reason: format!("non-finite float {f} has no canonical form"),
            }),
            Value::List(items) => {
                for (i, item) in items.iter_mut().enumerate() {
                    item.canonicalize(&format!("{path}[{i}]"))?;
                }
                Ok(())
            }
            Value::Map(entries) => {
                for (key, item) in entries.iter_mut() {
                    item.canonicalize(&format!("{path}.{key}"))?;
                }
                Ok(())
            }
            Value::Set(items) => {
                let mut encoded: Vec<(Vec<u8>, Value)> = Vec::with_capacity(items.len());
                for (i, item) in items.iter_mut().enumerate() {
                    let item_path = format!("{path}{{{i}}}");
                    item.canonicalize(&item_path)?;
                    let bytes = serde_json::to_vec(item).map_err(|e| MuninnError::Serialization {
                        path: item_path,
                        reason: e.to_string(),
                    })?;
                    encoded.push((bytes, item.clone()));
                }
                encoded.sort_by(|a, b| a.0.cmp(&b.0));
                encoded.dedup_by(|a, b| a.0 == b.0);
                *items = encoded.into_iter().map(|(_, v)| v).collect();
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Visit every source reference in the tree.
    pub fn visit_sources<'a>(&'a self, visit: &mut dyn FnMut(&'a SourceRef)) {
        match self {
            Value::Source(source) => visit(source),
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.visit_sources(visit);
                }
            }
            Value::Map(entries) => {
                for item in entries.values() {
                    item.visit_sources(visit);
                }
            }
            _ => {}
        }
    }

    /// Rewrite every source reference in the tree, e.g. to stamp in the
    /// URI it was uploaded to.
    pub fn rewrite_sources(&mut self, rewrite: &mut dyn FnMut(&mut SourceRef)) {
        match self {
            Value::Source(source) => rewrite(source),
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.rewrite_sources(rewrite);
                }
            }
            Value::Map(entries) => {
                for item in entries.values_mut() {
                    item.rewrite_sources(rewrite);
                }
            }
            _ => {}
        }
    }

    /// Visit every shared-object reference in the tree.
    pub fn visit_shared<'a>(&'a self, visit: &mut dyn FnMut(&'a SharedRef)) {
        match self {
            Value::Shared(shared) => visit(shared),
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.visit_shared(visit);
                }
            }
            Value::Map(entries) => {
                for item in entries.values() {
                    item.visit_shared(visit);
                }
            }
            _ => {}
        }
    }

    /// Replace shared references using the given resolver.
    pub fn resolve_shared(&mut self, resolve: &mut dyn FnMut(&SharedRef) -> Option<Value>) {
        match self {
            Value::Shared(shared) => {
                if let Some(resolved) = resolve(shared) {
                    *self = resolved;
                }
            }
            Value::List(items) | Value::Set(items) => {
                for item in items {
                    item.resolve_shared(resolve);
                }
            }
            Value::Map(entries) => {
                for item in entries.values_mut() {
                    item.resolve_shared(resolve);
                }
            }
            _ => {}
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}
