//! Argument hashing.

use std::collections::BTreeMap;

use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::MuninnError;
use crate::humenc;
use crate::value::Value;

/// Canonical hash input: the bound arguments, nothing else.
///
/// Callee logic keys are visible `calls-` path segments in the memo
/// URI and are deliberately kept out of the hash, so a reader can
/// trust that the hash derives from the args and kwargs alone. Field
/// order is fixed; this struct's serialized form is the *SER-P*
/// hashing contract and must never change shape.
#[derive(Serialize)]
struct HashInput<'a> {
    args: &'a [Value],
    kwargs: &'a BTreeMap<String, Value>,
}

/// Compute the human-encoded SHA-256 of a call's canonicalized arguments.
///
/// Equal argument structures always produce the same hash, across
/// processes and runs; this is the bottom level of the memo key.
pub fn argument_hash(args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<String, MuninnError> {
    let bytes = argument_bytes(args, kwargs)?;
    Ok(humenc::encode(&Sha256::digest(&bytes)))
}

/// Canonical serialized form of the hash input.
pub fn argument_bytes(args: &[Value], kwargs: &BTreeMap<String, Value>) -> Result<Vec<u8>, MuninnError> {
    let mut canonical_args = args.to_vec();
    for (i, arg) in canonical_args.iter_mut().enumerate() {
        arg.canonicalize(&format!("args[{i}]"))?;
    }
    let mut canonical_kwargs = kwargs.clone();
    for (key, arg) in canonical_kwargs.iter_mut() {
        arg.canonicalize(&format!("kwargs.{key}"))?;
    }
    let input = HashInput {
        args: &canonical_args,
        kwargs: &canonical_kwargs,
    };
    serde_json::to_vec(&input).map_err(|e| MuninnError::Serialization {
        path: "$".to_string(),
        reason: e.to_string(),
    })
}
