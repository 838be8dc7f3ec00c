//! Memospace assembly and memo URI parsing.
//!
//! The memospace is everything up to but not including the argument
//! hash. Applications can override it per function through an ordered
//! list of handlers, which is how memoized results from one pipeline
//! are stitched into another without touching call sites.

use tracing::debug;

use crate::constants::CALLS_PREFIX;
use crate::constants::RUNNER_PREFIX;
use crate::store::join_uri;

use super::function_id::function_segment;
use super::function_id::parse_function_segment;
use super::FunctionId;

/// A memospace override: given the function segment rendering and the
/// runner prefix, return a replacement memospace or `None` to pass.
pub type MemospaceHandler = Box<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// Compose the memospace for a function.
///
/// Handlers are consulted in order; the first non-`None` wins.
/// Otherwise the memospace is
/// `<blob_root>/<runner prefix>/<pipeline_id>/<function_id>[@<logic_key>]`.
pub fn make_function_memospace(
    blob_root: &str,
    runner_prefix_segment: &str,
    pipeline_id: &str,
    function_id: &FunctionId,
    logic_key: Option<&str>,
    handlers: &[MemospaceHandler],
) -> String {
    let runner_prefix = join_uri(blob_root, [runner_prefix_segment]);
    let function_name = function_segment(function_id, logic_key);
    for handler in handlers {
        if let Some(memospace) = handler(&function_name, &runner_prefix) {
            debug!(function = %function_name, memospace, "memospace overridden by handler");
            return memospace;
        }
    }
    join_uri(&runner_prefix, [pipeline_id, function_name.as_str()])
}

/// Append calls segments and the argument hash to a memospace.
pub fn make_memo_uri(memospace: &str, calls: &[String], arg_hash: &str) -> String {
    let mut segments: Vec<&str> = calls.iter().map(String::as_str).collect();
    segments.push(arg_hash);
    join_uri(memospace, segments)
}

/// The parsed components of a memo URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoComponents {
    /// Storage root plus the fixed runner prefix.
    pub runner_prefix: String,
    /// Pipeline id (may contain `/` segments).
    pub pipeline_id: String,
    /// Identity of the memoized function.
    pub function_id: FunctionId,
    /// The function's logic key, if present in the URI.
    pub logic_key: Option<String>,
    /// `calls-` segments, in URI order.
    pub calls: Vec<String>,
    /// The argument hash.
    pub arg_hash: String,
}

/// Split a memo URI produced by [`make_memo_uri`] back into components.
///
/// Works backwards from the end: the last segment is the hash, `calls-`
/// segments precede it, then the function segment (id plus optional
/// `@`-separated logic key); whatever sits between the runner prefix
/// and the function segment is the pipeline id.
pub fn parse_memo_uri(memo_uri: &str) -> Option<MemoComponents> {
    let marker = format!("/{RUNNER_PREFIX}/");
    let marker_idx = memo_uri.find(&marker)?;
    let runner_prefix = memo_uri[..marker_idx + marker.len() - 1].to_string();
    let rest = &memo_uri[marker_idx + marker.len()..];

    let mut segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let arg_hash = segments.pop()?.to_string();

    let mut calls = Vec::new();
    while segments.last().is_some_and(|s| s.starts_with(CALLS_PREFIX)) {
        calls.push(segments.pop().unwrap().to_string());
    }
    calls.reverse();

    let (function_id, logic_key) = parse_function_segment(segments.pop()?)?;

    if segments.is_empty() {
        return None;
    }
    Some(MemoComponents {
        runner_prefix,
        pipeline_id: segments.join("/"),
        function_id,
        logic_key,
        calls,
        arg_hash,
    })
}
