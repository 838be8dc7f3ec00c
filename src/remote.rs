//! The remote-side entry point.
//!
//! A finite sequential program: check the lock, fetch the invocation,
//! co-maintain the lease, run the user function, publish the outcome.
//! Exits cleanly only after a result or exception envelope is written;
//! any machinery failure leaves nothing behind, which the orchestrator
//! reads as a remote crash.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::constants::EXCEPTION_DIR;
use crate::constants::INVOCATION;
use crate::constants::RESULT_DIR;
use crate::constants::RESULT_METADATA_DIR;
use crate::envelope;
use crate::envelope::ExceptionRepr;
use crate::envelope::InvocationEnvelope;
use crate::envelope::ResultEnvelope;
use crate::error::MuninnError;
use crate::lease::remote_lease_writer;
use crate::lease::LeaseMaintainer;
use crate::memo::parse_memo_uri;
use crate::metadata::InvocationMetadata;
use crate::metadata::ResultMetadata;
use crate::registry::CallContext;
use crate::registry::FunctionRegistry;
use crate::run_id::new_run_id;
use crate::shim::ShimCall;
use crate::source::local_bytes;
use crate::source::shared_uri;
use crate::source::upload_source;
use crate::source::write_hashref;
use crate::source::SourceRef;
use crate::store::join_uri;
use crate::store::lookup_store;
use crate::store::split_uri;
use crate::store::with_retries;
use crate::store::BlobStore;
use crate::value::Value;

/// Storage root a memo URI was built under.
///
/// Everything before the runner-prefix marker; falls back to the
/// scheme root for URIs built with a nonstandard prefix.
pub fn storage_root_of(memo_uri: &str) -> String {
    if let Some(components) = parse_memo_uri(memo_uri) {
        if let Some(root) = components.runner_prefix.rsplit_once('/') {
            return root.0.to_string();
        }
    }
    split_uri(memo_uri).map(|(root, _)| root).unwrap_or_else(|| memo_uri.to_string())
}

/// Run one pickled invocation: the handler behind every shim.
///
/// `args` is the flat argument list a shim forwards: memo URI, writer
/// id, then `key=value` metadata pairs.
#[instrument(skip_all, fields(memo_uri = args.first().map(String::as_str).unwrap_or("?")))]
pub async fn run_remote_entry(registry: &FunctionRegistry, args: &[String]) -> Result<(), MuninnError> {
    let call = ShimCall::from_args(args)?;
    let store = lookup_store(&call.memo_uri).map_err(|source| MuninnError::Storage {
        uri: call.memo_uri.clone(),
        source,
    })?;
    let root = storage_root_of(&call.memo_uri);

    // Refuse to run under a lock we were not dispatched with. This is
    // the cooperative half of last-writer-wins: the losing chain's
    // remote exits here instead of racing the winner to the result.
    let co_lease = remote_lease_writer(store.clone(), &call.memo_uri, &call.writer_id).await?;
    let maintenance = co_lease.map(|handle| LeaseMaintainer::global().register(handle));

    let outcome = execute_invocation(registry, store.clone(), &root, &call).await;

    if let Some(guard) = maintenance {
        // Never release from the remote: the orchestrator owns that.
        guard.stop();
    }
    outcome
}

async fn execute_invocation(
    registry: &FunctionRegistry,
    store: Arc<dyn BlobStore>,
    root: &str,
    call: &ShimCall,
) -> Result<(), MuninnError> {
    let invocation_uri = join_uri(&call.memo_uri, [INVOCATION]);
    let data = with_retries("invocation-get", || store.get(&invocation_uri))
        .await
        .map_err(|source| MuninnError::Storage {
            uri: invocation_uri.clone(),
            source,
        })?;
    let invocation: InvocationEnvelope = envelope::decode(&invocation_uri, &data)?;
    let thunk = invocation.thunk;
    let def = registry.get(&thunk.func_ref)?;
    info!(function = %thunk.func_ref, "remote invocation starting");

    let metadata = InvocationMetadata::from_args(&call.metadata_args).unwrap_or_else(|_| {
        // A minimal shim passed only the required two arguments.
        let pipeline_id = parse_memo_uri(&call.memo_uri).map(|c| c.pipeline_id).unwrap_or_default();
        InvocationMetadata::new(&pipeline_id, &call.writer_id)
    });

    // The URI, not the metadata, is authoritative for the pipeline the
    // shared objects were uploaded under.
    let pipeline_id = parse_memo_uri(&call.memo_uri)
        .map(|c| c.pipeline_id)
        .unwrap_or_else(|| metadata.pipeline_id.clone());
    let mut args = thunk.args;
    let mut kwargs = thunk.kwargs;
    for value in args.iter_mut().chain(kwargs.values_mut()) {
        fetch_shared_into(value, store.as_ref(), root, &pipeline_id).await?;
    }

    let ctx = CallContext::new(args, kwargs, store.clone(), root.to_string());
    let started_at = Utc::now();
    let run_outcome = std::panic::AssertUnwindSafe(def.function().run(ctx)).catch_unwind().await;
    let ended_at = Utc::now();

    let mut result_metadata = ResultMetadata::from_invocation(metadata, started_at, ended_at);
    result_metadata
        .extra
        .insert("remote-hostname".to_string(), std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()));
    result_metadata.extra.insert("remote-pid".to_string(), std::process::id().to_string());

    let run_id = new_run_id();
    let envelope = match run_outcome {
        Ok(Ok(mut value)) => {
            let sources = publish_returned_sources(store.as_ref(), root, &mut value).await?;
            debug!(run_id = %run_id, "remote function returned a value");
            ResultEnvelope::ok(value, result_metadata, sources)
        }
        Ok(Err(user_error)) => {
            warn!(run_id = %run_id, error = %user_error, "remote function raised");
            ResultEnvelope::err(
                ExceptionRepr {
                    type_name: user_error.type_name,
                    message: user_error.message,
                    traceback: user_error.traceback,
                },
                result_metadata,
            )
        }
        Err(panic) => {
            let message = panic_message(panic);
            warn!(run_id = %run_id, message = %message, "remote function panicked");
            ResultEnvelope::err(
                ExceptionRepr {
                    type_name: "Panic".to_string(),
                    message,
                    traceback: String::new(),
                },
                result_metadata,
            )
        }
    };

    let directory = match envelope.kind {
        crate::envelope::OutcomeKind::Ok => RESULT_DIR,
        crate::envelope::OutcomeKind::Err => EXCEPTION_DIR,
    };
    let outcome_uri = join_uri(&call.memo_uri, [directory, run_id.as_str()]);
    let payload = envelope::encode(&envelope)?;
    with_retries("outcome-put", || store.put(&outcome_uri, payload.clone(), "application/json"))
        .await
        .map_err(|source| MuninnError::Storage {
            uri: outcome_uri.clone(),
            source,
        })?;

    let sidecar_uri = join_uri(&call.memo_uri, [RESULT_METADATA_DIR, run_id.as_str()]);
    let sidecar = Bytes::from(envelope.metadata.to_sidecar());
    if let Err(e) = with_retries("sidecar-put", || store.put(&sidecar_uri, sidecar.clone(), "text/plain")).await {
        // The sidecar is advisory; the outcome envelope is already
        // committed, so a failure here must not fail the run.
        warn!(uri = %sidecar_uri, error = %e, "could not write result-metadata sidecar");
    }

    info!(uri = %outcome_uri, "remote outcome written");
    Ok(())
}

/// Replace shared references with their fetched values.
///
/// Two passes: collect and fetch every referenced shared object, then
/// substitute the fetched values into the tree.
async fn fetch_shared_into(
    value: &mut Value,
    store: &dyn BlobStore,
    root: &str,
    pipeline_id: &str,
) -> Result<(), MuninnError> {
    let mut refs: Vec<crate::source::SharedRef> = Vec::new();
    value.visit_shared(&mut |shared| refs.push(shared.clone()));
    if refs.is_empty() {
        return Ok(());
    }

    let mut fetched: BTreeMap<String, Value> = BTreeMap::new();
    for shared in refs {
        let uri = shared_uri(root, pipeline_id, &shared);
        if fetched.contains_key(&uri) {
            continue;
        }
        let data = with_retries("shared-get", || store.get(&uri))
            .await
            .map_err(|source| MuninnError::Storage { uri: uri.clone(), source })?;
        let resolved: Value = serde_json::from_slice(&data).map_err(|e| MuninnError::CorruptControlFile {
            uri: uri.clone(),
            reason: format!("shared object is not a value: {e}"),
        })?;
        fetched.insert(uri, resolved);
    }

    value.resolve_shared(&mut |shared| fetched.get(&shared_uri(root, pipeline_id, shared)).cloned());
    Ok(())
}

/// Upload every locally-known source in a returned value and stamp its
/// URI into the reference, so the result envelope is self-contained.
async fn publish_returned_sources(
    store: &dyn BlobStore,
    root: &str,
    value: &mut Value,
) -> Result<Vec<SourceRef>, MuninnError> {
    let mut refs: Vec<SourceRef> = Vec::new();
    value.visit_sources(&mut |source_ref| refs.push(source_ref.clone()));

    let mut published: BTreeMap<String, String> = BTreeMap::new();
    for source_ref in &refs {
        if source_ref.uri.is_some() {
            continue;
        }
        let Some(data) = local_bytes(&source_ref.hash).await? else {
            return Err(MuninnError::Serialization {
                path: "$return".to_string(),
                reason: format!(
                    "returned source {} has no local bytes and no uploaded URI",
                    source_ref.hash
                ),
            });
        };
        let uri = upload_source(store, root, &source_ref.hash, data).await?;
        write_hashref(store, root, &source_ref.hash, &uri).await?;
        published.insert(source_ref.hash.to_string(), uri);
    }

    let mut sources = Vec::new();
    value.rewrite_sources(&mut |source_ref| {
        if source_ref.uri.is_none() {
            if let Some(uri) = published.get(&source_ref.hash.to_string()) {
                source_ref.uri = Some(uri.clone());
            }
        }
        sources.push(source_ref.clone());
    });
    Ok(sources)
}

/// Entry-point wrapper with process exit semantics: exit 0 only after
/// an outcome envelope is written; any other path leaves no result and
/// exits non-zero, which the orchestrator reads as a remote failure.
pub async fn remote_main(registry: &FunctionRegistry, args: &[String]) -> std::process::ExitCode {
    let started = std::time::Instant::now();
    info!(pid = std::process::id(), "entering remote process");
    let code = match run_remote_entry(registry, args).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(MuninnError::LockWasStolen { memo_uri, current_writer }) => {
            warn!(memo_uri = %memo_uri, current_writer = %current_writer, "exiting without running: lock was stolen");
            std::process::ExitCode::from(3)
        }
        Err(err) => {
            tracing::error!(error = %err, "remote entry failed");
            std::process::ExitCode::FAILURE
        }
    };
    info!(
        pid = std::process::id(),
        elapsed_seconds = started.elapsed().as_secs_f64(),
        "exiting remote process"
    );
    code
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
