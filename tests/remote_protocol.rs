//! Remote-entry behavior and memo key stability.

mod common;

use std::collections::BTreeMap;

use muninn::constants::EXCEPTION_DIR;
use muninn::constants::INVOCATION;
use muninn::constants::RESULT_DIR;
use muninn::envelope;
use muninn::envelope::InvocationEnvelope;
use muninn::lease::AcquireOutcome;
use muninn::lease::Lease;
use muninn::lease::LeaseConfig;
use muninn::run_remote_entry;
use muninn::store::join_uri;
use muninn::store::BlobStore;
use muninn::MuninnError;
use muninn::Thunk;
use muninn::Value;

use common::*;

fn fast_lease_config() -> LeaseConfig {
    LeaseConfig {
        ttl_seconds: 5.0,
        heartbeat: std::time::Duration::from_millis(500),
        confirm_margin: std::time::Duration::from_millis(10),
    }
}

async fn write_invocation(memo_uri: &str, func_ref: &str, args: Vec<Value>) {
    let envelope = InvocationEnvelope::new(Thunk {
        func_ref: func_ref.to_string(),
        args,
        kwargs: BTreeMap::new(),
    });
    let uri = join_uri(memo_uri, [INVOCATION]);
    shared_store().put(&uri, envelope::encode(&envelope).unwrap(), "application/json").await.unwrap();
}

async fn outcome_count(memo_uri: &str) -> usize {
    let results = shared_store().list(&(join_uri(memo_uri, [RESULT_DIR]) + "/")).await.unwrap();
    let exceptions = shared_store().list(&(join_uri(memo_uri, [EXCEPTION_DIR]) + "/")).await.unwrap();
    results.len() + exceptions.len()
}

#[tokio::test]
async fn test_remote_exits_when_lock_was_stolen() {
    // Property 8: a remote dispatched under a superseded writer id
    // exits without writing anything.
    let root = fresh_root("steal");
    let registry = test_registry("");
    let runner = build_runner(registry.clone(), test_config(&root, "itest"), None).await;
    let def = registry.get("demo--add").unwrap();
    let args = vec![Value::Int(2), Value::Int(2)];
    let memo_uri = runner.memo_uri_for(&def, &args, &no_kwargs()).unwrap();
    write_invocation(&memo_uri, "demo--add", args).await;

    // The lock is held by the current winner...
    let lease = Lease::new(shared_store(), &memo_uri, fast_lease_config());
    let AcquireOutcome::Acquired(_handle) = lease.try_acquire(&BTreeMap::new()).await.unwrap() else {
        panic!("expected acquisition");
    };

    // ...while a remote from a superseded chain starts up.
    let entry_args = vec![memo_uri.clone(), "superseded-writer-id".to_string()];
    let err = run_remote_entry(&registry, &entry_args).await.unwrap_err();
    assert!(matches!(err, MuninnError::LockWasStolen { .. }));
    assert_eq!(outcome_count(&memo_uri).await, 0);
}

#[tokio::test]
async fn test_remote_runs_under_matching_writer() {
    let root = fresh_root("match");
    let registry = test_registry("");
    let runner = build_runner(registry.clone(), test_config(&root, "itest"), None).await;
    let def = registry.get("demo--add").unwrap();
    let args = vec![Value::Int(30), Value::Int(12)];
    let memo_uri = runner.memo_uri_for(&def, &args, &no_kwargs()).unwrap();
    write_invocation(&memo_uri, "demo--add", args).await;

    let lease = Lease::new(shared_store(), &memo_uri, fast_lease_config());
    let AcquireOutcome::Acquired(handle) = lease.try_acquire(&BTreeMap::new()).await.unwrap() else {
        panic!("expected acquisition");
    };

    let entry_args = vec![memo_uri.clone(), handle.writer_id().to_string()];
    run_remote_entry(&registry, &entry_args).await.unwrap();
    assert_eq!(outcome_count(&memo_uri).await, 1);

    // The orchestrator (not the remote) still owns release.
    handle.release().await.unwrap();
    assert!(shared_store().head(&join_uri(&memo_uri, ["lock"])).await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_without_lock_proceeds() {
    // Leases disabled on the orchestrator: no lock file exists and the
    // remote runs anyway.
    let root = fresh_root("lockless");
    let registry = test_registry("");
    let runner = build_runner(registry.clone(), test_config(&root, "itest"), None).await;
    let def = registry.get("demo--add").unwrap();
    let args = vec![Value::Int(1), Value::Int(2)];
    let memo_uri = runner.memo_uri_for(&def, &args, &no_kwargs()).unwrap();
    write_invocation(&memo_uri, "demo--add", args).await;

    let entry_args = vec![memo_uri.clone(), "any-writer".to_string()];
    run_remote_entry(&registry, &entry_args).await.unwrap();
    assert_eq!(outcome_count(&memo_uri).await, 1);
}

#[tokio::test]
async fn test_unknown_function_writes_no_outcome() {
    // A machinery failure must leave nothing behind: the orchestrator
    // reads the absence as a remote crash.
    let root = fresh_root("unknown");
    let memo_uri = format!("{root}/mops2-mpf/itest/ghost--fn/SomeHash");
    write_invocation(&memo_uri, "ghost--fn", vec![]).await;

    let registry = test_registry("");
    let entry_args = vec![memo_uri.clone(), "writer".to_string()];
    let err = run_remote_entry(&registry, &entry_args).await.unwrap_err();
    assert!(matches!(err, MuninnError::UnknownFunction { .. }));
    assert_eq!(outcome_count(&memo_uri).await, 0);
}

#[tokio::test]
async fn test_memo_uri_is_deterministic_across_runners() {
    // Properties 1 and 2: independently-built runners with the same
    // configuration derive byte-identical memo URIs.
    let root = fresh_root("determinism");
    let registry_a = test_registry("function-logic-key: v1");
    let registry_b = test_registry("function-logic-key: v1");
    let runner_a = build_runner(registry_a.clone(), test_config(&root, "pipe"), None).await;
    let runner_b = build_runner(registry_b.clone(), test_config(&root, "pipe"), None).await;

    let def_a = registry_a.get("demo--add").unwrap();
    let def_b = registry_b.get("demo--add").unwrap();

    let mut kwargs = BTreeMap::new();
    kwargs.insert("mode".to_string(), Value::Str("fast".to_string()));
    let args = vec![Value::Int(7), Value::Set(vec![Value::Int(2), Value::Int(1)])];

    let uri_a = runner_a.memo_uri_for(&def_a, &args, &kwargs).unwrap();
    let uri_b = runner_b.memo_uri_for(&def_b, &args, &kwargs).unwrap();
    assert_eq!(uri_a, uri_b);

    // Set ordering inside an argument does not perturb the key.
    let reordered = vec![Value::Int(7), Value::Set(vec![Value::Int(1), Value::Int(2)])];
    let uri_c = runner_a.memo_uri_for(&def_a, &reordered, &kwargs).unwrap();
    assert_eq!(uri_a, uri_c);

    // Different arguments perturb it.
    let different = vec![Value::Int(8), Value::Set(vec![Value::Int(1), Value::Int(2)])];
    let uri_d = runner_a.memo_uri_for(&def_a, &different, &kwargs).unwrap();
    assert_ne!(uri_a, uri_d);
}

#[tokio::test]
async fn test_serialization_error_names_offending_argument() {
    // Property 9: the error points at the argument that cannot be
    // serialized.
    let root = fresh_root("serr");
    let registry = test_registry("");
    let runner = build_runner(registry.clone(), test_config(&root, "itest"), None).await;
    let def = registry.get("demo--add").unwrap();

    let mut kwargs = BTreeMap::new();
    kwargs.insert("weight".to_string(), Value::Float(f64::NAN));
    let err = runner.call(&def, vec![Value::Int(1)], kwargs).await.unwrap_err();
    match err {
        MuninnError::Serialization { path, .. } => assert_eq!(path, "kwargs.weight"),
        other => panic!("unexpected error: {other}"),
    }
}
