//! Shared fixtures for integration tests.
//!
//! All tests in one binary share the process-wide driver registry, so a
//! single memory store is registered once and each test isolates itself
//! under a fresh root prefix.

#![allow(dead_code)] // not every test binary uses every fixture

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;

use muninn::registry::FunctionDefBuilder;
use muninn::shim::ShimError;
use muninn::shim::SyncShim;
use muninn::store::register_driver;
use muninn::CallContext;
use muninn::Function;
use muninn::FunctionDef;
use muninn::FunctionError;
use muninn::FunctionRegistry;
use muninn::InProcessShim;
use muninn::MemoryBlobStore;
use muninn::MuninnConfig;
use muninn::Runner;
use muninn::Shim;
use muninn::ShimCall;
use muninn::Source;
use muninn::Value;

/// The single memory store behind `memory://` for this test process.
pub fn shared_store() -> Arc<MemoryBlobStore> {
    static STORE: OnceLock<Arc<MemoryBlobStore>> = OnceLock::new();
    STORE
        .get_or_init(|| {
            let store = Arc::new(MemoryBlobStore::new());
            register_driver("memory://", store.clone()).expect("memory driver registration");
            store
        })
        .clone()
}

/// A root URI no other test in this binary uses.
pub fn fresh_root(label: &str) -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    format!("memory://itest/{label}-{}", COUNTER.fetch_add(1, Ordering::SeqCst))
}

/// Config tuned for test clocks: short TTLs, tiny confirmation delay,
/// summaries off.
pub fn test_config(root: &str, pipeline_id: &str) -> MuninnConfig {
    let mut config = MuninnConfig::load(root).expect("config");
    config.run.pipeline_id = Some(pipeline_id.to_string());
    config.lease.ttl_seconds = 2.0;
    config.lease.heartbeat = Duration::from_millis(250);
    config.lease.confirm_margin = Duration::from_millis(20);
    config.storage.summary_dir = None;
    config
}

/// Adds its two integer arguments.
#[derive(Debug)]
pub struct Add;

#[async_trait]
impl Function for Add {
    async fn run(&self, ctx: CallContext) -> Result<Value, FunctionError> {
        match (ctx.arg(0)?, ctx.arg(1)?) {
            (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
            _ => Err(FunctionError::new("TypeError", "add expects two ints")),
        }
    }
}

/// Sleeps briefly, then returns `Int(1)`.
#[derive(Debug)]
pub struct SlowOne;

#[async_trait]
impl Function for SlowOne {
    async fn run(&self, _ctx: CallContext) -> Result<Value, FunctionError> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Value::Int(1))
    }
}

/// Always raises.
#[derive(Debug)]
pub struct AlwaysFails;

#[async_trait]
impl Function for AlwaysFails {
    async fn run(&self, _ctx: CallContext) -> Result<Value, FunctionError> {
        Err(FunctionError::new("ValueError", "deliberate failure").with_traceback("remote frame 0"))
    }
}

/// Returns a 1 MiB deterministic pseudo-random source, seeded by arg 0.
#[derive(Debug)]
pub struct MakeBlob;

#[async_trait]
impl Function for MakeBlob {
    async fn run(&self, ctx: CallContext) -> Result<Value, FunctionError> {
        let Value::Int(seed) = ctx.arg(0)? else {
            return Err(FunctionError::new("TypeError", "seed must be an int"));
        };
        let data = pseudo_random_bytes(*seed as u64, 1 << 20);
        let source = Source::from_bytes(data, Some("blob.bin"));
        Ok(Value::Source(source.to_ref()))
    }
}

/// Deterministic byte generator (xorshift), shared with assertions.
pub fn pseudo_random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).max(1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Build a registry holding every test function, with a configurable
/// doc (and therefore logic key) for `demo--add`.
pub fn test_registry(add_doc: &str) -> Arc<FunctionRegistry> {
    let registry = FunctionRegistry::new();
    registry.register(FunctionDef::builder("demo", "add").doc(add_doc).build(Add)).unwrap();
    registry.register(FunctionDef::builder("demo", "slow_one").build(SlowOne)).unwrap();
    registry.register(FunctionDef::builder("demo", "always_fails").build(AlwaysFails)).unwrap();
    registry.register(FunctionDef::builder("demo", "make_blob").build(MakeBlob)).unwrap();
    registry
}

/// Expose the builder type for tests that need custom defs.
pub type DefBuilder = FunctionDefBuilder;

/// A shim that counts dispatches before delegating in-process.
pub struct CountingShim {
    inner: InProcessShim,
    pub dispatches: Arc<AtomicUsize>,
}

impl CountingShim {
    pub fn new(registry: Arc<FunctionRegistry>) -> (Shim, Arc<AtomicUsize>) {
        let dispatches = Arc::new(AtomicUsize::new(0));
        let shim = Shim::Sync(Arc::new(Self {
            inner: InProcessShim::new(registry),
            dispatches: dispatches.clone(),
        }));
        (shim, dispatches)
    }
}

#[async_trait]
impl SyncShim for CountingShim {
    async fn dispatch(&self, call: &ShimCall) -> Result<(), ShimError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        self.inner.dispatch(call).await
    }
}

/// A shim that reports success without running anything.
pub struct SilentlyCrashingShim;

#[async_trait]
impl SyncShim for SilentlyCrashingShim {
    async fn dispatch(&self, _call: &ShimCall) -> Result<(), ShimError> {
        Ok(())
    }
}

/// Build a runner over the shared store with the given shim.
pub async fn build_runner(registry: Arc<FunctionRegistry>, config: MuninnConfig, shim: Option<Shim>) -> Runner {
    let mut builder = Runner::builder(shared_store(), registry, config);
    if let Some(shim) = shim {
        builder = builder.shim(shim);
    }
    builder.build().await.expect("runner")
}

/// Convenience: empty kwargs.
pub fn no_kwargs() -> BTreeMap<String, Value> {
    BTreeMap::new()
}
