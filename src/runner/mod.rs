//! The orchestrator-side runner.
//!
//! Composes the whole call path: memo key derivation, the fast result
//! probe, deferred uploads, the idempotent invocation write, lease
//! acquisition with background maintenance, shim dispatch, and result
//! retrieval. Many calls run concurrently in one process; each call is
//! a single logical task suspending at store I/O and lease waits.

mod results;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::instrument;
use tracing::warn;

use crate::config::MuninnConfig;
use crate::constants::INVOCATION;
use crate::constants::LEASE_WAIT_INTERVAL;
use crate::constants::MAX_CONCURRENT_STORE_OPS;
use crate::context::RunContext;
use crate::deferred::DeferredWork;
use crate::envelope;
use crate::envelope::InvocationEnvelope;
use crate::envelope::Thunk;
use crate::error::MuninnError;
use crate::lease::new_writer_id;
use crate::lease::AcquireOutcome;
use crate::lease::Lease;
use crate::lease::LeaseHandle;
use crate::lease::LeaseMaintainer;
use crate::lease::MaintenanceGuard;
use crate::memo::argument_hash;
use crate::memo::make_function_memospace;
use crate::memo::make_memo_uri;
use crate::memo::MemospaceHandler;
use crate::metadata::InvocationMetadata;
use crate::registry::FunctionDef;
use crate::registry::FunctionRegistry;
use crate::shim::InProcessShim;
use crate::shim::Shim;
use crate::shim::ShimCall;
use crate::shim::ShimError;
use crate::source::Source;
use crate::source::SharedRef;
use crate::store::join_uri;
use crate::store::with_retries;
use crate::store::BlobStore;
use crate::store::ControlCache;
use crate::summary::InvocationType;
use crate::summary::RunSummary;
use crate::summary::SummaryRecord;
use crate::value::Value;

use results::probe;
use results::FoundResult;

/// Configures and constructs a [`Runner`].
pub struct RunnerBuilder {
    store: Arc<dyn BlobStore>,
    registry: Arc<FunctionRegistry>,
    config: MuninnConfig,
    shim: Option<Shim>,
    memospace_handlers: Vec<MemospaceHandler>,
}

impl RunnerBuilder {
    /// Override the dispatch backend (default: in-process).
    pub fn shim(mut self, shim: Shim) -> Self {
        self.shim = Some(shim);
        self
    }

    /// Append a memospace override handler; handlers are consulted in
    /// registration order.
    pub fn memospace_handler(mut self, handler: MemospaceHandler) -> Self {
        self.memospace_handlers.push(handler);
        self
    }

    /// Construct the runner, opening its summary log.
    pub async fn build(self) -> Result<Runner, MuninnError> {
        let shim = self
            .shim
            .unwrap_or_else(|| Shim::Sync(Arc::new(InProcessShim::new(self.registry.clone()))));
        let context = RunContext::from_configured(self.config.run.pipeline_id.as_deref());
        let summary = RunSummary::create(self.config.storage.summary_dir.clone()).await;
        let control_cache = ControlCache::new(self.config.storage.control_cache_ttl_seconds);
        let deferred = DeferredWork::new(self.config.run.deferred_work_max);
        Ok(Runner {
            inner: Arc::new(RunnerInner {
                store: self.store,
                registry: self.registry,
                shim,
                context,
                memospace_handlers: Arc::new(self.memospace_handlers),
                control_cache,
                deferred,
                maintainer: LeaseMaintainer::global(),
                summary,
                before_ops: Arc::new(Semaphore::new(MAX_CONCURRENT_STORE_OPS)),
                after_ops: Arc::new(Semaphore::new(MAX_CONCURRENT_STORE_OPS)),
                config: self.config,
            }),
        })
    }
}

struct RunnerInner {
    store: Arc<dyn BlobStore>,
    registry: Arc<FunctionRegistry>,
    shim: Shim,
    config: MuninnConfig,
    context: RunContext,
    memospace_handlers: Arc<Vec<MemospaceHandler>>,
    control_cache: Arc<ControlCache>,
    deferred: Arc<DeferredWork>,
    maintainer: Arc<LeaseMaintainer>,
    summary: Arc<RunSummary>,
    // Grouping network ops per phase keeps meaningful units of progress
    // completing instead of interleaving thousands of half-done calls.
    before_ops: Arc<Semaphore>,
    after_ops: Arc<Semaphore>,
}

enum LeasePhase {
    Disabled,
    Acquired {
        handle: Arc<LeaseHandle>,
        guard: Option<MaintenanceGuard>,
    },
    ResultAppeared(FoundResult),
}

/// Memoizing runner: dispatches calls through a shim and returns
/// memoized results without dispatching when they already exist.
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl Runner {
    /// Start building a runner.
    pub fn builder(store: Arc<dyn BlobStore>, registry: Arc<FunctionRegistry>, config: MuninnConfig) -> RunnerBuilder {
        RunnerBuilder {
            store,
            registry,
            config,
            shim: None,
            memospace_handlers: Vec::new(),
        }
    }

    /// A runner identical to this one but keyed under another pipeline.
    pub fn with_pipeline_id(&self, pipeline_id: impl Into<String>) -> Runner {
        let inner = &self.inner;
        Runner {
            inner: Arc::new(RunnerInner {
                store: inner.store.clone(),
                registry: inner.registry.clone(),
                shim: inner.shim.clone(),
                config: inner.config.clone(),
                context: RunContext::new(pipeline_id),
                memospace_handlers: inner.memospace_handlers.clone(),
                control_cache: inner.control_cache.clone(),
                deferred: inner.deferred.clone(),
                maintainer: inner.maintainer.clone(),
                summary: inner.summary.clone(),
                before_ops: inner.before_ops.clone(),
                after_ops: inner.after_ops.clone(),
            }),
        }
    }

    /// Pipeline id calls run under.
    pub fn pipeline_id(&self) -> &str {
        &self.inner.context.pipeline_id
    }

    /// Register a value for once-per-pipeline shared upload.
    ///
    /// Returns the reference value to embed in arguments; the upload is
    /// deferred until a call actually dispatches.
    pub fn shared(&self, name: &str, value: &Value) -> Result<Value, MuninnError> {
        let bytes = value.canonical_bytes()?;
        let source = Source::from_bytes(Bytes::from(bytes), Some(name));
        Ok(Value::Shared(SharedRef {
            name: name.to_string(),
            hash: source.to_ref().hash,
        }))
    }

    /// The memo URI a call would be keyed under.
    pub fn memo_uri_for(
        &self,
        def: &FunctionDef,
        args: &[Value],
        kwargs: &BTreeMap<String, Value>,
    ) -> Result<String, MuninnError> {
        let inner = &self.inner;
        let memospace = make_function_memospace(
            &inner.config.storage.blob_root,
            &inner.config.storage.runner_prefix,
            &inner.context.pipeline_id,
            def.id(),
            def.logic_key().as_deref(),
            &inner.memospace_handlers,
        );
        let calls = inner.registry.calls_segments_for(def);
        let arg_hash = argument_hash(args, kwargs)?;
        Ok(make_memo_uri(&memospace, &calls, &arg_hash))
    }

    /// Submit a call as an independent task.
    pub fn submit(
        &self,
        def: Arc<FunctionDef>,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> JoinHandle<Result<Value, MuninnError>> {
        let runner = self.clone();
        tokio::spawn(async move { runner.call(&def, args, kwargs).await })
    }

    /// Run one call to completion: from cache if possible, through the
    /// shim otherwise.
    #[instrument(skip_all, fields(function = %def.func_ref()))]
    pub async fn call(
        &self,
        def: &Arc<FunctionDef>,
        mut args: Vec<Value>,
        mut kwargs: BTreeMap<String, Value>,
    ) -> Result<Value, MuninnError> {
        let inner = &self.inner;

        // Canonicalize once, up front: the hash and the stored thunk
        // must be computed from the same bytes or the write-once
        // invocation rule breaks for set-valued arguments.
        for (i, arg) in args.iter_mut().enumerate() {
            arg.canonicalize(&format!("args[{i}]"))?;
        }
        for (key, arg) in kwargs.iter_mut() {
            let path = format!("kwargs.{key}");
            arg.canonicalize(&path)?;
        }

        let memo_uri = self.memo_uri_for(def, &args, &kwargs)?;
        debug!(memo_uri = %memo_uri, "derived memo uri");

        // Fast result probe: a hit returns without serializing, without
        // uploading, without touching the lease.
        {
            let _permit = inner.before_ops.acquire().await.expect("semaphore closed");
            if let Some(found) = probe(
                inner.store.as_ref(),
                &inner.control_cache,
                &memo_uri,
                inner.config.run.rerun_exceptions,
            )
            .await?
            {
                info!(memo_uri = %memo_uri, "memoized result already exists; returning without invocation");
                self.record(def, &memo_uri, InvocationType::Memoized, &found);
                return found.into_value();
            }
        }
        if inner.config.run.require_all_results {
            return Err(MuninnError::RequiredResultMissing { memo_uri });
        }

        // Serialize the thunk and schedule uploads for everything it
        // references. The batch is fully drained before the invocation
        // is declared written.
        let thunk = Thunk {
            func_ref: def.func_ref(),
            args: args.clone(),
            kwargs: kwargs.clone(),
        };
        let invocation_bytes = envelope::encode(&InvocationEnvelope::new(thunk))?;
        let mut batch = inner.deferred.batch();
        let root = inner.config.storage.blob_root.clone();
        for value in args.iter().chain(kwargs.values()) {
            value.visit_sources(&mut |source_ref| {
                batch.upload_source(inner.store.clone(), root.clone(), source_ref.hash);
            });
            value.visit_shared(&mut |shared| {
                batch.upload_shared(
                    inner.store.clone(),
                    root.clone(),
                    inner.context.pipeline_id.clone(),
                    shared.clone(),
                );
            });
        }

        {
            let _permit = inner.before_ops.acquire().await.expect("semaphore closed");
            batch.drain().await?;
            self.write_invocation_if_absent(&memo_uri, &invocation_bytes).await?;
        }

        // Lease, dispatch, retrieve. A stolen lock sends us back to
        // waiting on whoever owns the outcome now.
        loop {
            let phase = self.acquire_lease_or_result(&memo_uri).await?;
            let (handle, guard) = match phase {
                LeasePhase::Disabled => (None, None),
                LeasePhase::Acquired { handle, guard } => (Some(handle), guard),
                LeasePhase::ResultAppeared(found) => {
                    info!(memo_uri = %memo_uri, "result appeared while waiting for the lease");
                    self.record(def, &memo_uri, InvocationType::Awaited, &found);
                    return found.into_value();
                }
            };

            let writer_id = handle
                .as_ref()
                .map(|h| h.writer_id().to_string())
                .unwrap_or_else(new_writer_id);
            let metadata = InvocationMetadata::new(&inner.context.pipeline_id, &writer_id);
            let shim_call = ShimCall::new(&memo_uri, &writer_id, &metadata);

            info!(memo_uri = %memo_uri, writer_id = %writer_id, "triggering new invocation");
            let shim_result = inner.shim.dispatch_and_wait(&shim_call).await;

            let stolen = matches!(shim_result, Err(ShimError::LockWasStolen))
                || handle.as_ref().is_some_and(|h| h.was_stolen());
            if stolen {
                if let Some(guard) = guard {
                    guard.stop();
                }
                warn!(memo_uri = %memo_uri, "lease was stolen; awaiting the new owner's outcome");
                continue;
            }

            let shim_error = match shim_result {
                Ok(()) => None,
                Err(err) => {
                    // Network and backend errors are common; if an
                    // outcome exists anyway, the error did not matter.
                    warn!(memo_uri = %memo_uri, error = %err, "shim reported an error; checking for a result regardless");
                    Some(err)
                }
            };

            let probed = {
                let _permit = inner.after_ops.acquire().await.expect("semaphore closed");
                probe(inner.store.as_ref(), &inner.control_cache, &memo_uri, false).await
            };

            match guard {
                Some(guard) => {
                    if let Err(e) = guard.stop_and_release().await {
                        warn!(memo_uri = %memo_uri, error = %e, "lease release failed; it will expire via TTL");
                    }
                }
                None => {
                    if let Some(handle) = &handle {
                        if let Err(e) = handle.release().await {
                            warn!(memo_uri = %memo_uri, error = %e, "lease release failed; it will expire via TTL");
                        }
                    }
                }
            }

            return match probed? {
                Some(found) => {
                    self.record(def, &memo_uri, InvocationType::Invoked, &found);
                    found.into_value()
                }
                None => Err(match shim_error {
                    Some(err) => err.into_muninn(&memo_uri),
                    None => MuninnError::ResultMissing { memo_uri },
                }),
            };
        }
    }

    async fn write_invocation_if_absent(&self, memo_uri: &str, invocation_bytes: &Bytes) -> Result<(), MuninnError> {
        let inner = &self.inner;
        let invocation_uri = join_uri(memo_uri, [INVOCATION]);
        let existing = with_retries("invocation-head", || inner.store.head(&invocation_uri))
            .await
            .map_err(|source| MuninnError::Storage {
                uri: invocation_uri.clone(),
                source,
            })?;
        if existing.is_some() {
            debug!(uri = %invocation_uri, "invocation already written");
            return Ok(());
        }
        with_retries("invocation-put", || {
            inner.store.put(&invocation_uri, invocation_bytes.clone(), "application/json")
        })
        .await
        .map_err(|source| MuninnError::Storage {
            uri: invocation_uri,
            source,
        })
    }

    async fn acquire_lease_or_result(&self, memo_uri: &str) -> Result<LeasePhase, MuninnError> {
        let inner = &self.inner;
        let lease_config = inner.config.lease.to_lease_config();
        if lease_config.disabled() {
            return Ok(LeasePhase::Disabled);
        }
        let wait = Duration::from_secs_f64(lease_config.ttl_seconds).min(LEASE_WAIT_INTERVAL);
        loop {
            let lease = Lease::new(inner.store.clone(), memo_uri, lease_config.clone());
            let extra = lease_extra(&inner.context.pipeline_id, lease.writer_id());
            let outcome = {
                let _permit = inner.before_ops.acquire().await.expect("semaphore closed");
                lease.try_acquire(&extra).await?
            };
            match outcome {
                AcquireOutcome::Acquired(handle) => {
                    let guard = inner
                        .config
                        .lease
                        .maintain_locks
                        .then(|| inner.maintainer.register(handle.clone()));
                    return Ok(LeasePhase::Acquired { handle, guard });
                }
                AcquireOutcome::HeldByOther { holder } => {
                    info!(memo_uri = %memo_uri, holder = %holder, "result not yet present and the lease is owned by another process");
                    tokio::time::sleep(wait).await;
                    let _permit = inner.before_ops.acquire().await.expect("semaphore closed");
                    if let Some(found) =
                        probe(inner.store.as_ref(), &inner.control_cache, memo_uri, false).await?
                    {
                        return Ok(LeasePhase::ResultAppeared(found));
                    }
                }
            }
        }
    }

    /// Queue a summary record; in-flight records complete on their own.
    fn record(&self, def: &FunctionDef, memo_uri: &str, status: InvocationType, found: &FoundResult) {
        let mut source_uris = Vec::new();
        if let Some(value) = &found.envelope.value {
            value.visit_sources(&mut |source_ref| {
                if let Some(uri) = &source_ref.uri {
                    source_uris.push(uri.clone());
                }
            });
        }
        let record = SummaryRecord {
            memo_uri: memo_uri.to_string(),
            function_name: def.func_ref(),
            status,
            timestamp: Utc::now(),
            was_error: found.is_error(),
            pipeline_id: self.inner.context.pipeline_id.clone(),
            remote_wall_seconds: Some(found.envelope.metadata.remote_wall_seconds),
            result_wall_seconds: Some(found.envelope.metadata.result_wall_seconds),
            source_uris,
        };
        let mut batch = self.inner.deferred.batch();
        batch.write_summary(self.inner.summary.clone(), record);
    }
}

fn lease_extra(pipeline_id: &str, writer_id: &str) -> BTreeMap<String, String> {
    let metadata = InvocationMetadata::new(pipeline_id, writer_id);
    metadata
        .to_args()
        .into_iter()
        .filter_map(|pair| pair.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}
