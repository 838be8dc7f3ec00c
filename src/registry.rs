//! Registered functions.
//!
//! There is no portable code serialization: an invocation names its
//! function by `module--name` and every runtime that might execute it
//! registers the same names at startup. The registry freezes on first
//! lookup so orchestrator and remote resolve identically for the
//! process lifetime.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::OnceLock;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::info;

use crate::error::MuninnError;
use crate::memo;
use crate::memo::calls_segments;
use crate::memo::extract_logic_key;
use crate::memo::FunctionId;
use crate::source::fetch_source;
use crate::source::SourceRef;
use crate::store::BlobStore;
use crate::value::Value;

/// A user-function failure, serialized into an exception envelope and
/// re-raised on the orchestrator with its remote context attached.
#[derive(Debug, Clone)]
pub struct FunctionError {
    /// Error type name.
    pub type_name: String,
    /// Error message.
    pub message: String,
    /// Remote traceback or context, as text.
    pub traceback: String,
}

impl FunctionError {
    /// Create an error with an explicit type name.
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            traceback: String::new(),
        }
    }

    /// Attach traceback text.
    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = traceback.into();
        self
    }
}

impl std::fmt::Display for FunctionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

impl From<MuninnError> for FunctionError {
    fn from(err: MuninnError) -> Self {
        Self::new("MuninnError", err.to_string())
    }
}

/// Everything a function sees when it runs: its arguments plus access
/// to the blob store it was invoked under.
pub struct CallContext {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Named arguments.
    pub kwargs: BTreeMap<String, Value>,
    store: Arc<dyn BlobStore>,
    storage_root: String,
}

impl CallContext {
    /// Build a context. Used by the remote entry and by in-process shims.
    pub fn new(
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
        store: Arc<dyn BlobStore>,
        storage_root: String,
    ) -> Self {
        Self {
            args,
            kwargs,
            store,
            storage_root,
        }
    }

    /// Positional argument by index.
    pub fn arg(&self, index: usize) -> Result<&Value, FunctionError> {
        self.args
            .get(index)
            .ok_or_else(|| FunctionError::new("ArgumentError", format!("missing positional argument {index}")))
    }

    /// Named argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Storage root the invocation lives under.
    pub fn storage_root(&self) -> &str {
        &self.storage_root
    }

    /// Fetch and verify the bytes behind a source reference.
    pub async fn fetch_source(&self, source_ref: &SourceRef) -> Result<Bytes, FunctionError> {
        fetch_source(self.store.as_ref(), &self.storage_root, source_ref)
            .await
            .map_err(FunctionError::from)
    }
}

/// A function that can be run by the remote entry.
#[async_trait]
pub trait Function: Send + Sync + std::fmt::Debug + 'static {
    /// Execute the function against its call context.
    async fn run(&self, ctx: CallContext) -> Result<Value, FunctionError>;
}

/// A registered function: identity, documentation, declared callees.
#[derive(Debug)]
pub struct FunctionDef {
    id: FunctionId,
    doc: String,
    calls: Vec<FunctionId>,
    function: Arc<dyn Function>,
}

impl FunctionDef {
    /// Start building a definition for `module--name`.
    pub fn builder(module: impl Into<String>, name: impl Into<String>) -> FunctionDefBuilder {
        FunctionDefBuilder {
            id: FunctionId::new(module, name),
            doc: String::new(),
            calls: Vec::new(),
        }
    }

    /// Identity of this function.
    pub fn id(&self) -> &FunctionId {
        &self.id
    }

    /// The `module--name` rendering used as `func_ref`.
    pub fn func_ref(&self) -> String {
        self.id.to_string()
    }

    /// Documentation text.
    pub fn doc(&self) -> &str {
        &self.doc
    }

    /// Logic key declared in the documentation, if any.
    pub fn logic_key(&self) -> Option<String> {
        extract_logic_key(&self.doc)
    }

    /// The executable behind this definition.
    pub fn function(&self) -> &Arc<dyn Function> {
        &self.function
    }
}

/// Builder for [`FunctionDef`].
pub struct FunctionDefBuilder {
    id: FunctionId,
    doc: String,
    calls: Vec<FunctionId>,
}

impl FunctionDefBuilder {
    /// Set the documentation text (scanned for `function-logic-key:`).
    pub fn doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = doc.into();
        self
    }

    /// Declare that this function calls another memoized function.
    pub fn calls(mut self, callee: &FunctionId) -> Self {
        self.calls.push(callee.clone());
        self
    }

    /// Finish with the executable implementation.
    pub fn build(self, function: impl Function) -> Arc<FunctionDef> {
        Arc::new(FunctionDef {
            id: self.id,
            doc: self.doc,
            calls: self.calls,
            function: Arc::new(function),
        })
    }
}

/// Factory for link-time function registration.
///
/// Crates that define memoized functions implement this and call
/// [`submit_function!`](crate::submit_function) so that any binary
/// linking them (in particular a remote-entry binary) can collect every
/// function without central wiring.
pub trait FunctionFactory: Send + Sync + 'static {
    /// Create the function definition to register.
    fn create(&self) -> Arc<FunctionDef>;
}

inventory::collect!(&'static dyn FunctionFactory);

/// Register a function factory at link time.
///
/// ```ignore
/// pub struct AddFactory;
/// impl FunctionFactory for AddFactory {
///     fn create(&self) -> Arc<FunctionDef> {
///         FunctionDef::builder("demo", "add").build(Add)
///     }
/// }
/// muninn::submit_function!(AddFactory);
/// ```
#[macro_export]
macro_rules! submit_function {
    ($factory:expr) => {
        $crate::registry::inventory::submit! {
            &$factory as &'static dyn $crate::registry::FunctionFactory
        }
    };
}

// Re-exported for the macro's expansion.
#[doc(hidden)]
pub use inventory;

/// Name-to-definition registry, frozen on first lookup.
#[derive(Default)]
pub struct FunctionRegistry {
    pending: Mutex<BTreeMap<String, Arc<FunctionDef>>>,
    frozen: OnceLock<BTreeMap<String, Arc<FunctionDef>>>,
}

impl FunctionRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Build a registry from every link-time submitted factory.
    pub fn collect() -> Result<Arc<Self>, MuninnError> {
        let registry = Self::new();
        for factory in inventory::iter::<&'static dyn FunctionFactory> {
            registry.register(factory.create())?;
        }
        Ok(registry)
    }

    /// Register a function definition.
    ///
    /// Fails after the registry has served a lookup, and on duplicate
    /// names: both indicate a wiring bug worth failing loudly on.
    pub fn register(&self, def: Arc<FunctionDef>) -> Result<(), MuninnError> {
        if self.frozen.get().is_some() {
            return Err(MuninnError::Config {
                key: def.func_ref(),
                reason: "function registry is frozen; register functions before first use".to_string(),
            });
        }
        let mut pending = self.pending.lock().unwrap();
        let func_ref = def.func_ref();
        if pending.contains_key(&func_ref) {
            return Err(MuninnError::Config {
                key: func_ref,
                reason: "function already registered".to_string(),
            });
        }
        info!(function = %func_ref, "registered function");
        pending.insert(func_ref, def);
        Ok(())
    }

    fn table(&self) -> &BTreeMap<String, Arc<FunctionDef>> {
        self.frozen.get_or_init(|| self.pending.lock().unwrap().clone())
    }

    /// Resolve a function reference.
    pub fn get(&self, func_ref: &str) -> Result<Arc<FunctionDef>, MuninnError> {
        self.table()
            .get(func_ref)
            .cloned()
            .ok_or_else(|| MuninnError::UnknownFunction {
                func_ref: func_ref.to_string(),
            })
    }

    /// All functions recursively reachable from a definition through
    /// declared `calls` edges, excluding the definition itself.
    pub fn reachable_callees(&self, def: &FunctionDef) -> Vec<memo::Callee> {
        let table = self.table();
        let mut visited: HashSet<FunctionId> = HashSet::new();
        let mut stack: Vec<FunctionId> = def.calls.clone();
        let mut callees = Vec::new();
        while let Some(id) = stack.pop() {
            if id == *def.id() || !visited.insert(id.clone()) {
                continue;
            }
            let logic_key = table.get(&id.to_string()).and_then(|callee| {
                stack.extend(callee.calls.iter().cloned());
                callee.logic_key()
            });
            callees.push(memo::Callee { id, logic_key });
        }
        callees
    }

    /// The sorted `calls-` memo URI segments for a definition.
    pub fn calls_segments_for(&self, def: &FunctionDef) -> Vec<String> {
        calls_segments(&self.reachable_callees(def))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;

    #[derive(Debug)]
    struct Doubler;

    #[async_trait]
    impl Function for Doubler {
        async fn run(&self, ctx: CallContext) -> Result<Value, FunctionError> {
            match ctx.arg(0)? {
                Value::Int(n) => Ok(Value::Int(n * 2)),
                other => Err(FunctionError::new("TypeError", format!("expected int, got {other:?}"))),
            }
        }
    }

    #[derive(Debug)]
    struct Noop;

    #[async_trait]
    impl Function for Noop {
        async fn run(&self, _ctx: CallContext) -> Result<Value, FunctionError> {
            Ok(Value::Null)
        }
    }

    fn ctx(args: Vec<Value>) -> CallContext {
        CallContext::new(args, BTreeMap::new(), Arc::new(MemoryBlobStore::new()), "memory://t".to_string())
    }

    #[tokio::test]
    async fn test_register_and_run() {
        let registry = FunctionRegistry::new();
        registry.register(FunctionDef::builder("demo", "double").build(Doubler)).unwrap();
        let def = registry.get("demo--double").unwrap();
        let value = def.function().run(ctx(vec![Value::Int(21)])).await.unwrap();
        assert_eq!(value, Value::Int(42));
    }

    #[test]
    fn test_unknown_function() {
        let registry = FunctionRegistry::new();
        let err = registry.get("demo--missing").unwrap_err();
        assert!(matches!(err, MuninnError::UnknownFunction { .. }));
    }

    #[test]
    fn test_registration_after_freeze_fails() {
        let registry = FunctionRegistry::new();
        registry.register(FunctionDef::builder("demo", "noop").build(Noop)).unwrap();
        let _ = registry.get("demo--noop").unwrap();
        let err = registry.register(FunctionDef::builder("demo", "late").build(Noop)).unwrap_err();
        assert!(matches!(err, MuninnError::Config { .. }));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = FunctionRegistry::new();
        registry.register(FunctionDef::builder("demo", "noop").build(Noop)).unwrap();
        let err = registry.register(FunctionDef::builder("demo", "noop").build(Noop)).unwrap_err();
        assert!(matches!(err, MuninnError::Config { .. }));
    }

    #[test]
    fn test_reachable_callees_are_recursive() {
        let registry = FunctionRegistry::new();
        let leaf = FunctionDef::builder("demo", "leaf").doc("function-logic-key: v3").build(Noop);
        let mid = FunctionDef::builder("demo", "mid")
            .doc("function-logic-key: v1")
            .calls(leaf.id())
            .build(Noop);
        let top = FunctionDef::builder("demo", "top").calls(mid.id()).build(Noop);
        registry.register(leaf).unwrap();
        registry.register(mid).unwrap();
        registry.register(top.clone()).unwrap();

        let segments = registry.calls_segments_for(&top);
        assert_eq!(segments, vec!["calls-demo--leaf@v3", "calls-demo--mid@v1"]);
    }

    #[test]
    fn test_logic_key_from_doc() {
        let def = FunctionDef::builder("demo", "keyed").doc("does things\nfunction-logic-key: r2\n").build(Noop);
        assert_eq!(def.logic_key().as_deref(), Some("r2"));
    }
}
