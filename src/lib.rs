//! Muninn: a memoizing remote-invocation runner.
//!
//! Calls to registered pure functions are turned into content-addressed
//! invocations in a blob store, guarded by expiring leases, dispatched
//! through a pluggable shim to a remote runtime, and their results
//! memoized. A second call with the same arguments, anywhere that can
//! see the same store, returns the stored result without running
//! anything.
//!
//! # Example
//!
//! ```ignore
//! use muninn::{Function, FunctionDef, FunctionRegistry, MuninnConfig, Runner, Value};
//!
//! struct Add;
//!
//! #[async_trait::async_trait]
//! impl Function for Add {
//!     async fn run(&self, ctx: muninn::CallContext) -> Result<Value, muninn::FunctionError> {
//!         match (ctx.arg(0)?, ctx.arg(1)?) {
//!             (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a + b)),
//!             _ => Err(muninn::FunctionError::new("TypeError", "expected ints")),
//!         }
//!     }
//! }
//!
//! let registry = FunctionRegistry::new();
//! registry.register(FunctionDef::builder("demo", "add").build(Add))?;
//!
//! let config = MuninnConfig::load("file:///data/muninn")?;
//! let runner = Runner::builder(store, registry, config).build().await?;
//! let sum = runner.call(&def, vec![Value::Int(2), Value::Int(3)], Default::default()).await?;
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod constants;
pub mod context;
pub mod deferred;
pub mod envelope;
pub mod error;
pub mod humenc;
pub mod lease;
pub mod memo;
pub mod metadata;
pub mod registry;
pub mod remote;
pub mod run_id;
pub mod runner;
pub mod shim;
pub mod source;
pub mod store;
pub mod summary;
pub mod value;

pub use config::MuninnConfig;
pub use envelope::OutcomeKind;
pub use envelope::ResultEnvelope;
pub use envelope::Thunk;
pub use error::MuninnError;
pub use error::Result;
pub use registry::CallContext;
pub use registry::Function;
pub use registry::FunctionDef;
pub use registry::FunctionError;
pub use registry::FunctionRegistry;
pub use remote::run_remote_entry;
pub use runner::Runner;
pub use runner::RunnerBuilder;
pub use shim::InProcessShim;
pub use shim::Shim;
pub use shim::ShimCall;
pub use shim::SubprocessShim;
pub use source::Source;
pub use source::SourceRef;
pub use store::BlobStore;
pub use store::FileBlobStore;
pub use store::MemoryBlobStore;
pub use value::Value;
