//! Remote-entry binary.
//!
//! Shims re-enter this program (or an application binary embedding
//! [`muninn::remote::remote_main`]) on the worker side. Functions are
//! discovered through link-time registration; an application links its
//! function crates and gets them collected here automatically.

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use muninn::registry::FunctionRegistry;
use muninn::remote::remote_main;

/// Run one pickled invocation and publish its outcome.
#[derive(Parser)]
#[command(name = "muninn-remote", version)]
struct Args {
    /// Memo URI of the invocation to run.
    memo_uri: String,
    /// Writer id of the lease this run was dispatched under.
    writer_id: String,
    /// `key=value` invocation metadata pairs.
    #[arg(trailing_var_arg = true)]
    metadata: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let registry = match FunctionRegistry::collect() {
        Ok(registry) => registry,
        Err(err) => {
            tracing::error!(error = %err, "cannot collect registered functions");
            return ExitCode::FAILURE;
        }
    };

    let mut entry_args = vec![args.memo_uri, args.writer_id];
    entry_args.extend(args.metadata);
    remote_main(&registry, &entry_args).await
}
