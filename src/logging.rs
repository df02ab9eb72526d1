//! Run-scoped logging context
//!
//! A `LogContext` owns a `tracing::Dispatch` with two layers:
//! - human-readable events on stderr, filtered by `--verbose` / `RUST_LOG`
//! - one JSON object per event in the run log file, at DEBUG and above
//!
//! Nothing is installed globally. The run executes inside
//! [`LogContext::in_scope`], and helper threads that must log adopt the
//! current dispatcher with [`current_dispatch`].
//!
//! Critical failures are logged at ERROR with `critical = true`.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{info, Dispatch};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use crate::config::LoadedConfig;

/// File name of the orchestrator log inside the archive
pub const RUN_LOG_NAME: &str = "run.log";

/// Logging setup errors
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Logging handle for one run
pub struct LogContext {
    dispatch: Dispatch,
    log_path: PathBuf,
}

impl LogContext {
    /// Create the context, truncating `log_path`
    pub fn new(log_path: &Path, verbose: bool) -> Result<Self, LoggingError> {
        let file = File::create(log_path).map_err(|source| LoggingError::Create {
            path: log_path.to_path_buf(),
            source,
        })?;

        let console_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

        let subscriber = tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_filter(console_filter),
            )
            .with(
                fmt::layer()
                    .json()
                    .with_writer(Mutex::new(file))
                    .with_current_span(false)
                    .with_span_list(false)
                    .with_filter(LevelFilter::DEBUG),
            );

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            log_path: log_path.to_path_buf(),
        })
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Path of the JSON run log
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Run `f` with this context as the current thread's dispatcher
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

/// The dispatcher active on this thread, for handing to helper threads
pub fn current_dispatch() -> Dispatch {
    tracing::dispatcher::get_default(Dispatch::clone)
}

/// Log the run's provenance: harness version and exact config used
pub fn log_run_metadata(config: &LoadedConfig) {
    info!(
        certsuite_version = env!("CARGO_PKG_VERSION"),
        config_path = %config.path.display(),
        config_sha256 = %config.digest,
        target_version = %config.config.version,
        suites = config.config.suites.len(),
        "Starting certification run"
    );
}

/// Render an error and its source chain on one line
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        rendered.push_str(": ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}
