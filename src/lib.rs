//! certsuite - device certification harness
//!
//! Drives one device through a certification run: readiness checks, a
//! backup of device state, each test suite as an external process with the
//! device restored in between, and a single archive of every log and report.

pub mod agent;
pub mod aggregate;
pub mod config;
pub mod failure;
pub mod logging;
pub mod poll;
pub mod precondition;
pub mod probe_server;
pub mod run;
pub mod session;
pub mod signal;
pub mod snapshot;
pub mod suite;
pub mod timeout;

pub use aggregate::{LogManager, RunSummary};
pub use config::{ConfigError, HarnessConfig, LoadedConfig, SuiteConfig};
pub use failure::{ExitCode, FailureKind};
pub use logging::LogContext;
pub use poll::{poll_until, poll_wait, PollError, PollOptions};
pub use precondition::{CheckName, CheckOutcome, PreconditionPipeline, PreconditionReport};
pub use run::{DeviceHandler, RunManager, RunOutcome, RunRequest, SessionDeviceHandler};
pub use session::DeviceSession;
pub use signal::{SignalHandler, SignalState};
pub use snapshot::{BackupPlan, DeviceSnapshot};
pub use suite::{build_command, SuiteExecutor, SuiteRunner};
