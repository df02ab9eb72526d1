//! Run orchestration
//!
//! [`RunManager::run`] drives one certification run:
//! 1. check the device answers, then run the preconditions once
//! 2. back up device state
//! 3. for each requested suite: run it in a fresh temp dir, archive its
//!    output, fold its results, then restore the device
//! 4. release the backup and seal the archive
//!
//! A failing or crashing suite marks the run failed but never stops later
//! suites. An interrupt stops the loop after the device is restored. The
//! backup and archive are released on every path.

pub mod request;

pub use request::{RequestError, RunRequest, SuiteSelection};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use certsuite_device::{DeviceControl, MockDevice};
use tracing::{error, info, warn};

use crate::agent::AutomationAgent;
use crate::aggregate::{AggregateError, LogManager, RunSummary};
use crate::config::HarnessConfig;
use crate::failure::{ExitCode, FailureKind};
use crate::logging::error_chain;
use crate::precondition::{PreconditionError, PreconditionPipeline, PreconditionReport};
use crate::session::{DeviceSession, PushFile, SessionError};
use crate::signal::SignalState;
use crate::snapshot::{BackupPlan, DeviceSnapshot, SnapshotError};
use crate::suite::{SuiteError, SuiteExecutor, SuiteResult};

/// Run errors that prevent producing a result at all
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Aggregate(#[from] AggregateError),
}

impl RunError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RunError::Aggregate(e) => e.kind(),
        }
    }
}

/// Device capabilities the run needs
pub trait DeviceHandler {
    /// Confirm the device is connected and answering
    fn check_environment(&mut self) -> Result<(), SessionError>;

    /// Run the precondition pipeline
    fn check_ready(&mut self) -> Result<PreconditionReport, PreconditionError>;

    /// Reboot and wait for the device to come back
    fn reboot(&mut self) -> Result<(), SessionError>;

    /// Push a file that is removed again when the guard drops
    fn push_file(&self, local: &Path, remote: &str) -> Result<PushFile<'_>, SessionError>;

    fn pull_file(&self, remote: &str, local: &Path) -> Result<(), SessionError>;

    /// Back up the configured device state
    fn backup(&mut self) -> Result<DeviceSnapshot, SnapshotError>;

    /// Put backed-up state back on the device
    fn restore(&mut self, snapshot: &DeviceSnapshot) -> Result<(), SnapshotError> {
        snapshot.restore()
    }
}

/// [`DeviceHandler`] over a live device session
pub struct SessionDeviceHandler<'a> {
    session: DeviceSession,
    agent: Box<dyn AutomationAgent + 'a>,
    config: &'a HarnessConfig,
    signals: Arc<SignalState>,
}

impl<'a> SessionDeviceHandler<'a> {
    pub fn new(
        device: Arc<dyn DeviceControl>,
        agent: Box<dyn AutomationAgent + 'a>,
        config: &'a HarnessConfig,
        signals: Arc<SignalState>,
    ) -> Self {
        Self {
            session: DeviceSession::from_config(device, config).with_signals(signals.clone()),
            agent,
            config,
            signals,
        }
    }

    pub fn session(&self) -> &DeviceSession {
        &self.session
    }
}

impl DeviceHandler for SessionDeviceHandler<'_> {
    fn check_environment(&mut self) -> Result<(), SessionError> {
        let processes = self.session.device().process_list()?;
        info!(processes = processes.len(), "Device is connected");
        Ok(())
    }

    fn check_ready(&mut self) -> Result<PreconditionReport, PreconditionError> {
        PreconditionPipeline::new(&self.session, self.agent.as_mut(), self.config)
            .with_signals(&self.signals)
            .run()
    }

    fn reboot(&mut self) -> Result<(), SessionError> {
        self.session.reboot()
    }

    fn push_file(&self, local: &Path, remote: &str) -> Result<PushFile<'_>, SessionError> {
        self.session.push_file(local, remote)
    }

    fn pull_file(&self, remote: &str, local: &Path) -> Result<(), SessionError> {
        Ok(self.session.device().pull(remote, local)?)
    }

    fn backup(&mut self) -> Result<DeviceSnapshot, SnapshotError> {
        DeviceSnapshot::acquire(self.session.device().clone(), BackupPlan::from_config(&self.config.device))
    }
}

/// In-memory stand-in for a device, for exercising a config and its suites
/// without hardware. Every backup path exists so the snapshot can be taken.
pub fn dry_device(config: &HarnessConfig) -> MockDevice {
    let device = MockDevice::healthy();
    for dir in &config.device.backup_dirs {
        device.write_file(&format!("{}/.certsuite-dry", dir.trim_end_matches('/')), Vec::new());
    }
    for file in &config.device.backup_files {
        device.write_file(file, Vec::new());
    }
    device
}

/// How one suite ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SuiteStatus {
    /// Ran and its structured log shows every result as expected
    Passed,
    /// Ran but the results show failures or are missing
    Failed,
    /// Could not be run or crashed
    Error(String),
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteOutcome {
    pub suite_id: String,
    pub groups: Vec<String>,
    pub status: SuiteStatus,
}

impl SuiteOutcome {
    pub fn passed(&self) -> bool {
        self.status == SuiteStatus::Passed
    }
}

/// Result of a whole run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub exit_code: ExitCode,
    pub suites: Vec<SuiteOutcome>,
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn archive_path(&self) -> &Path {
        &self.summary.archive_path
    }
}

/// Coordinates preconditions, suites and cleanup
pub struct RunManager {
    signals: Arc<SignalState>,
}

impl RunManager {
    pub fn new(signals: Arc<SignalState>) -> Self {
        Self { signals }
    }

    /// Run `request` and seal `aggregator`, whatever happens along the way
    pub fn run(
        &self,
        handler: &mut dyn DeviceHandler,
        executor: &mut dyn SuiteExecutor,
        request: &RunRequest,
        mut aggregator: LogManager,
    ) -> Result<RunOutcome, RunError> {
        let (exit_code, suites) = self.run_suites(handler, executor, request, &mut aggregator);

        let exit_code = match exit_code {
            ExitCode::Success if !aggregator.run_passed() => ExitCode::Failed,
            other => other,
        };
        info!(
            exit_code = exit_code.code(),
            archive = %aggregator.archive_path().display(),
            "Run complete"
        );
        let summary = aggregator.finalize()?;
        Ok(RunOutcome {
            exit_code,
            suites,
            summary,
        })
    }

    fn run_suites(
        &self,
        handler: &mut dyn DeviceHandler,
        executor: &mut dyn SuiteExecutor,
        request: &RunRequest,
        aggregator: &mut LogManager,
    ) -> (ExitCode, Vec<SuiteOutcome>) {
        if let Err(e) = handler.check_environment() {
            error!(critical = true, kind = %e.kind(), "Device environment check failed: {}", error_chain(&e));
            return (ExitCode::Failed, Vec::new());
        }

        match handler.check_ready() {
            Ok(report) if report.passed() => {}
            Ok(report) => {
                let check = report.failed_check().map(|c| c.name.as_str()).unwrap_or("unknown");
                error!(
                    critical = true,
                    check,
                    rebooted = report.rebooted,
                    "Preconditions not met; fix the device and re-run"
                );
                return (ExitCode::Failed, Vec::new());
            }
            Err(e) if e.kind().propagates() => {
                warn!("Interrupted during precondition checks");
                return (ExitCode::Interrupted, Vec::new());
            }
            Err(e) => {
                error!(critical = true, kind = %e.kind(), "Precondition checks failed: {}", error_chain(&e));
                return (ExitCode::Failed, Vec::new());
            }
        }

        let snapshot = match handler.backup() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!(critical = true, kind = %e.kind(), "Failed to back up device state: {}", error_chain(&e));
                return (ExitCode::Failed, Vec::new());
            }
        };

        let mut outcomes = Vec::with_capacity(request.len());
        let mut restore_failed = false;
        for selection in request.selections() {
            if self.signals.is_cancel_requested() {
                break;
            }

            let status = self.run_one(executor, &selection, aggregator);
            outcomes.push(SuiteOutcome {
                suite_id: selection.suite_id,
                groups: selection.groups,
                status,
            });

            if let Err(e) = handler.restore(&snapshot) {
                error!(critical = true, kind = %e.kind(), "Failed to restore device state: {}", error_chain(&e));
                restore_failed = true;
                break;
            }
        }

        if let Err(e) = snapshot.release() {
            warn!("Failed to remove device backup: {}", error_chain(&e));
        }

        let exit_code = if self.signals.is_cancel_requested() {
            ExitCode::Interrupted
        } else if restore_failed || outcomes.len() < request.len() || !outcomes.iter().all(SuiteOutcome::passed) {
            ExitCode::Failed
        } else {
            ExitCode::Success
        };
        (exit_code, outcomes)
    }

    fn run_one(&self, executor: &mut dyn SuiteExecutor, selection: &SuiteSelection, aggregator: &mut LogManager) -> SuiteStatus {
        let suite_id = selection.suite_id.as_str();
        let temp_dir = match tempfile::Builder::new()
            .prefix(&format!("certsuite-{}-", suite_id))
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                error!(critical = true, suite = suite_id, "Failed to create temp dir: {}", e);
                return SuiteStatus::Error(e.to_string());
            }
        };

        let result = match executor.run(suite_id, &selection.groups, temp_dir.path()) {
            Ok(result) => result,
            Err(SuiteError::Interrupted(_)) => return SuiteStatus::Interrupted,
            Err(e) => {
                error!(
                    critical = true,
                    suite = suite_id,
                    kind = %e.kind(),
                    "Error running suite {}: {}",
                    suite_id,
                    error_chain(&e)
                );
                return SuiteStatus::Error(e.to_string());
            }
        };

        archive_outputs(aggregator, &result);
        match aggregator.add_suite_report(suite_id, &result.raw_log) {
            Ok(results) if results.is_pass() => SuiteStatus::Passed,
            Ok(_) => SuiteStatus::Failed,
            Err(e) => {
                error!(critical = true, suite = suite_id, "Failed to record suite results: {}", error_chain(&e));
                SuiteStatus::Error(e.to_string())
            }
        }
    }
}

/// Add a suite's declared output files under `<suite>/`. Missing files are
/// left for the report stage to judge.
fn archive_outputs(aggregator: &mut LogManager, result: &SuiteResult) {
    for path in &result.output_files {
        let Some(file_name) = path.file_name() else {
            continue;
        };
        if !path.is_file() {
            warn!(suite = %result.suite_id, path = %path.display(), "Declared output file not found");
            continue;
        }
        let name = format!("{}/{}", result.suite_id, file_name.to_string_lossy());
        if let Err(e) = aggregator.add_file(path, &name) {
            warn!(suite = %result.suite_id, "{}", error_chain(&e));
        }
    }
}

/// Archive directory to use when none is given
pub fn default_output_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::MockAgent;
    use certsuite_device::MockDevice;

    fn config() -> HarnessConfig {
        HarnessConfig::parse_toml(
            "version = \"2.0\"\n[timeouts]\npoll_interval_ms = 10\nnetwork_seconds = 1\ndevice_ready_seconds = 1\n\
             [host_check]\nports = [0]\nhost_ip = \"127.0.0.1\"\n\
             [device]\nbackup_dirs = [\"/data/local\"]\nbackup_files = [\"/system/etc/hosts\"]\n",
        )
        .unwrap()
    }

    fn handler<'a>(device: &Arc<MockDevice>, config: &'a HarnessConfig) -> SessionDeviceHandler<'a> {
        device.write_file("/data/local/webapps.json", b"{}".to_vec());
        device.write_file("/system/etc/hosts", b"127.0.0.1 localhost".to_vec());
        SessionDeviceHandler::new(
            device.clone(),
            Box::new(MockAgent::installed()),
            config,
            Arc::new(SignalState::new()),
        )
    }

    #[test]
    fn test_session_handler_checks_and_backs_up() {
        let device = Arc::new(MockDevice::healthy());
        let config = config();
        let mut handler = handler(&device, &config);

        handler.check_environment().unwrap();
        assert!(handler.check_ready().unwrap().passed());

        let snapshot = handler.backup().unwrap();
        device.write_file("/system/etc/hosts", b"changed".to_vec());
        handler.restore(&snapshot).unwrap();
        assert_eq!(device.file("/system/etc/hosts").unwrap(), b"127.0.0.1 localhost".to_vec());
        snapshot.release().unwrap();
    }

    #[test]
    fn test_dry_device_passes_checks_and_backs_up() {
        let config = config();
        let device = Arc::new(dry_device(&config));
        let mut handler = SessionDeviceHandler::new(
            device.clone(),
            Box::new(MockAgent::installed()),
            &config,
            Arc::new(SignalState::new()),
        );

        handler.check_environment().unwrap();
        assert!(handler.check_ready().unwrap().passed());
        let snapshot = handler.backup().unwrap();
        handler.restore(&snapshot).unwrap();
        snapshot.release().unwrap();
        assert_eq!(device.file("/system/etc/hosts").unwrap(), Vec::<u8>::new());
        assert_eq!(device.reboot_count(), 0);
    }

    #[test]
    fn test_session_handler_push_and_pull() {
        let device = Arc::new(MockDevice::healthy());
        let config = config();
        let handler = handler(&device, &config);
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("marker");
        std::fs::write(&local, "x").unwrap();

        {
            let _pushed = handler.push_file(&local, "/data/local/tmp/marker").unwrap();
            assert!(device.file("/data/local/tmp/marker").is_some());
        }
        assert!(device.file("/data/local/tmp/marker").is_none());

        let pulled = dir.path().join("hosts");
        handler.pull_file("/system/etc/hosts", &pulled).unwrap();
        assert_eq!(std::fs::read_to_string(pulled).unwrap(), "127.0.0.1 localhost");
    }

    #[test]
    fn test_session_handler_check_environment_fails_when_unreachable() {
        use certsuite_device::{FailureConfig, MockOp};
        let device = Arc::new(MockDevice::healthy());
        device.fail(MockOp::ProcessList, FailureConfig::error("device offline"));
        let config = config();
        let mut handler = handler(&device, &config);
        assert!(handler.check_environment().is_err());
    }
}
