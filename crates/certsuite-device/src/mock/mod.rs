//! Mock device
//!
//! In-process `DeviceControl` implementation for tests:
//! - in-memory filesystem keyed by absolute remote path
//! - editable process table
//! - scripted shell responders matched by command prefix
//! - a journal of every call, for asserting on ordering and counts
//! - per-operation failure injection
//!
//! Shell commands with no responder fail the way a missing binary does on
//! the device (`<cmd>: not found`).

mod failure;

pub use failure::{FailureConfig, FailureInjector, MockOp};

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use walkdir::WalkDir;

use crate::{DeviceControl, DeviceError, ProcessInfo};

/// A recorded call against the mock device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Shell(String),
    Push { local: String, remote: String },
    Pull { remote: String, local: String },
    Remove { remote: String, recursive: bool },
    ProcessList,
    Remount,
    Forward { local_port: u16, remote_port: u16 },
    Reboot,
    Logcat,
}

type ShellResponder = Box<dyn FnMut(&str) -> Result<String, DeviceError> + Send>;

#[derive(Default)]
struct MockState {
    files: BTreeMap<String, Vec<u8>>,
    processes: Vec<ProcessInfo>,
    log: Vec<String>,
    calls: Vec<MockCall>,
}

/// Configurable mock device for testing
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
    responders: Mutex<Vec<(String, ShellResponder)>>,
    failures: Mutex<FailureInjector>,
}

impl MockDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// A device that passes the harness's readiness checks: adbd runs as
    /// root, b2g is running and the network reports an address.
    pub fn healthy() -> Self {
        let device = Self::new();
        device.set_processes(vec![
            ProcessInfo::new(1, "/init", "root"),
            ProcessInfo::new(112, "/sbin/adbd", "root"),
            ProcessInfo::new(200, "/system/b2g/b2g", "root"),
        ]);
        device.respond("netcfg", |_| {
            Ok("lo       UP    127.0.0.1/8   0x00000049 00:00:00:00:00:00\n\
                wlan0    UP    192.168.1.23/24  0x00001043 aa:bb:cc:dd:ee:ff\n"
                .to_string())
        });
        device
    }

    /// Register a responder for shell commands starting with `prefix`.
    /// Later registrations take precedence.
    pub fn respond<F>(&self, prefix: impl Into<String>, responder: F)
    where
        F: FnMut(&str) -> Result<String, DeviceError> + Send + 'static,
    {
        if let Ok(mut responders) = self.responders.lock() {
            responders.insert(0, (prefix.into(), Box::new(responder)));
        }
    }

    /// Inject a failure for an operation
    pub fn fail(&self, op: MockOp, config: FailureConfig) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.inject(op, config);
        }
    }

    /// Remove injected failures for an operation
    pub fn clear_failure(&self, op: MockOp) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.clear_op(op);
        }
    }

    pub fn set_processes(&self, processes: Vec<ProcessInfo>) {
        if let Ok(mut state) = self.state.lock() {
            state.processes = processes;
        }
    }

    /// Drop every process whose executable basename is `name`
    pub fn kill_process(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.processes.retain(|p| p.basename() != name);
        }
    }

    /// Append lines to the device log buffer returned by `logcat`
    pub fn push_log(&self, line: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.log.push(line.into());
        }
    }

    pub fn write_file(&self, remote: &str, contents: impl Into<Vec<u8>>) {
        if let Ok(mut state) = self.state.lock() {
            state.files.insert(remote.to_string(), contents.into());
        }
    }

    pub fn file(&self, remote: &str) -> Option<Vec<u8>> {
        self.state.lock().ok()?.files.get(remote).cloned()
    }

    /// All remote file paths, sorted
    pub fn paths(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.files.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the whole filesystem, for before/after comparisons
    pub fn filesystem(&self) -> BTreeMap<String, Vec<u8>> {
        self.state.lock().map(|s| s.files.clone()).unwrap_or_default()
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().map(|s| s.calls.clone()).unwrap_or_default()
    }

    /// Number of recorded calls matching `pred`
    pub fn count_calls(&self, pred: impl Fn(&MockCall) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn reboot_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::Reboot))
    }

    pub fn remount_count(&self) -> usize {
        self.count_calls(|c| matches!(c, MockCall::Remount))
    }

    /// Shell commands run so far
    pub fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MockCall::Shell(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MockCall) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(call);
        }
    }

    fn check_failure(&self, op: MockOp, command: &str) -> Result<(), DeviceError> {
        let failure = self.failures.lock().ok().and_then(|mut f| f.check(op, command));
        match failure {
            Some(config) => {
                if let Some(delay) = config.delay {
                    std::thread::sleep(delay);
                }
                Err(config.to_error(command))
            }
            None => Ok(()),
        }
    }

    fn is_dir(files: &BTreeMap<String, Vec<u8>>, remote: &str) -> bool {
        let prefix = dir_prefix(remote);
        files.keys().any(|k| k.starts_with(&prefix))
    }
}

fn dir_prefix(remote: &str) -> String {
    format!("{}/", remote.trim_end_matches('/'))
}

impl DeviceControl for MockDevice {
    fn shell(&self, command: &str, _timeout: Option<Duration>) -> Result<String, DeviceError> {
        self.record(MockCall::Shell(command.to_string()));
        self.check_failure(MockOp::Shell, command)?;

        let mut responders = self
            .responders
            .lock()
            .map_err(|_| DeviceError::Unreachable("mock responders poisoned".to_string()))?;
        for (prefix, responder) in responders.iter_mut() {
            if command.starts_with(prefix.as_str()) {
                return responder(command);
            }
        }

        let program = command.split_whitespace().next().unwrap_or(command);
        Err(DeviceError::CommandFailed {
            command: command.to_string(),
            status: Some(127),
            output: format!("/system/bin/sh: {}: not found", program),
        })
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        self.record(MockCall::Push {
            local: local.display().to_string(),
            remote: remote.to_string(),
        });
        self.check_failure(MockOp::Push, remote)?;

        let mut pushed = BTreeMap::new();
        if local.is_dir() {
            for entry in WalkDir::new(local).sort_by_file_name() {
                let entry = entry.map_err(|e| DeviceError::Io(e.into()))?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(local)
                    .map_err(|_| DeviceError::NotFound(entry.path().display().to_string()))?;
                let target = format!("{}{}", dir_prefix(remote), rel.to_string_lossy());
                pushed.insert(target, fs::read(entry.path())?);
            }
        } else {
            pushed.insert(remote.to_string(), fs::read(local)?);
        }

        let mut state = self
            .state
            .lock()
            .map_err(|_| DeviceError::Unreachable("mock state poisoned".to_string()))?;
        state.files.extend(pushed);
        Ok(())
    }

    fn pull(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        self.record(MockCall::Pull {
            remote: remote.to_string(),
            local: local.display().to_string(),
        });
        self.check_failure(MockOp::Pull, remote)?;

        let files = self.filesystem();
        if let Some(contents) = files.get(remote) {
            if let Some(parent) = local.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(local, contents)?;
            return Ok(());
        }

        if !Self::is_dir(&files, remote) {
            return Err(DeviceError::NotFound(remote.to_string()));
        }
        let prefix = dir_prefix(remote);
        for (path, contents) in files.range(prefix.clone()..) {
            let Some(rel) = path.strip_prefix(&prefix) else {
                break;
            };
            let target = local.join(rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, contents)?;
        }
        Ok(())
    }

    fn remove(&self, remote: &str, recursive: bool) -> Result<(), DeviceError> {
        self.record(MockCall::Remove {
            remote: remote.to_string(),
            recursive,
        });
        self.check_failure(MockOp::Remove, remote)?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| DeviceError::Unreachable("mock state poisoned".to_string()))?;
        if state.files.remove(remote).is_some() {
            return Ok(());
        }
        if Self::is_dir(&state.files, remote) {
            if !recursive {
                return Err(DeviceError::CommandFailed {
                    command: format!("rm {}", remote),
                    status: Some(1),
                    output: format!("rm: {}: is a directory", remote),
                });
            }
            let prefix = dir_prefix(remote);
            state.files.retain(|k, _| !k.starts_with(&prefix));
        }
        Ok(())
    }

    fn process_list(&self) -> Result<Vec<ProcessInfo>, DeviceError> {
        self.record(MockCall::ProcessList);
        self.check_failure(MockOp::ProcessList, "ps")?;
        Ok(self.state.lock().map(|s| s.processes.clone()).unwrap_or_default())
    }

    fn remount(&self) -> Result<(), DeviceError> {
        self.record(MockCall::Remount);
        self.check_failure(MockOp::Remount, "remount")
    }

    fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), DeviceError> {
        self.record(MockCall::Forward {
            local_port,
            remote_port,
        });
        self.check_failure(MockOp::Forward, "forward")
    }

    fn reboot(&self) -> Result<(), DeviceError> {
        self.record(MockCall::Reboot);
        self.check_failure(MockOp::Reboot, "reboot")
    }

    fn logcat(&self) -> Result<Vec<String>, DeviceError> {
        self.record(MockCall::Logcat);
        self.check_failure(MockOp::Logcat, "logcat -d")?;
        Ok(self.state.lock().map(|s| s.log.clone()).unwrap_or_default())
    }
}
