//! Device-control transport for the certsuite harness
//!
//! This crate is the low-level channel to a single test device:
//! - `DeviceControl`: the capability contract the harness drives
//! - `AdbDevice`: production transport over the `adb` executable
//! - `MockDevice`: in-process device with an in-memory filesystem, used by tests
//!
//! Readiness detection, snapshots and everything stateful live in the
//! `certsuite` crate; this crate only moves bytes and runs commands.

pub mod adb;
pub mod mock;

use std::io;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use adb::{AdbConfig, AdbDevice};
pub use mock::{FailureConfig, MockCall, MockDevice, MockOp};

/// One entry of the device process table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessInfo {
    /// Process id
    pub pid: u32,
    /// Executable path as reported by `ps` (e.g. `/sbin/adbd`)
    pub name: String,
    /// Owning user
    pub user: String,
}

impl ProcessInfo {
    pub fn new(pid: u32, name: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            user: user.into(),
        }
    }

    /// Last path component of the executable name
    pub fn basename(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }
}

/// Transport errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("command `{command}` failed (status {status:?}): {output}")]
    CommandFailed {
        command: String,
        status: Option<i32>,
        output: String,
    },

    #[error("command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("remote path not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl DeviceError {
    /// Captured command output, if the failure carried any
    pub fn output(&self) -> Option<&str> {
        match self {
            DeviceError::CommandFailed { output, .. } => Some(output),
            _ => None,
        }
    }

    /// True when the failure came from the command timing out
    pub fn is_timeout(&self) -> bool {
        matches!(self, DeviceError::Timeout { .. })
    }
}

/// Device-control capability
///
/// All operations block the calling thread. Implementations must be safe to
/// share, but the harness never issues two commands concurrently.
pub trait DeviceControl: Send + Sync {
    /// Run a shell command on the device and return its stdout.
    ///
    /// A non-zero exit status is reported as `DeviceError::CommandFailed`
    /// with the combined output.
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<String, DeviceError>;

    /// Copy a local file or directory tree onto the device
    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError>;

    /// Copy a remote file or directory tree to a local path
    fn pull(&self, remote: &str, local: &Path) -> Result<(), DeviceError>;

    /// Remove a remote path; `recursive` is required for directories.
    /// Removing a path that does not exist is not an error.
    fn remove(&self, remote: &str, recursive: bool) -> Result<(), DeviceError>;

    /// List running processes
    fn process_list(&self) -> Result<Vec<ProcessInfo>, DeviceError>;

    /// Remount the system partition read-write
    fn remount(&self) -> Result<(), DeviceError>;

    /// Forward a local TCP port to a device TCP port
    fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), DeviceError>;

    /// Issue a reboot. Returns once the command was accepted, not once the
    /// device is back.
    fn reboot(&self) -> Result<(), DeviceError>;

    /// Dump the device log buffer, for diagnostics after a failure
    fn logcat(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Vec::new())
    }
}

/// Parse `ps` output into process entries.
///
/// Expects a header line followed by rows of `USER PID ... NAME`. Rows that
/// do not parse are skipped.
pub fn parse_process_list(output: &str) -> Vec<ProcessInfo> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 3 {
                return None;
            }
            let pid = fields[1].parse().ok()?;
            let name = fields[fields.len() - 1];
            Some(ProcessInfo::new(pid, name, fields[0]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_process_list() {
        let output = "\
USER     PID   PPID  VSIZE  RSS     WCHAN    PC         NAME
root      1     0     640    496   c00bd520 00019fb8 S /init
root      112   1     4632   216   ffffffff 00000000 S /sbin/adbd
shell     200   1     9000   300   ffffffff 00000000 S /system/b2g/b2g
";
        let processes = parse_process_list(output);
        assert_eq!(processes.len(), 3);
        assert_eq!(processes[1], ProcessInfo::new(112, "/sbin/adbd", "root"));
        assert_eq!(processes[2].basename(), "b2g");
    }

    #[test]
    fn test_parse_process_list_skips_garbage() {
        let output = "USER PID NAME\nnot a number here\nroot 7 /init\n\n";
        let processes = parse_process_list(output);
        assert_eq!(processes, vec![ProcessInfo::new(7, "/init", "root")]);
    }

    #[test]
    fn test_error_output() {
        let err = DeviceError::CommandFailed {
            command: "curl".to_string(),
            status: Some(127),
            output: "/system/bin/sh: curl: not found".to_string(),
        };
        assert!(err.output().unwrap().contains("curl: not found"));
        assert!(!err.is_timeout());
    }
}
