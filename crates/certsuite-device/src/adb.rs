//! ADB transport
//!
//! Drives the `adb` executable as a subprocess for every operation. Shell
//! commands are wrapped so their exit status comes back on stdout, since
//! older `adb shell` builds always exit 0.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::{parse_process_list, DeviceControl, DeviceError, ProcessInfo};

/// Marker appended to shell commands to recover the remote exit status
const RC_MARKER: &str = "certsuite-rc=";

/// ADB transport configuration
#[derive(Debug, Clone)]
pub struct AdbConfig {
    /// Path to the adb executable
    pub adb_path: PathBuf,
    /// Device serial; `None` means the only attached device
    pub serial: Option<String>,
    /// Default timeout for commands that do not pass their own
    pub command_timeout: Duration,
}

impl Default for AdbConfig {
    fn default() -> Self {
        Self {
            adb_path: default_adb_path(),
            serial: None,
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Locate adb: `ADB_PATH`, then `$ANDROID_SDK_ROOT/platform-tools/adb`,
/// then whatever `adb` resolves to on `PATH`.
pub fn default_adb_path() -> PathBuf {
    if let Ok(path) = std::env::var("ADB_PATH") {
        return PathBuf::from(path);
    }
    if let Ok(sdk_root) = std::env::var("ANDROID_SDK_ROOT").or_else(|_| std::env::var("ANDROID_HOME")) {
        let candidate = PathBuf::from(sdk_root).join("platform-tools").join("adb");
        if candidate.exists() {
            return candidate;
        }
    }
    PathBuf::from("adb")
}

/// Production device transport
pub struct AdbDevice {
    config: AdbConfig,
}

impl AdbDevice {
    /// Connect to the device, failing if adb does not report it as online
    pub fn connect(config: AdbConfig) -> Result<Self, DeviceError> {
        let device = Self { config };
        let state = device.adb(&["get-state"], None)?;
        let state = String::from_utf8_lossy(&state.stdout).trim().to_string();
        if state != "device" {
            return Err(DeviceError::Unreachable(format!(
                "adb reports device state '{}'; check the cable and that remote debugging is enabled",
                state
            )));
        }
        Ok(device)
    }

    pub fn config(&self) -> &AdbConfig {
        &self.config
    }

    fn base_args(&self) -> Vec<String> {
        match self.config.serial {
            Some(ref serial) => vec!["-s".to_string(), serial.clone()],
            None => Vec::new(),
        }
    }

    /// Run `adb <args>` and return its output, failing on non-zero exit
    fn adb(&self, args: &[&str], timeout: Option<Duration>) -> Result<Output, DeviceError> {
        let mut command = Command::new(&self.config.adb_path);
        command.args(self.base_args()).args(args);

        let description = format!("adb {}", args.join(" "));
        debug!(command = %description, "running adb");

        let timeout = timeout.unwrap_or(self.config.command_timeout);
        let output = run_with_timeout(command, timeout).map_err(|e| match e {
            DeviceError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => DeviceError::Unreachable(
                format!("adb not found at {}", self.config.adb_path.display()),
            ),
            DeviceError::Timeout { seconds, .. } => DeviceError::Timeout {
                command: description.clone(),
                seconds,
            },
            other => other,
        })?;

        if !output.status.success() {
            return Err(DeviceError::CommandFailed {
                command: description,
                status: output.status.code(),
                output: combined_output(&output),
            });
        }
        Ok(output)
    }
}

impl DeviceControl for AdbDevice {
    fn shell(&self, command: &str, timeout: Option<Duration>) -> Result<String, DeviceError> {
        let wrapped = format!("{}; echo {}$?", command, RC_MARKER);
        let output = self.adb(&["shell", &wrapped], timeout)?;
        let stdout = String::from_utf8_lossy(&output.stdout).replace("\r\n", "\n");

        let (body, status) = split_exit_status(&stdout);
        match status {
            Some(0) => Ok(body),
            status => Err(DeviceError::CommandFailed {
                command: command.to_string(),
                status,
                output: format!("{}{}", body, String::from_utf8_lossy(&output.stderr)),
            }),
        }
    }

    fn push(&self, local: &Path, remote: &str) -> Result<(), DeviceError> {
        let local = local.to_string_lossy();
        self.adb(&["push", &local, remote], None).map(|_| ())
    }

    fn pull(&self, remote: &str, local: &Path) -> Result<(), DeviceError> {
        let local = local.to_string_lossy();
        self.adb(&["pull", remote, &local], None).map(|_| ())
    }

    fn remove(&self, remote: &str, recursive: bool) -> Result<(), DeviceError> {
        let flags = if recursive { "-rf" } else { "-f" };
        self.shell(&format!("rm {} {}", flags, remote), None).map(|_| ())
    }

    fn process_list(&self) -> Result<Vec<ProcessInfo>, DeviceError> {
        let output = self.shell("ps", None)?;
        Ok(parse_process_list(&output))
    }

    fn remount(&self) -> Result<(), DeviceError> {
        self.adb(&["remount"], None).map(|_| ())
    }

    fn forward(&self, local_port: u16, remote_port: u16) -> Result<(), DeviceError> {
        let local = format!("tcp:{}", local_port);
        let remote = format!("tcp:{}", remote_port);
        self.adb(&["forward", &local, &remote], None).map(|_| ())
    }

    fn reboot(&self) -> Result<(), DeviceError> {
        self.adb(&["reboot"], None).map(|_| ())
    }

    fn logcat(&self) -> Result<Vec<String>, DeviceError> {
        let output = self.adb(&["logcat", "-d"], None)?;
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect())
    }
}

/// Split the trailing exit-status marker off wrapped shell output
fn split_exit_status(stdout: &str) -> (String, Option<i32>) {
    match stdout.rfind(RC_MARKER) {
        Some(pos) => {
            let status = stdout[pos + RC_MARKER.len()..].trim().parse().ok();
            (stdout[..pos].to_string(), status)
        }
        None => (stdout.to_string(), None),
    }
}

fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut out = stdout.trim().to_string();
    if !stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(stderr.trim());
    }
    out
}

/// Run a command to completion, killing it if it outlives `timeout`.
///
/// Both pipes are drained on helper threads so a chatty child cannot block
/// on a full pipe while we wait.
fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, DeviceError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let stdout_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut out) = stdout {
            let _ = out.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_handle = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(ref mut err) = stderr {
            let _ = err.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None if start.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return Err(DeviceError::Timeout {
                    command: String::new(),
                    seconds: timeout.as_secs(),
                });
            }
            None => std::thread::sleep(Duration::from_millis(20)),
        }
    };

    Ok(Output {
        status,
        stdout: stdout_handle.join().unwrap_or_default(),
        stderr: stderr_handle.join().unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_exit_status() {
        let (body, status) = split_exit_status("hello\ncertsuite-rc=0\n");
        assert_eq!(body, "hello\n");
        assert_eq!(status, Some(0));

        let (body, status) = split_exit_status("sh: curl: not found\ncertsuite-rc=127\n");
        assert_eq!(body, "sh: curl: not found\n");
        assert_eq!(status, Some(127));
    }

    #[test]
    fn test_split_exit_status_missing_marker() {
        let (body, status) = split_exit_status("truncated");
        assert_eq!(body, "truncated");
        assert_eq!(status, None);
    }

    #[test]
    fn test_default_config() {
        let config = AdbConfig::default();
        assert!(config.serial.is_none());
        assert_eq!(config.command_timeout, Duration::from_secs(60));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_kills_slow_command() {
        let mut command = Command::new("sleep");
        command.arg("5");
        let start = Instant::now();
        let result = run_with_timeout(command, Duration::from_millis(200));
        assert!(matches!(result, Err(DeviceError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn test_run_with_timeout_captures_output() {
        let mut command = Command::new("sh");
        command.args(["-c", "echo out; echo err >&2"]);
        let output = run_with_timeout(command, Duration::from_secs(5)).unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "out\n");
        assert_eq!(combined_output(&output), "out\nerr");
    }

    #[test]
    fn test_connect_missing_adb_is_unreachable() {
        let config = AdbConfig {
            adb_path: PathBuf::from("/nonexistent/certsuite/adb"),
            serial: None,
            command_timeout: Duration::from_secs(1),
        };
        let result = AdbDevice::connect(config);
        assert!(matches!(result, Err(DeviceError::Unreachable(_))));
    }
}
