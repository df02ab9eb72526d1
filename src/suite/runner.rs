//! Suite process supervision

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::{build_command, parse_group_list, RunContext, SuiteError, SuiteExecutor, SuiteResult, LIST_GROUPS_FLAG};
use crate::config::HarnessConfig;
use crate::logging::current_dispatch;
use crate::signal::SignalState;
use crate::timeout::SuiteDeadline;

/// How often the wait loop checks the child, the interrupt flag and the
/// deadline
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs configured suites as child processes
pub struct SuiteRunner<'a> {
    config: &'a HarnessConfig,
    signals: Arc<SignalState>,
}

impl<'a> SuiteRunner<'a> {
    pub fn new(config: &'a HarnessConfig, signals: Arc<SignalState>) -> Self {
        Self { config, signals }
    }

    fn wait(&self, suite_id: &str, guard: &mut ChildGuard, deadline: &SuiteDeadline) -> Result<ExitStatus, SuiteError> {
        let wait_error = |source| SuiteError::Wait {
            suite: suite_id.to_string(),
            source,
        };
        loop {
            if self.signals.is_cancel_requested() {
                warn!(suite = suite_id, "Interrupt received, terminating suite");
                guard.terminate(self.signals.grace_period()).map_err(wait_error)?;
                return Err(SuiteError::Interrupted(suite_id.to_string()));
            }
            if deadline.check().is_timeout() {
                let seconds = deadline.limit().map(|d| d.as_secs()).unwrap_or_default();
                warn!(suite = suite_id, seconds, "Suite time limit reached, terminating");
                guard.terminate(self.signals.grace_period()).map_err(wait_error)?;
                return Err(SuiteError::TimedOut {
                    suite: suite_id.to_string(),
                    seconds,
                });
            }
            if let Some(status) = guard.try_wait().map_err(wait_error)? {
                return Ok(status);
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
    }
}

impl SuiteExecutor for SuiteRunner<'_> {
    fn run(&mut self, suite_id: &str, groups: &[String], temp_dir: &Path) -> Result<SuiteResult, SuiteError> {
        let suite = self
            .config
            .suite(suite_id)
            .ok_or_else(|| SuiteError::UnknownSuite(suite_id.to_string()))?;
        let context = RunContext::new(self.config, temp_dir);
        let command = build_command(suite_id, suite, groups, &context);

        info!(suite = suite_id, groups = ?groups, argv = ?command.argv, "Running suite");
        let mut process = Command::new(command.program());
        process
            .args(command.args())
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            process.process_group(0);
        }

        let mut child = process.spawn().map_err(|source| SuiteError::Spawn {
            suite: suite_id.to_string(),
            command: command.program().to_string(),
            source,
        })?;
        let streams = [
            child.stdout.take().map(|out| stream_lines(suite_id, "stdout", out)),
            child.stderr.take().map(|err| stream_lines(suite_id, "stderr", err)),
        ];
        let mut guard = ChildGuard::new(child);

        self.signals.set_running_suite(Some(suite_id));
        let deadline = SuiteDeadline::new(suite.timeout_seconds.map(Duration::from_secs));
        let waited = self.wait(suite_id, &mut guard, &deadline);
        self.signals.set_running_suite(None);
        drop(guard);

        for handle in streams.into_iter().flatten() {
            if handle.join().is_err() {
                warn!(suite = suite_id, "Suite output reader panicked");
            }
        }
        let status = waited?;

        if status.success() {
            info!(suite = suite_id, elapsed_ms = deadline.elapsed().as_millis() as u64, "Suite finished");
        } else {
            warn!(suite = suite_id, status = %status, "Suite exited with non-zero status");
        }

        Ok(SuiteResult {
            suite_id: suite_id.to_string(),
            output_files: command.output_files,
            raw_log: command.raw_log,
            exit_status: Some(status),
        })
    }
}

/// Forward a child's output to the run log line by line
fn stream_lines<R: Read + Send + 'static>(suite_id: &str, stream: &'static str, source: R) -> JoinHandle<()> {
    let dispatch = current_dispatch();
    let suite = suite_id.to_string();
    std::thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || {
            for line in BufReader::new(source).lines() {
                match line {
                    Ok(line) => info!(suite = %suite, stream, "{}", line),
                    Err(e) => {
                        debug!(suite = %suite, stream, "Stopped reading suite output: {}", e);
                        break;
                    }
                }
            }
        })
    })
}

/// Owns a running suite process. On drop the suite's process group is
/// killed, so background processes it left behind cannot hold its output
/// pipes open. An unreaped child is killed and reaped too.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self { child, reaped: false }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        self.reaped = status.is_some();
        Ok(status)
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    fn terminate(&mut self, grace: Duration) -> std::io::Result<()> {
        self.signal_group(false);

        let start = Instant::now();
        while start.elapsed() < grace {
            if self.try_wait()?.is_some() {
                return Ok(());
            }
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }

        self.kill()
    }

    fn kill(&mut self) -> std::io::Result<()> {
        self.signal_group(true);
        let _ = self.child.kill();
        self.child.wait()?;
        self.reaped = true;
        Ok(())
    }

    #[cfg(unix)]
    fn signal_group(&self, force: bool) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
        let _ = killpg(Pid::from_raw(self.child.id() as i32), signal);
    }

    #[cfg(not(unix))]
    fn signal_group(&self, _force: bool) {}
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if self.reaped {
            self.signal_group(true);
            return;
        }
        debug!(pid = self.child.id(), "Killing unreaped suite process");
        let _ = self.kill();
    }
}

/// Ask a suite which test groups it has
pub fn list_test_groups(config: &HarnessConfig, suite_id: &str, temp_dir: &Path) -> Result<Vec<String>, SuiteError> {
    let suite = config
        .suite(suite_id)
        .ok_or_else(|| SuiteError::UnknownSuite(suite_id.to_string()))?;
    let context = RunContext::new(config, temp_dir);
    let program = suite.cmd.render(context.values());

    let mut process = Command::new(&program);
    process.arg(LIST_GROUPS_FLAG);
    process.args(suite.common_args.iter().map(|t| t.render(context.values())));
    debug!(suite = suite_id, program = %program, "Listing test groups");

    let output = process
        .env("PYTHONUNBUFFERED", "1")
        .stdin(Stdio::null())
        .output()
        .map_err(|source| SuiteError::Spawn {
            suite: suite_id.to_string(),
            command: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(SuiteError::ListGroups {
            suite: suite_id.to_string(),
            status: output.status.code(),
            output: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(parse_group_list(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{SuiteConfig, Template};
    use std::os::unix::fs::PermissionsExt;

    fn script(dir: &Path, name: &str, body: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.display().to_string()
    }

    fn config_with(id: &str, suite: SuiteConfig) -> HarnessConfig {
        let mut config = HarnessConfig::parse_toml("version = \"2.0\"\n").unwrap();
        config.suites.insert(id.to_string(), suite);
        config
    }

    #[test]
    fn test_run_reports_output_files() {
        let bin = tempfile::tempdir().unwrap();
        let temp = tempfile::tempdir().unwrap();
        // Writes the raw log named by --log-raw=...
        let cmd = script(
            bin.path(),
            "suite",
            "for a in \"$@\"; do case \"$a\" in --log-raw=*) echo '{}' > \"${a#--log-raw=}\";; esac; done\necho running",
        );
        let config = config_with("a", SuiteConfig::new(&cmd));
        let mut runner = SuiteRunner::new(&config, Arc::new(SignalState::new()));

        let result = runner.run("a", &[], temp.path()).unwrap();
        assert_eq!(result.raw_log, temp.path().join("a_structured.log"));
        assert!(result.raw_log.is_file());
        assert_eq!(result.output_files, vec![result.raw_log.clone()]);
        assert!(result.exit_status.unwrap().success());
    }

    #[test]
    fn test_non_zero_exit_is_not_an_error() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(bin.path(), "suite", "exit 4");
        let config = config_with("a", SuiteConfig::new(&cmd));
        let mut runner = SuiteRunner::new(&config, Arc::new(SignalState::new()));

        let result = runner.run("a", &[], bin.path()).unwrap();
        assert_eq!(result.exit_status.unwrap().code(), Some(4));
    }

    #[test]
    fn test_background_process_does_not_hold_suite_open() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(bin.path(), "suite", "sleep 30 &\necho started\nexit 0");
        let config = config_with("a", SuiteConfig::new(&cmd));
        let mut runner = SuiteRunner::new(&config, Arc::new(SignalState::new()));

        let start = Instant::now();
        let result = runner.run("a", &[], bin.path()).unwrap();
        assert!(result.exit_status.unwrap().success());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_unknown_suite() {
        let config = HarnessConfig::parse_toml("version = \"2.0\"\n").unwrap();
        let mut runner = SuiteRunner::new(&config, Arc::new(SignalState::new()));
        let err = runner.run("nope", &[], Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SuiteError::UnknownSuite(_)));
    }

    #[test]
    fn test_missing_executable_is_spawn_error() {
        let config = config_with("a", SuiteConfig::new("/nonexistent/certsuite-suite"));
        let mut runner = SuiteRunner::new(&config, Arc::new(SignalState::new()));
        let err = runner.run("a", &[], Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, SuiteError::Spawn { .. }));
    }

    #[test]
    fn test_timeout_kills_suite() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(bin.path(), "suite", "sleep 30");
        let mut suite = SuiteConfig::new(&cmd);
        suite.timeout_seconds = Some(1);
        let config = config_with("slow", suite);
        let signals = Arc::new(SignalState::with_grace_period(Duration::from_millis(200)));
        let mut runner = SuiteRunner::new(&config, signals);

        let start = Instant::now();
        let err = runner.run("slow", &[], bin.path()).unwrap_err();
        assert!(matches!(err, SuiteError::TimedOut { seconds: 1, .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_interrupt_terminates_suite() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(bin.path(), "suite", "sleep 30");
        let config = config_with("a", SuiteConfig::new(&cmd));
        let signals = Arc::new(SignalState::with_grace_period(Duration::from_millis(200)));
        let mut runner = SuiteRunner::new(&config, signals.clone());

        let trigger = signals.clone();
        let interrupter = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            trigger.handle_signal();
        });

        let start = Instant::now();
        let err = runner.run("a", &[], bin.path()).unwrap_err();
        interrupter.join().unwrap();
        assert!(matches!(err, SuiteError::Interrupted(_)));
        assert_eq!(err.kind(), crate::failure::FailureKind::Interrupted);
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(signals.running_suite(), None);
    }

    #[test]
    fn test_list_test_groups() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(
            bin.path(),
            "suite",
            "[ \"$1\" = --list-test-groups ] || exit 2\n[ \"$2\" = --flag=2.0 ] || exit 3\nprintf 'apps\\nsystem\\n'",
        );
        let mut suite = SuiteConfig::new(&cmd);
        suite.common_args = vec![Template::parse("--flag=%(version)s").unwrap()];
        let config = config_with("a", suite);

        let groups = list_test_groups(&config, "a", bin.path()).unwrap();
        assert_eq!(groups, vec!["apps", "system"]);
    }

    #[test]
    fn test_list_test_groups_failure() {
        let bin = tempfile::tempdir().unwrap();
        let cmd = script(bin.path(), "suite", "echo broken >&2\nexit 1");
        let config = config_with("a", SuiteConfig::new(&cmd));
        let err = list_test_groups(&config, "a", bin.path()).unwrap_err();
        assert!(matches!(err, SuiteError::ListGroups { status: Some(1), .. }));
    }
}
