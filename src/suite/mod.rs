//! Suite execution
//!
//! A suite is an external executable described by a [`SuiteConfig`].
//! [`build_command`] maps the config and a run context to an argument vector
//! without touching the filesystem; [`SuiteRunner`] spawns that command,
//! supervises the child, and reports where the suite's output files should
//! be.
//!
//! The argument vector is:
//! - the suite executable
//! - `--log-raw=<temp_dir>/<suite>_structured[_<group>...].log`
//! - `--log-mach=-` (human-readable structured output on stdout)
//! - one `--include=<group>` per requested group
//! - rendered `run_args`, then rendered `common_args`

mod runner;

pub use runner::{list_test_groups, SuiteRunner};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use crate::config::{HarnessConfig, SuiteConfig, TEMP_DIR_VAR};
use crate::failure::FailureKind;

/// Flag naming the raw structured log
pub const LOG_RAW_FLAG: &str = "--log-raw";

/// Flag sending the mach formatted log to stdout
pub const LOG_MACH_STDOUT: &str = "--log-mach=-";

/// Flag selecting a test group
pub const INCLUDE_FLAG: &str = "--include";

/// Flag asking a suite to list its test groups
pub const LIST_GROUPS_FLAG: &str = "--list-test-groups";

/// Suite errors
#[derive(Debug, thiserror::Error)]
pub enum SuiteError {
    #[error("no suite named '{0}' in the configuration")]
    UnknownSuite(String),

    #[error("failed to launch suite '{suite}' ({command}): {source}")]
    Spawn {
        suite: String,
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed waiting for suite '{suite}': {source}")]
    Wait {
        suite: String,
        #[source]
        source: std::io::Error,
    },

    #[error("suite '{suite}' exceeded its {seconds}s time limit")]
    TimedOut { suite: String, seconds: u64 },

    #[error("suite '{0}' interrupted")]
    Interrupted(String),

    #[error("suite '{suite}' failed to list test groups (status {status:?}): {output}")]
    ListGroups {
        suite: String,
        status: Option<i32>,
        output: String,
    },
}

impl SuiteError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SuiteError::UnknownSuite(_) => FailureKind::Configuration,
            SuiteError::TimedOut { .. } => FailureKind::Timeout,
            SuiteError::Interrupted(_) => FailureKind::Interrupted,
            SuiteError::Spawn { .. } | SuiteError::Wait { .. } | SuiteError::ListGroups { .. } => FailureKind::Other,
        }
    }
}

/// Placeholder values for one suite invocation
#[derive(Debug, Clone)]
pub struct RunContext {
    temp_dir: PathBuf,
    values: BTreeMap<String, String>,
}

impl RunContext {
    /// Shared config values plus `temp_dir`
    pub fn new(config: &HarnessConfig, temp_dir: &Path) -> Self {
        let mut values = config.shared_values();
        values.insert(TEMP_DIR_VAR.to_string(), temp_dir.display().to_string());
        Self {
            temp_dir: temp_dir.to_path_buf(),
            values,
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

/// A fully rendered suite invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteCommand {
    pub argv: Vec<String>,
    /// Files the suite is expected to write: the raw log, then extra files
    pub output_files: Vec<PathBuf>,
    pub raw_log: PathBuf,
}

impl SuiteCommand {
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or_default()
    }

    pub fn args(&self) -> &[String] {
        self.argv.get(1..).unwrap_or_default()
    }
}

/// Raw log file name. Group names are folded in so repeated runs of one
/// suite with different groups do not collide.
pub fn raw_log_name(suite_id: &str, groups: &[String]) -> String {
    let mut name = format!("{}_structured", suite_id);
    for group in groups {
        name.push('_');
        name.push_str(&group.replace('/', "-"));
    }
    name.push_str(".log");
    name
}

/// Map a suite definition and run context to its invocation
pub fn build_command(suite_id: &str, suite: &SuiteConfig, groups: &[String], context: &RunContext) -> SuiteCommand {
    let values = context.values();
    let raw_log = context.temp_dir().join(raw_log_name(suite_id, groups));

    let mut argv = vec![
        suite.cmd.render(values),
        format!("{}={}", LOG_RAW_FLAG, raw_log.display()),
        LOG_MACH_STDOUT.to_string(),
    ];
    argv.extend(groups.iter().map(|g| format!("{}={}", INCLUDE_FLAG, g)));
    argv.extend(suite.run_args.iter().map(|t| t.render(values)));
    argv.extend(suite.common_args.iter().map(|t| t.render(values)));

    let mut output_files = vec![raw_log.clone()];
    output_files.extend(suite.extra_files.iter().map(|t| PathBuf::from(t.render(values))));

    SuiteCommand {
        argv,
        output_files,
        raw_log,
    }
}

/// What a finished suite left behind
#[derive(Debug, Clone)]
pub struct SuiteResult {
    pub suite_id: String,
    pub output_files: Vec<PathBuf>,
    pub raw_log: PathBuf,
    pub exit_status: Option<ExitStatus>,
}

/// Runs one suite to completion
pub trait SuiteExecutor {
    fn run(&mut self, suite_id: &str, groups: &[String], temp_dir: &Path) -> Result<SuiteResult, SuiteError>;
}

/// Parse `--list-test-groups` output: one group per non-empty line
pub fn parse_group_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
