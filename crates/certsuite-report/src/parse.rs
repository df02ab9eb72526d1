//! Line-oriented parsers for suite logs and the harness log

use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::{Outcome, ReportError, SubtestResult, SuiteResults};

/// One raw structured log entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum LogAction {
    SuiteStart,
    SuiteEnd,
    TestStart {
        test: String,
    },
    TestStatus {
        test: String,
        subtest: String,
        status: String,
        expected: Option<String>,
        message: Option<String>,
    },
    TestEnd {
        test: String,
        status: String,
        expected: Option<String>,
        message: Option<String>,
    },
    Log {
        level: String,
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Fold the contents of a raw structured log into suite results
pub fn parse_suite_str(name: &str, content: &str) -> SuiteResults {
    let mut results = SuiteResults::new(name);

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let action: LogAction = match serde_json::from_str(line) {
            Ok(action) => action,
            Err(_) => {
                results.malformed_lines += 1;
                continue;
            }
        };

        match action {
            LogAction::SuiteStart => results.started = true,
            LogAction::SuiteEnd => results.finished = true,
            LogAction::TestStart { test } => {
                results.test_mut(&test);
            }
            LogAction::TestStatus {
                test,
                subtest,
                status,
                expected,
                message,
            } => {
                let expected = expected.unwrap_or_else(|| status.clone());
                results.test_mut(&test).subtests.push(SubtestResult {
                    name: subtest,
                    outcome: Outcome {
                        status,
                        expected,
                        message,
                    },
                });
            }
            LogAction::TestEnd {
                test,
                status,
                expected,
                message,
            } => {
                let expected = expected.unwrap_or_else(|| status.clone());
                results.test_mut(&test).outcome = Some(Outcome {
                    status,
                    expected,
                    message,
                });
            }
            LogAction::Log { level, message } => {
                if matches!(level.as_str(), "ERROR" | "CRITICAL") {
                    results.errors.push(message);
                }
            }
            LogAction::Other => {}
        }
    }

    results
}

/// Read and fold a raw structured log file
pub fn parse_suite_log(name: &str, path: &Path) -> Result<SuiteResults, ReportError> {
    let content = fs::read_to_string(path).map_err(|source| ReportError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(parse_suite_str(name, &content))
}

/// Problems recorded in the harness's own JSON log
#[derive(Debug, Clone, Default)]
pub struct HarnessLog {
    pub entries: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl HarnessLog {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Summarize a harness log written as one JSON event per line
/// (`{"level": "...", "fields": {"message": "..."}}`)
pub fn parse_harness_log(content: &str) -> HarnessLog {
    let mut log = HarnessLog::default();

    for line in content.lines().filter(|l| !l.trim().is_empty()) {
        let Ok(event) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        log.entries += 1;

        let message = event
            .pointer("/fields/message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match event.get("level").and_then(Value::as_str) {
            Some("ERROR") => log.errors.push(message),
            Some("WARN") => log.warnings.push(message),
            _ => {}
        }
    }

    log
}
