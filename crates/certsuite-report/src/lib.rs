//! Structured log parsing and report rendering
//!
//! Suites write raw structured logs: one JSON object per line, tagged by an
//! `action` field (`suite_start`, `test_start`, `test_status`, `test_end`,
//! `suite_end`, `log`). This crate folds such a log into `SuiteResults` and
//! renders the HTML reports bundled into the run archive.
//!
//! The orchestrator's own log is a different shape (one tracing event per
//! line); `HarnessLog` extracts the problems it recorded for the summary.

mod html;
mod parse;

pub use html::{escape_html, render_subsuite, render_summary};
pub use parse::{parse_harness_log, parse_suite_log, parse_suite_str, HarnessLog, LogAction};

use serde::{Deserialize, Serialize};

/// Errors reading a structured log
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("failed to read log {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of one test or subtest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outcome {
    /// Status reported by the suite (PASS, FAIL, OK, ERROR, TIMEOUT, ...)
    pub status: String,
    /// Status the suite expected; a mismatch is an unexpected result
    pub expected: String,
    /// Optional failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Outcome {
    pub fn is_unexpected(&self) -> bool {
        self.status != self.expected
    }
}

/// One subtest result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtestResult {
    pub name: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// One test with its subtests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub name: String,
    /// Set when `test_end` was seen
    pub outcome: Option<Outcome>,
    pub subtests: Vec<SubtestResult>,
}

impl TestResult {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            outcome: None,
            subtests: Vec::new(),
        }
    }

    /// Number of unexpected results in this test, counting the test itself
    /// as unexpected when it never finished
    pub fn unexpected_count(&self) -> usize {
        let own = match self.outcome {
            Some(ref outcome) => usize::from(outcome.is_unexpected()),
            None => 1,
        };
        own + self.subtests.iter().filter(|s| s.outcome.is_unexpected()).count()
    }
}

/// Folded results of one suite's structured log
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteResults {
    /// Suite identifier
    pub name: String,
    /// Whether a `suite_start` entry was seen
    pub started: bool,
    /// Whether a `suite_end` entry was seen
    pub finished: bool,
    /// Tests in first-seen order
    pub tests: Vec<TestResult>,
    /// Messages of `log` entries at ERROR or CRITICAL level
    pub errors: Vec<String>,
    /// Lines that were not valid structured entries
    pub malformed_lines: usize,
}

impl SuiteResults {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn unexpected_count(&self) -> usize {
        self.tests.iter().map(TestResult::unexpected_count).sum()
    }

    /// Total test and subtest results recorded
    pub fn result_count(&self) -> usize {
        self.tests.iter().map(|t| 1 + t.subtests.len()).sum()
    }

    /// A suite passes when it ran, every result matched expectations and it
    /// logged no errors
    pub fn is_pass(&self) -> bool {
        self.started && self.unexpected_count() == 0 && self.errors.is_empty()
    }

    pub(crate) fn test_mut(&mut self, name: &str) -> &mut TestResult {
        let index = match self.tests.iter().position(|t| t.name == name) {
            Some(index) => index,
            None => {
                self.tests.push(TestResult::new(name));
                self.tests.len() - 1
            }
        };
        &mut self.tests[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(status: &str, expected: &str) -> Outcome {
        Outcome {
            status: status.to_string(),
            expected: expected.to_string(),
            message: None,
        }
    }

    #[test]
    fn test_unfinished_test_counts_as_unexpected() {
        let mut results = SuiteResults::new("webapi");
        results.started = true;
        results.test_mut("a");
        assert_eq!(results.unexpected_count(), 1);
        assert!(!results.is_pass());
    }

    #[test]
    fn test_pass_requires_start() {
        let results = SuiteResults::new("webapi");
        assert!(!results.is_pass());
    }

    #[test]
    fn test_subtest_counts() {
        let mut results = SuiteResults::new("webapi");
        results.started = true;
        let test = results.test_mut("a");
        test.outcome = Some(outcome("OK", "OK"));
        test.subtests.push(SubtestResult {
            name: "one".to_string(),
            outcome: outcome("FAIL", "PASS"),
        });
        test.subtests.push(SubtestResult {
            name: "two".to_string(),
            outcome: outcome("PASS", "PASS"),
        });
        assert_eq!(results.result_count(), 3);
        assert_eq!(results.unexpected_count(), 1);
    }
}
