//! Failure taxonomy and exit codes

use serde::{Deserialize, Serialize};

use crate::signal::EXIT_CODE_INTERRUPTED;

/// Failure kind: categorizes the cause of a failed unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Device unreachable or a device command failed
    Transport,
    /// A readiness probe or suite ran out of time
    Timeout,
    /// Missing or malformed configuration
    Configuration,
    /// External interrupt; always propagates
    Interrupted,
    /// Anything else (local I/O, suite process launch)
    Other,
}

impl FailureKind {
    /// Interrupts end the run; every other kind is contained to the unit
    /// of work that hit it.
    pub fn propagates(&self) -> bool {
        matches!(self, FailureKind::Interrupted)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Transport => "TRANSPORT",
            FailureKind::Timeout => "TIMEOUT",
            FailureKind::Configuration => "CONFIGURATION",
            FailureKind::Interrupted => "INTERRUPTED",
            FailureKind::Other => "OTHER",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Preconditions held and every suite passed
    Success,
    /// Precondition failure, suite failure or top-level error
    Failed,
    /// Interrupted by a signal after cleanup
    Interrupted,
}

impl ExitCode {
    pub fn code(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::Failed => 1,
            ExitCode::Interrupted => EXIT_CODE_INTERRUPTED,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}
