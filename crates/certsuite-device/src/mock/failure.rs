//! Failure injection for the mock device

use std::collections::HashMap;
use std::time::Duration;

use crate::DeviceError;

/// Operations the mock device can be told to fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Shell,
    Push,
    Pull,
    Remove,
    ProcessList,
    Remount,
    Forward,
    Reboot,
    Logcat,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Message carried by the injected error
    pub message: String,
    /// Report the failure as a timeout instead of a command failure
    pub timeout: bool,
    /// Only fail commands containing this text (shell only)
    pub matching: Option<String>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
}

impl FailureConfig {
    /// A command failure carrying `message` as its output
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timeout: false,
            matching: None,
            fail_count: None,
            delay: None,
        }
    }

    /// A transport timeout
    pub fn timeout() -> Self {
        Self {
            timeout: true,
            ..Self::error("timed out")
        }
    }

    /// Restrict a shell failure to commands containing `needle`
    pub fn matching(mut self, needle: impl Into<String>) -> Self {
        self.matching = Some(needle.into());
        self
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    /// Delay the response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn to_error(&self, command: &str) -> DeviceError {
        if self.timeout {
            DeviceError::Timeout {
                command: command.to_string(),
                seconds: 0,
            }
        } else {
            DeviceError::CommandFailed {
                command: command.to_string(),
                status: Some(1),
                output: self.message.clone(),
            }
        }
    }
}

/// Failure injector for the mock device
#[derive(Debug, Default)]
pub struct FailureInjector {
    configs: HashMap<MockOp, FailureConfig>,
    call_counts: HashMap<MockOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation, replacing any previous one
    pub fn inject(&mut self, op: MockOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    /// Clear all failure injections
    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    /// Clear failure injection for a specific operation
    pub fn clear_op(&mut self, op: MockOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Return the failure to apply to this call, if any
    pub fn check(&mut self, op: MockOp, command: &str) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        if let Some(ref needle) = config.matching {
            if !command.contains(needle.as_str()) {
                return None;
            }
        }

        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;
        if let Some(limit) = config.fail_count {
            if *count > limit {
                return None;
            }
        }
        Some(config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_injector_basic() {
        let mut injector = FailureInjector::new();
        assert!(injector.check(MockOp::Pull, "/data/local").is_none());

        injector.inject(MockOp::Pull, FailureConfig::error("no such file"));
        let failure = injector.check(MockOp::Pull, "/data/local").unwrap();
        assert_eq!(failure.message, "no such file");
    }

    #[test]
    fn test_failure_injector_fail_count() {
        let mut injector = FailureInjector::new();
        injector.inject(MockOp::Shell, FailureConfig::timeout().with_fail_count(2));

        assert!(injector.check(MockOp::Shell, "netcfg").is_some());
        assert!(injector.check(MockOp::Shell, "netcfg").is_some());
        assert!(injector.check(MockOp::Shell, "netcfg").is_none());
    }

    #[test]
    fn test_failure_injector_matching() {
        let mut injector = FailureInjector::new();
        injector.inject(MockOp::Shell, FailureConfig::error("bad format").matching("touch -t"));

        assert!(injector.check(MockOp::Shell, "date +%s").is_none());
        assert!(injector.check(MockOp::Shell, "touch -t 1400000000 /x").is_some());
    }

    #[test]
    fn test_failure_injector_clear() {
        let mut injector = FailureInjector::new();
        injector.inject(MockOp::Reboot, FailureConfig::error("x"));
        injector.clear_op(MockOp::Reboot);
        assert!(injector.check(MockOp::Reboot, "reboot").is_none());
    }

    #[test]
    fn test_timeout_maps_to_timeout_error() {
        let err = FailureConfig::timeout().to_error("ls");
        assert!(err.is_timeout());
    }
}
