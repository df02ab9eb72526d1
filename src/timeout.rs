//! Timeouts for device readiness probes and suite execution
//!
//! - `poll_interval_ms`: spacing between readiness probe evaluations
//! - `device_ready_seconds`: b2g restart / reboot settle time
//! - `network_seconds`: wait for the device to report an IP address
//! - `command_seconds`: default limit for a single device shell command
//! - `agent_port_seconds`: wait for the automation agent port to accept
//!
//! Suites have no limit unless `timeout_seconds` is set on the suite; a
//! `SuiteDeadline` tracks that optional limit while the child runs.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::poll::PollOptions;

/// Probe and command timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutConfig {
    /// Readiness probe polling interval (default: 1000)
    pub poll_interval_ms: u64,

    /// b2g restart / reboot settle limit (default: 300)
    pub device_ready_seconds: u64,

    /// Network-up limit (default: 40)
    pub network_seconds: u64,

    /// Single shell command limit (default: 60)
    pub command_seconds: u64,

    /// Automation agent port limit (default: 60)
    pub agent_port_seconds: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            device_ready_seconds: 300,
            network_seconds: 40,
            command_seconds: 60,
            agent_port_seconds: 60,
        }
    }
}

impl TimeoutConfig {
    /// Validate bounds
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        // poll_interval_ms must be in (0, 60000]
        if self.poll_interval_ms == 0 || self.poll_interval_ms > 60_000 {
            return Err(TimeoutValidationError::IntervalOutOfBounds {
                value: self.poll_interval_ms,
            });
        }

        let limits = [
            ("device_ready_seconds", self.device_ready_seconds),
            ("network_seconds", self.network_seconds),
            ("command_seconds", self.command_seconds),
            ("agent_port_seconds", self.agent_port_seconds),
        ];
        for (field, value) in limits {
            if value == 0 || value > 3600 {
                return Err(TimeoutValidationError::LimitOutOfBounds { field, value });
            }
        }

        // A probe must get at least one interval
        let interval_seconds = self.poll_interval_ms.div_ceil(1000);
        if self.device_ready_seconds < interval_seconds || self.network_seconds < interval_seconds {
            return Err(TimeoutValidationError::IntervalExceedsLimit {
                interval_ms: self.poll_interval_ms,
            });
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_seconds)
    }

    /// Polling for b2g restart / reboot
    pub fn device_ready(&self) -> PollOptions {
        PollOptions::new(self.poll_interval(), Duration::from_secs(self.device_ready_seconds))
    }

    /// Polling for network-up
    pub fn network(&self) -> PollOptions {
        PollOptions::new(self.poll_interval(), Duration::from_secs(self.network_seconds))
    }

    /// Polling for the automation agent port
    pub fn agent_port(&self) -> PollOptions {
        PollOptions::new(self.poll_interval(), Duration::from_secs(self.agent_port_seconds))
    }
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("poll_interval_ms must be in (0, 60000], got {value}")]
    IntervalOutOfBounds { value: u64 },

    #[error("{field} must be in (0, 3600], got {value}")]
    LimitOutOfBounds { field: &'static str, value: u64 },

    #[error("poll_interval_ms {interval_ms} is longer than a probe limit")]
    IntervalExceedsLimit { interval_ms: u64 },
}

/// Deadline check result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutStatus {
    /// Still within the limit, or no limit set
    Ok,
    /// The suite ran past its limit
    Expired,
}

impl TimeoutStatus {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TimeoutStatus::Expired)
    }
}

/// Optional wall-clock limit for one suite process
///
/// The deadline does not stop anything itself; the runner checks it while
/// waiting on the child and terminates the child when it expires.
#[derive(Debug, Clone)]
pub struct SuiteDeadline {
    limit: Option<Duration>,
    start_time: Instant,
}

impl SuiteDeadline {
    pub fn new(limit: Option<Duration>) -> Self {
        Self {
            limit,
            start_time: Instant::now(),
        }
    }

    /// No limit
    pub fn unbounded() -> Self {
        Self::new(None)
    }

    pub fn check(&self) -> TimeoutStatus {
        match self.limit {
            Some(limit) if self.start_time.elapsed() > limit => TimeoutStatus::Expired,
            _ => TimeoutStatus::Ok,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time left before expiry; `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.limit.map(|limit| limit.saturating_sub(self.elapsed()))
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn test_timeout_config_default() {
        let config = TimeoutConfig::default();
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.device_ready_seconds, 300);
        assert_eq!(config.network_seconds, 40);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeout_config_zero_interval() {
        let config = TimeoutConfig {
            poll_interval_ms: 0,
            ..TimeoutConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimeoutValidationError::IntervalOutOfBounds { value: 0 })
        ));
    }

    #[test]
    fn test_timeout_config_limit_names_field() {
        let config = TimeoutConfig {
            network_seconds: 0,
            ..TimeoutConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("network_seconds"));
    }

    #[test]
    fn test_timeout_config_interval_longer_than_limit() {
        let config = TimeoutConfig {
            poll_interval_ms: 50_000,
            network_seconds: 10,
            ..TimeoutConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TimeoutValidationError::IntervalExceedsLimit { .. })
        ));
    }

    #[test]
    fn test_poll_options() {
        let config = TimeoutConfig::default();
        let options = config.network();
        assert_eq!(options.interval, Duration::from_secs(1));
        assert_eq!(options.timeout, Duration::from_secs(40));
    }

    #[test]
    fn test_unbounded_deadline_never_expires() {
        let deadline = SuiteDeadline::unbounded();
        assert_eq!(deadline.check(), TimeoutStatus::Ok);
        assert!(deadline.remaining().is_none());
    }

    #[test]
    fn test_deadline_expires() {
        let deadline = SuiteDeadline::new(Some(Duration::from_millis(10)));
        assert!(!deadline.check().is_timeout());
        sleep(Duration::from_millis(25));
        assert!(deadline.check().is_timeout());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }
}
