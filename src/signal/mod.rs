//! Signal handling for interrupted runs (SIGINT/SIGTERM)
//!
//! On the first signal:
//! 1. Mark cancellation requested
//! 2. The suite runner notices, terminates the running suite process
//! 3. The run loop restores the device, releases the snapshot and seals the
//!    archive, then exits with code 130
//!
//! On a second signal the runner stops waiting out the termination grace
//! period and kills the suite process outright. Cleanup still runs.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default time a suite process gets between SIGTERM and SIGKILL
pub const DEFAULT_GRACE_PERIOD_SECONDS: u64 = 5;

/// Exit code for interrupted runs
pub const EXIT_CODE_INTERRUPTED: i32 = 130;

/// Signal handler state
#[derive(Debug)]
pub struct SignalState {
    /// First signal received (cancellation initiated)
    cancel_requested: AtomicBool,
    /// Second signal received (skip grace periods)
    immediate_exit: AtomicBool,
    /// Signal count (for tracking double-SIGINT)
    signal_count: AtomicU8,
    /// Suite running when the signal arrived, for the log
    running_suite: Mutex<Option<String>>,
    /// Grace period for suite termination
    grace_period: Duration,
}

impl SignalState {
    /// Create a new signal state with default grace period
    pub fn new() -> Self {
        Self::with_grace_period(Duration::from_secs(DEFAULT_GRACE_PERIOD_SECONDS))
    }

    /// Create a new signal state with custom grace period
    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            cancel_requested: AtomicBool::new(false),
            immediate_exit: AtomicBool::new(false),
            signal_count: AtomicU8::new(0),
            running_suite: Mutex::new(None),
            grace_period,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Handle a signal (SIGINT/SIGTERM)
    pub fn handle_signal(&self) -> SignalAction {
        let count = self.signal_count.fetch_add(1, Ordering::SeqCst);

        if count == 0 {
            self.cancel_requested.store(true, Ordering::SeqCst);
            SignalAction::InitiateCancellation
        } else if count == 1 {
            self.immediate_exit.store(true, Ordering::SeqCst);
            SignalAction::ImmediateExit
        } else {
            SignalAction::Ignore
        }
    }

    /// Record which suite is running
    pub fn set_running_suite(&self, suite: Option<&str>) {
        if let Ok(mut running) = self.running_suite.lock() {
            *running = suite.map(str::to_string);
        }
    }

    pub fn running_suite(&self) -> Option<String> {
        self.running_suite.lock().ok().and_then(|s| s.clone())
    }

    /// Grace period between SIGTERM and SIGKILL; zero after a second signal
    pub fn grace_period(&self) -> Duration {
        if self.is_immediate_exit() {
            Duration::ZERO
        } else {
            self.grace_period
        }
    }
}

impl Default for SignalState {
    fn default() -> Self {
        Self::new()
    }
}

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: stop the running suite and clean up
    InitiateCancellation,
    /// Second signal: kill without grace, still clean up
    ImmediateExit,
    /// Third+ signal: ignore
    Ignore,
}

/// Signal handler that manages the signal state
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self {
            state: Arc::new(SignalState::new()),
        }
    }

    pub fn state(&self) -> Arc<SignalState> {
        Arc::clone(&self.state)
    }

    /// Install the process signal handler.
    ///
    /// Must be called at most once per process.
    pub fn install(&self) -> Result<(), ctrlc::Error> {
        let state = Arc::clone(&self.state);
        ctrlc::set_handler(move || match state.handle_signal() {
            SignalAction::InitiateCancellation => {
                let suite = state.running_suite().unwrap_or_else(|| "none".to_string());
                eprintln!("\nReceived interrupt (running suite: {}), cleaning up...", suite);
            }
            SignalAction::ImmediateExit => {
                eprintln!("\nReceived second interrupt, killing suite without grace period...");
            }
            SignalAction::Ignore => {}
        })
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
