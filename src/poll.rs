//! Blocking condition polling
//!
//! The device has no event channel for "network came up" or "b2g restarted",
//! so readiness is detected by re-evaluating a predicate until it holds.
//! `poll_wait` occupies the calling thread for up to the timeout.

use std::time::{Duration, Instant};

/// Polling cadence and limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    /// Target spacing between predicate evaluations
    pub interval: Duration,
    /// Give up once this much time has passed since the first evaluation
    pub timeout: Duration,
}

impl PollOptions {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Polling errors
#[derive(Debug, thiserror::Error)]
pub enum PollError<E> {
    #[error("condition not met after {elapsed:?} ({attempts} attempts)")]
    Timeout { elapsed: Duration, attempts: u32 },

    #[error(transparent)]
    Predicate(E),
}

impl<E> PollError<E> {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollError::Timeout { .. })
    }
}

/// Evaluate `predicate` until it yields `Some`, or fail with
/// `PollError::Timeout`.
///
/// `after_first` runs once, after the first evaluation came back `None` and
/// before the next one. Callers use it to fire a state-changing command only
/// after confirming the target state was not already reached; the next
/// evaluation still sees a change that raced the command.
///
/// The predicate is always evaluated at least once. Sleeps are shortened by
/// the time the predicate took and never run past the deadline. Errors from
/// the predicate or the callback end the wait immediately.
pub fn poll_wait<T, E, P>(
    mut predicate: P,
    options: PollOptions,
    mut after_first: Option<&mut dyn FnMut() -> Result<(), E>>,
) -> Result<T, PollError<E>>
where
    P: FnMut() -> Result<Option<T>, E>,
{
    let start = Instant::now();
    let deadline = start + options.timeout;
    let mut attempts = 0u32;
    let mut tick = start;

    loop {
        attempts += 1;
        if let Some(value) = predicate().map_err(PollError::Predicate)? {
            return Ok(value);
        }

        if attempts == 1 {
            if let Some(callback) = after_first.as_mut() {
                callback().map_err(PollError::Predicate)?;
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout {
                elapsed: now.duration_since(start),
                attempts,
            });
        }

        let wake = (tick + options.interval).min(deadline);
        std::thread::sleep(wake.saturating_duration_since(now));
        tick = Instant::now();
    }
}

/// `poll_wait` for infallible boolean predicates
pub fn poll_until<P>(mut predicate: P, options: PollOptions) -> Result<(), PollError<std::convert::Infallible>>
where
    P: FnMut() -> bool,
{
    poll_wait(|| Ok(predicate().then_some(())), options, None)
}
