//! Shared delay policy for every wait loop in the coordinator.
//!
//! Waiting for a free slot, polling job history, and backing off after a
//! transient poll error all go through [`RetryPolicy`] and
//! [`sleep_or_cancel`], so there is exactly one place that sleeps and
//! exactly one place that honours cancellation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Tunable parameters for a delay sequence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each attempt. `1.0` gives a
    /// fixed interval.
    pub multiplier: f64,
    /// Number of consecutive attempts allowed; `None` means unbounded.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Fixed-interval, unbounded schedule (slot waiting, history polling).
    pub fn fixed(interval: Duration) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            max_attempts: None,
        }
    }

    /// Exponential schedule capped at `max_attempts` consecutive failures.
    pub fn exponential(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            max_attempts: Some(max_attempts),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), Duration::from_secs(30), 5)
    }
}

/// Calculate the next delay from the current delay and policy.
///
/// The result is clamped to [`RetryPolicy::max_delay`].
pub fn next_delay(current: Duration, policy: &RetryPolicy) -> Duration {
    let next_ms = (current.as_millis() as f64 * policy.multiplier) as u64;
    Duration::from_millis(next_ms).min(policy.max_delay)
}

/// Stateful walk through a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            current: policy.initial_delay,
            policy,
            attempts: 0,
        }
    }

    /// Record one more attempt and return the delay to wait before the
    /// next, or `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.policy.max_attempts {
            if self.attempts >= max {
                return None;
            }
        }
        self.attempts += 1;
        let delay = self.current;
        self.current = next_delay(self.current, &self.policy);
        Some(delay)
    }

    /// Consecutive attempts recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start over after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.policy.initial_delay;
        self.attempts = 0;
    }
}

/// Sleep for `delay` unless `cancel` fires first.
///
/// Returns `false` when cancelled.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
