//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff with a bounded attempt count.
///
/// The delay doubles on every attempt without a cap; the attempt budget is
/// what bounds the cycle.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Attempts made since the last successful open.
    pub attempt_count: u32,
    /// Budget of attempts before the link stays down.
    pub max_attempts: u32,
    /// Delay before attempt 0.
    pub base_interval: Duration,
}

impl ReconnectPolicy {
    pub fn new(base_interval: Duration, max_attempts: u32) -> Self {
        Self {
            attempt_count: 0,
            max_attempts,
            base_interval,
        }
    }

    /// Delay for the n-th attempt: `base_interval * 2^n`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_interval * 2u32.saturating_pow(attempt)
    }

    /// Whether the attempt budget is spent.
    pub fn exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    pub fn reset(&mut self) {
        self.attempt_count = 0;
    }
}
