//! Reconnection policy
//!
//! Pure delay/give-up arithmetic. The channel driver schedules the actual
//! timers; nothing here does I/O or keeps state between calls, so the whole
//! policy is testable as a table of `(attempt, expected_delay)` pairs.

use std::time::Duration;

/// Exponential backoff with a ceiling and a give-up bound.
///
/// `next_delay(n) = min(base_delay * 2^(n-1), max_delay)` for 1-based
/// attempt numbers. Defaults: 1s base, 30s ceiling, give up after 10
/// attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1)
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.max(1) - 1;
        if exp >= 32 {
            return self.max_delay;
        }
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// True once `attempt` exceeds the configured maximum
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
