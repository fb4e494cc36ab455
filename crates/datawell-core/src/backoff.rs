//! Exponential backoff schedule.

use std::time::Duration;

/// Exponent ceiling so `2^(attempt-1)` stays within `u32`.
const MAX_EXPONENT: u32 = 31;

/// Delay before retry `attempt`: `base * 2^(attempt-1)`, capped at `cap`.
///
/// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base.
/// Attempt 0 is the initial call and never waits.
pub fn exponential_delay(base: Duration, attempt: u32, cap: Option<Duration>) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exponent = (attempt - 1).min(MAX_EXPONENT);
    let delay = base.saturating_mul(1u32 << exponent);
    match cap {
        Some(cap) => delay.min(cap),
        None => delay,
    }
}

/// Retry budget and backoff bounds for batch writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// `None` = unlimited retries, `Some(0)` = retries disabled.
    max_attempts: Option<u32>,
    init_delay: Duration,
    /// `None` = no cap.
    max_delay: Option<Duration>,
}

impl RetryConfig {
    /// Build from raw settings.
    ///
    /// * `max_attempts` < 0 means unlimited, 0 disables retrying.
    /// * `init_delay_secs` <= 0 is coerced to 1 second.
    /// * `max_delay_secs` < 0 means no cap; 0 disables sleeping entirely.
    pub fn new(max_attempts: i64, init_delay_secs: i64, max_delay_secs: i64) -> Self {
        let max_attempts = if max_attempts < 0 {
            None
        } else {
            Some(u32::try_from(max_attempts).unwrap_or(u32::MAX))
        };
        let init_delay = if init_delay_secs > 0 {
            Duration::from_secs(init_delay_secs.unsigned_abs())
        } else {
            Duration::from_secs(1)
        };
        let max_delay = if max_delay_secs >= 0 {
            Some(Duration::from_secs(max_delay_secs.unsigned_abs()))
        } else {
            None
        };

        Self {
            max_attempts,
            init_delay,
            max_delay,
        }
    }

    #[must_use]
    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    #[must_use]
    pub fn init_delay(&self) -> Duration {
        self.init_delay
    }

    #[must_use]
    pub fn max_delay(&self) -> Option<Duration> {
        self.max_delay
    }

    /// True once `attempt` retries exceed the budget.
    #[must_use]
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempt > max)
    }

    /// Delay to wait before retry `attempt`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.init_delay, attempt, self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(1, 1, 60)
    }
}
