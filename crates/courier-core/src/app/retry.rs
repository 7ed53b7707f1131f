//! Retry policy: decides backoff delays.

use std::time::Duration;

/// Exponential backoff used for executor retries and broker reconnects.
///
/// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Extra attempts allowed after the first. 0 = never retry.
    pub max_retries: u32,

    /// Base delay for the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }

    /// Never retry.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Backoff for an unreachable broker: retried forever, capped at `max_delay`.
    pub fn reconnect(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: u32::MAX,
            base_delay,
            multiplier: 2.0,
            max_delay,
        }
    }

    /// Is another attempt allowed after `attempts` have been made?
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }

    /// Delay before the next attempt, `attempts` being the number already made (1-indexed).
    ///
    /// With base_delay=2s, multiplier=2.0: 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
