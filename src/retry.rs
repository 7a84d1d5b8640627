//! Retry decisions for failed analysis attempts

use crate::config::RetryConfig;
use crate::error::ErrorKind;
use std::time::Duration;

/// What to do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again once the delay has passed
    RetryAfter(Duration),
    /// Stop and fall back
    GiveUp,
}

/// Decides whether a failed analysis is worth another attempt
///
/// Capacity and transport problems (rate limits, timeouts, network failures)
/// are retried with exponential backoff up to `max_attempts`. Credential and
/// format errors never are. Unknown failures get exactly one more try.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide after `attempts` attempts, the last of which failed with `kind`
    pub fn decide(&self, attempts: u32, kind: ErrorKind) -> RetryDecision {
        let limit = match kind {
            kind if kind.is_transient() => self.max_attempts,
            ErrorKind::Unknown => self.max_attempts.min(2),
            _ => return RetryDecision::GiveUp,
        };

        if attempts >= limit {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.backoff(attempts))
        }
    }

    /// base × 2^(attempts-1), capped at max_delay
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
