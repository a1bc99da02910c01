use std::time::Duration;

use crate::models::prediction::PredictionError;

/// Outcome of consulting the retry policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    GiveUp,
}

/// Bounded retry with deterministic exponential backoff.
///
/// Shared by every item of a job. Permanent failures give up immediately,
/// whatever the attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(500), Duration::from_secs(8))
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first call; values below 1 are raised to 1.
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decide what to do after `attempts` calls, the last of which failed with `error`.
    pub fn decide(&self, attempts: u32, error: &PredictionError) -> RetryDecision {
        if !error.is_transient() || attempts >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry {
            delay: self.delay_for(attempts),
        }
    }

    /// base * 2^(attempts - 1), capped at `max_delay`.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}
