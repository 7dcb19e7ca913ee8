//! Retry policy for workflow steps.
//!
//! Stateless: the engine asks the policy how many attempts a step gets and
//! how long to wait after each failed one.

use std::time::Duration;

/// How a step is retried after a failed attempt.
///
/// A step runs at most `retry_count + 1` times. The wait after failed
/// attempt `n` (1-based) is `retry_delay * backoff_multiplier^(n-1)`,
/// capped at `max_delay` when set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    /// Run once, never retry.
    pub fn none() -> Self {
        Self {
            retry_count: 0,
            retry_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: None,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            retry_count,
            retry_delay,
            ..Self::none()
        }
    }

    /// Exponential backoff starting at `retry_delay`.
    pub fn exponential(retry_count: u32, retry_delay: Duration, multiplier: f64) -> Self {
        Self {
            retry_count,
            retry_delay,
            backoff_multiplier: multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry_count.saturating_add(1)
    }

    /// Whether another attempt follows failed attempt `attempt` (1-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Wait before the attempt after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_multiplier.max(1.0).powi(exponent);
        let secs = self.retry_delay.as_secs_f64() * factor;
        let delay = if secs.is_finite() && secs < u64::MAX as f64 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::MAX
        };
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}
