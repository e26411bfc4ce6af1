//! RetryPolicy - リトライ間隔の決定

use std::time::Duration;

/// Exponential backoff for failed executions, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    pub multiplier: f64,

    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, given attempts already made (1-based).
    ///
    /// `base_delay * multiplier^(attempts - 1)`, never above `max_delay`:
    /// with the defaults 2s, 4s, 8s, ... 512s, 600s, 600s.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !delay_secs.is_finite() || delay_secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(delay_secs.max(0.0))
        }
    }
}
