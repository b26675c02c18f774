//! Backoff policy for in-run item retries.

use rand::random;
use std::time::Duration;

/// Exponential backoff with jitter between retries of one item.
///
/// Attempt numbering follows the durable counter: `delay_for(1)` is the wait
/// after the first recorded failure.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let exp_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_delay_ms);
        // Up to 25% jitter keeps simultaneous retries from stampeding.
        let jitter_ms = random::<u64>() % (exp_ms / 4 + 1);
        Duration::from_millis((exp_ms + jitter_ms).min(self.max_delay_ms))
    }
}
