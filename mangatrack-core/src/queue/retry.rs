use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry/backoff policy shared by all queues.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u16,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Percentage-based jitter to spread out retries.
    pub jitter_ratio: f32,
    /// Minimum jitter in milliseconds so short delays still randomise a bit.
    pub jitter_min_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            backoff_base_ms: 2_000,
            backoff_max_ms: 5 * 60 * 1_000,
            jitter_ratio: 0.25,
            jitter_min_ms: 250,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with jitter for the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u16) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16) as u32;
        let base = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent))
            .min(self.backoff_max_ms);
        let jitter_span = ((base as f64) * f64::from(self.jitter_ratio)) as u64;
        let jitter_span = jitter_span.max(self.jitter_min_ms);
        let jitter = rand::rng().random_range(0..=jitter_span);
        Duration::from_millis(base.saturating_add(jitter).min(self.backoff_max_ms))
    }
}
