//! Backoff schedule for retried storage steps.
//!
//! Only the arithmetic lives here. The loops that sleep between attempts sit
//! next to the operations they retry, since each decides for itself which
//! errors are transient.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with symmetric jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in ms.
    pub base_delay_ms: u64,
    /// Ceiling on the un-jittered delay, in ms.
    pub max_delay_ms: u64,
    /// Fraction of the delay added or removed at random, `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Whether a step that has already been retried `attempt` times may go again.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// `min(max_delay, base * 2^attempt)` before jitter.
    #[must_use]
    pub fn capped_delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(1u64 << attempt.min(31))
            .min(self.max_delay_ms)
    }

    /// Delay before retry number `attempt` (zero-based). `random` in
    /// `[0.0, 1.0)` maps onto `[-jitter, +jitter]` around the capped delay.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn delay(&self, attempt: u32, random: f64) -> Duration {
        let jitter = 1.0 + (random.clamp(0.0, 1.0) * 2.0 - 1.0) * self.jitter_factor;
        let ms = (self.capped_delay_ms(attempt) as f64 * jitter).round().max(0.0);
        Duration::from_millis(ms as u64)
    }
}
