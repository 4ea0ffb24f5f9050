//! Exponential-backoff retry policy.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff schedule: `base_ms * factor^attempt`, capped, optionally with
/// ±20% uniform jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub factor: f64,
    pub cap_ms: u64,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl RetryPolicy {
    /// Webhook delivery policy: 200ms base, x2, 30s cap, 5 attempts.
    pub fn webhook() -> Self {
        Self {
            base_ms: 200,
            factor: 2.0,
            cap_ms: 30_000,
            max_attempts: 5,
            jitter: true,
        }
    }

    /// Workflow block retry policy: 200ms base, x2, 5s cap.
    pub fn block(max_attempts: u32) -> Self {
        Self {
            base_ms: 200,
            factor: 2.0,
            cap_ms: 5_000,
            max_attempts,
            jitter: false,
        }
    }

    /// Delay before the given retry. `attempt` is zero-based: the delay
    /// preceding the first retry is `base_ms`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let raw = self.base_ms as f64 * self.factor.powi(attempt as i32);
        let capped = raw.min(self.cap_ms as f64);
        let with_jitter = if self.jitter {
            let noise = rand::thread_rng().gen_range(-0.2..=0.2);
            (capped * (1.0 + noise)).max(0.0)
        } else {
            capped
        };
        Duration::from_millis(with_jitter as u64)
    }

    /// Iterate the full schedule.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_attempts).map(|i| self.delay(i))
    }
}
