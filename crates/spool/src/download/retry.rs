// Segment retry policy: exponential backoff with proportional jitter.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};

use crate::config::RetryConfig;

/// Decides whether a failed segment attempt is retried and how long to wait.
///
/// Attempts are counted from 1: after the first failed try the caller asks
/// `should_retry(1)` and then waits `next_delay(1)`, twice the base delay.
/// With a fixed seed the delay sequence is reproducible.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_ratio: f64,
    rng: Arc<Mutex<StdRng>>,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        let seed = config.seed.unwrap_or_else(rand::random);
        let jitter_ratio = if config.jitter_ratio.is_finite() {
            config.jitter_ratio.max(0.0)
        } else {
            0.0
        };
        Self {
            max_attempts: config.max_attempts,
            base_delay: config.base_delay,
            max_delay: config.max_delay.max(config.base_delay),
            jitter_ratio,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Delay before the next attempt, always within `[base_delay, max_delay]`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        // 2^attempt via a checked shift so large attempts saturate at max_delay.
        let raw = 1u32
            .checked_shl(attempt)
            .and_then(|multiplier| self.base_delay.checked_mul(multiplier))
            .unwrap_or(self.max_delay);
        if raw >= self.max_delay {
            return self.max_delay;
        }

        let jitter_limit_ms = (raw.as_millis() as f64 * self.jitter_ratio) as u64;
        if jitter_limit_ms == 0 {
            return raw;
        }
        let jitter_ms = self.rng.lock().random_range(0..=jitter_limit_ms);
        (raw + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
