//! Exponential retry backoff.

use std::time::Duration;

pub const DEFAULT_BASE: Duration = Duration::from_millis(2_000);
pub const DEFAULT_MAX: Duration = Duration::from_millis(30_000);

/// `delay(k) = min(base * 2^(k-1), max)` for the k-th failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE,
            max: DEFAULT_MAX,
        }
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before a job with `attempts` recorded failures is retried.
    /// `attempts` of 0 is treated as 1.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(63);
        let base_ms = self.base.as_millis().min(u64::MAX as u128) as u64;
        let max_ms = self.max.as_millis().min(u64::MAX as u128) as u64;
        let scaled = base_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(scaled.min(max_ms))
    }
}
