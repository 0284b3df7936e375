//! Capped exponential backoff

use crate::ReconcilerConfig;
use std::time::Duration;

/// `min(base * 2^(attempt - 1), cap)`, bounded by a maximum attempt count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            max_attempts,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }

    /// Whether `attempts` failures exhaust the retry budget
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl From<&ReconcilerConfig> for Backoff {
    fn from(config: &ReconcilerConfig) -> Self {
        Self::new(config.backoff_base, config.backoff_cap, config.max_attempts)
    }
}
