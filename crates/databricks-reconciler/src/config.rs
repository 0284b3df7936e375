//! Reconciler tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reconciler and dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,

    /// Delay between observations of a resource that is not ready yet
    #[serde(with = "seconds")]
    pub poll_interval: Duration,

    /// Delay between observations of a ready resource, and period of the
    /// full resync
    #[serde(with = "positive_seconds")]
    pub resync_interval: Duration,

    /// Deadline of a single Databricks call
    #[serde(with = "positive_seconds")]
    pub call_timeout: Duration,

    /// First retry delay
    #[serde(with = "seconds")]
    pub backoff_base: Duration,

    /// Upper bound of a retry delay
    #[serde(with = "seconds")]
    pub backoff_cap: Duration,

    /// Consecutive retryable failures before giving up
    pub max_attempts: u32,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(10),
            resync_interval: Duration::from_secs(300),
            call_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
            max_attempts: 8,
        }
    }
}

impl ReconcilerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration, max_attempts: u32) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self.max_attempts = max_attempts;
        self
    }
}

/// Durations as (fractional) seconds
mod seconds {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Like [`seconds`], rejecting zero
mod positive_seconds {
    use serde::{Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        super::seconds::serialize(value, serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = super::seconds::deserialize(deserializer)?;
        if value.is_zero() {
            return Err(serde::de::Error::custom("duration must be greater than zero"));
        }
        Ok(value)
    }
}
