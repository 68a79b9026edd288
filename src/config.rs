use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const DEFAULT_APPEND_ATTEMPTS: u32 = 5;
const DEFAULT_APPEND_BACKOFF_MS: u64 = 10;
const DEFAULT_APPEND_MAX_BACKOFF_MS: u64 = 1_000;
const DEFAULT_DEAD_LETTER_BACKOFF_MS: u64 = 1_000;
const DEFAULT_DEAD_LETTER_MAX_BACKOFF_MS: u64 = 60_000;
const DEFAULT_SNAPSHOT_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SNAPSHOT_MIN_OPERATIONS: u64 = 10_000;
const DEFAULT_RECLAIM_INTERVAL_MS: u64 = 30_000;
const DEFAULT_FETCH_BATCH: usize = 256;
const DEFAULT_MAX_POP_BATCH: usize = 32;
/// Longest accepted period for background drivers.
const MAX_INTERVAL_MS: u64 = 7 * 24 * 60 * 60 * 1_000;

/// Exponential backoff between attempts of a retryable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves like one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Delay to wait after the `failures`-th consecutive failure (1-based).
    pub fn backoff(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(20);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_APPEND_ATTEMPTS,
            initial_backoff_ms: DEFAULT_APPEND_BACKOFF_MS,
            max_backoff_ms: DEFAULT_APPEND_MAX_BACKOFF_MS,
        }
    }
}

/// When to checkpoint a queue. Any satisfied condition triggers a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPolicy {
    pub interval_ms: Option<u64>,
    /// Operation log records appended since the previous snapshot.
    pub min_operations: Option<u64>,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval_ms: Some(DEFAULT_SNAPSHOT_INTERVAL_MS),
            min_operations: Some(DEFAULT_SNAPSHOT_MIN_OPERATIONS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReclaimConfig {
    pub enabled: bool,
    pub interval_ms: u64,
}

impl Default for ReclaimConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_RECLAIM_INTERVAL_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReviveConfig {
    /// Threads draining expired timers.
    pub workers: usize,
    /// Backoff before retrying a failed dead-letter send. `max_attempts` is
    /// ignored: the message stays inflight until the send succeeds.
    pub dead_letter_retry: RetryPolicy,
}

impl Default for ReviveConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            dead_letter_retry: RetryPolicy {
                max_attempts: 0,
                initial_backoff_ms: DEFAULT_DEAD_LETTER_BACKOFF_MS,
                max_backoff_ms: DEFAULT_DEAD_LETTER_MAX_BACKOFF_MS,
            },
        }
    }
}

/// Configuration of a [`crate::MessageStore`] and the services it wires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Retry policy for operation log appends that fail with `Unavailable`.
    pub append_retry: RetryPolicy,
    pub snapshot: SnapshotPolicy,
    pub reclaim: ReclaimConfig,
    pub revive: ReviveConfig,
    /// Records requested per stream fetch.
    pub fetch_batch: usize,
    /// Upper bound on `pop` batch sizes.
    pub max_pop_batch: usize,
    /// Residual visibility granted to inflight messages found during recovery.
    pub recovery_rearm_delay_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            append_retry: RetryPolicy::default(),
            snapshot: SnapshotPolicy::default(),
            reclaim: ReclaimConfig::default(),
            revive: ReviveConfig::default(),
            fetch_batch: DEFAULT_FETCH_BATCH,
            max_pop_batch: DEFAULT_MAX_POP_BATCH,
            recovery_rearm_delay_ms: 0,
        }
    }
}

impl StoreConfig {
    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fetch_batch == 0 {
            return Err(Error::InvalidArgument("fetch_batch must be positive"));
        }
        if self.max_pop_batch == 0 {
            return Err(Error::InvalidArgument("max_pop_batch must be positive"));
        }
        if self.revive.workers == 0 {
            return Err(Error::InvalidArgument("revive.workers must be positive"));
        }
        if self.reclaim.enabled && self.reclaim.interval_ms == 0 {
            return Err(Error::InvalidArgument("reclaim.interval_ms must be positive"));
        }
        if self.reclaim.interval_ms > MAX_INTERVAL_MS {
            return Err(Error::InvalidArgument("reclaim.interval_ms exceeds seven days"));
        }
        if self.snapshot.interval_ms.is_some_and(|ms| ms > MAX_INTERVAL_MS) {
            return Err(Error::InvalidArgument("snapshot.interval_ms exceeds seven days"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff_ms: 10,
            max_backoff_ms: 50,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(64), Duration::from_millis(50));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"fetch_batch": 8, "snapshot": {"interval_ms": null}}"#)
                .unwrap();
        assert_eq!(config.fetch_batch, 8);
        assert_eq!(config.snapshot.interval_ms, None);
        assert_eq!(
            config.snapshot.min_operations,
            Some(DEFAULT_SNAPSHOT_MIN_OPERATIONS)
        );
        assert_eq!(config.append_retry, RetryPolicy::default());
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_zero_workers() {
        let mut config = StoreConfig::default();
        config.revive.workers = 0;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_validate_rejects_unbounded_intervals() {
        let mut config = StoreConfig::default();
        config.reclaim.interval_ms = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        let mut config = StoreConfig::default();
        config.snapshot.interval_ms = Some(MAX_INTERVAL_MS + 1);
        assert!(matches!(config.validate(), Err(Error::InvalidArgument(_))));

        config.snapshot.interval_ms = Some(MAX_INTERVAL_MS);
        config.validate().unwrap();
    }
}
