//! Distributed migration lock.
//!
//! Only the lock holder may change the schema or write migration history.
//! Two providers are available:
//!
//! | Provider | Backing | Atomic step |
//! |----------|---------|-------------|
//! | [`FileLock`] | `<dir>/<key>.lock` | `create_new` open |
//! | [`TableLock`] | `_migration_locks` row | `INSERT ... ON CONFLICT DO NOTHING` |
//!
//! A lock older than [`LockConfig::stale_threshold`] is considered abandoned
//! and is reclaimed with a warning.

pub mod file;
pub mod table;

pub use file::FileLock;
pub use table::{TableLock, LOCKS_TABLE};

use crate::migration::MigrationError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::warn;

/// Default time to wait for the lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default expected duration of a migration run.
pub const DEFAULT_EXPECTED_MIGRATION_DURATION: Duration = Duration::from_secs(60);

/// A lock is stale after this many expected migration durations.
pub const STALE_MULTIPLIER: u32 = 5;

/// Lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Time to wait for the lock.
    #[serde(with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Delay between attempts.
    #[serde(with = "crate::config::duration_ms")]
    pub poll_interval: Duration,
    /// Expected duration of a migration run.
    #[serde(with = "crate::config::duration_ms")]
    pub expected_migration_duration: Duration,
    /// Explicit staleness threshold.
    #[serde(with = "crate::config::option_duration_ms")]
    pub stale_after: Option<Duration>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_LOCK_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            expected_migration_duration: DEFAULT_EXPECTED_MIGRATION_DURATION,
            stale_after: None,
        }
    }
}

impl LockConfig {
    /// Set the acquisition timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the expected migration duration.
    pub fn with_expected_migration_duration(mut self, duration: Duration) -> Self {
        self.expected_migration_duration = duration;
        self
    }

    /// Set an explicit staleness threshold.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    /// Age after which a held lock is considered abandoned.
    pub fn stale_threshold(&self) -> Duration {
        self.stale_after
            .unwrap_or(self.expected_migration_duration * STALE_MULTIPLIER)
    }
}

/// Who holds a lock and since when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Holder id.
    pub holder_id: String,
    /// Acquisition time, milliseconds since the Unix epoch.
    pub acquired_at: i64,
    /// Process id of the holder.
    pub pid: u32,
}

impl LockRecord {
    /// Record for the current process and time.
    pub fn new(holder_id: impl Into<String>) -> Self {
        Self {
            holder_id: holder_id.into(),
            acquired_at: now_millis(),
            pid: std::process::id(),
        }
    }

    /// Age of the lock.
    pub fn age(&self) -> Duration {
        let elapsed = now_millis().saturating_sub(self.acquired_at).max(0);
        Duration::from_millis(elapsed as u64)
    }

    /// Whether the lock is older than `threshold`.
    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.age() > threshold
    }
}

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// New unique holder id.
pub(crate) fn new_holder_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// A named, exclusive, cross-process lock.
pub trait LockProvider: Send + Sync {
    /// Try to take the lock, waiting at most `timeout`.
    ///
    /// Returns `Ok(false)` on timeout. A zero timeout makes a single attempt.
    fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MigrationError>;

    /// Release the lock. Returns whether this holder held it.
    fn release(&self, key: &str) -> Result<bool, MigrationError>;

    /// Unique id of this provider instance.
    fn holder_id(&self) -> &str;
}

/// Repeat `attempt` every `interval` until it succeeds or `timeout` passes.
pub(crate) fn poll_until<F>(
    timeout: Duration,
    interval: Duration,
    mut attempt: F,
) -> Result<bool, MigrationError>
where
    F: FnMut() -> Result<bool, MigrationError>,
{
    let start = Instant::now();
    loop {
        if attempt()? {
            return Ok(true);
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Ok(false);
        }
        std::thread::sleep(interval.min(timeout - elapsed));
    }
}

/// Holds a lock and releases it when dropped.
pub struct LockGuard<'a> {
    provider: &'a dyn LockProvider,
    key: String,
    released: bool,
}

impl<'a> LockGuard<'a> {
    /// Acquire `key`, failing with [`MigrationError::LockTimeout`].
    pub fn acquire(
        provider: &'a dyn LockProvider,
        key: &str,
        timeout: Duration,
    ) -> Result<Self, MigrationError> {
        if provider.acquire(key, timeout)? {
            Ok(Self {
                provider,
                key: key.to_string(),
                released: false,
            })
        } else {
            Err(MigrationError::LockTimeout {
                key: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
    }

    /// Lock key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release explicitly, reporting errors.
    pub fn release(mut self) -> Result<bool, MigrationError> {
        self.released = true;
        self.provider.release(&self.key)
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.provider.release(&self.key) {
                warn!(key = %self.key, error = %e, "Failed to release migration lock");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_stale_threshold() {
        let config = LockConfig::default();
        assert_eq!(config.stale_threshold(), Duration::from_secs(300));
        let config = config.with_stale_after(Duration::from_secs(1));
        assert_eq!(config.stale_threshold(), Duration::from_secs(1));
    }

    #[test]
    fn test_record_staleness() {
        let mut record = LockRecord::new("me");
        assert!(!record.is_stale(Duration::from_secs(1)));
        record.acquired_at -= 10_000;
        assert!(record.is_stale(Duration::from_secs(1)));
    }

    #[test]
    fn test_poll_until_times_out() {
        let mut attempts = 0;
        let start = Instant::now();
        let acquired = poll_until(Duration::from_millis(50), Duration::from_millis(10), || {
            attempts += 1;
            Ok(false)
        })
        .unwrap();

        assert!(!acquired);
        assert!(attempts >= 2);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_zero_timeout_is_single_attempt() {
        let mut attempts = 0;
        let acquired = poll_until(Duration::ZERO, Duration::from_millis(10), || {
            attempts += 1;
            Ok(false)
        })
        .unwrap();
        assert!(!acquired);
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_config_from_json() {
        let config: LockConfig =
            serde_json::from_str(r#"{"timeout": 250, "stale_after": 1000}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
        assert_eq!(config.stale_after, Some(Duration::from_secs(1)));
        assert_eq!(config.poll_interval, DEFAULT_POLL_INTERVAL);
    }
}
