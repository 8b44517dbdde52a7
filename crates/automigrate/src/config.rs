//! Migration engine configuration.
//!
//! Every struct here has `DEFAULT_*` backed `Default` impls and `with_*`
//! builders, and deserializes from JSON with missing fields defaulted.
//! Durations are written as integer milliseconds.

use crate::lock::LockConfig;
use crate::migration::plan::GeneratorOptions;
use crate::migration::MigrationError;
use crate::schema::ColumnDefault;
use crate::space::DEFAULT_MIN_RESERVE_BYTES;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default lock key for schema migrations.
pub const DEFAULT_LOCK_KEY: &str = "schema_migration";

/// Which migrations an engine run may apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationMode {
    /// Apply everything, asking for confirmation where required.
    #[default]
    Auto,
    /// Apply SAFE migrations only (MEDIUM when allowed).
    Safe,
    /// Generate and report the plan, apply nothing.
    DryRun,
}

impl fmt::Display for MigrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationMode::Auto => write!(f, "auto"),
            MigrationMode::Safe => write!(f, "safe"),
            MigrationMode::DryRun => write!(f, "dry_run"),
        }
    }
}

impl FromStr for MigrationMode {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "auto" => Ok(MigrationMode::Auto),
            "safe" => Ok(MigrationMode::Safe),
            "dry_run" | "dryrun" => Ok(MigrationMode::DryRun),
            other => Err(MigrationError::Config {
                message: format!("unknown migration mode '{other}'"),
            }),
        }
    }
}

/// Migration engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Which migrations may be applied.
    pub mode: MigrationMode,

    /// In safe mode, also apply MEDIUM migrations.
    pub allow_medium_in_safe_mode: bool,

    /// Take the distributed lock before mutating anything.
    pub use_lock: bool,

    /// Lock key.
    pub lock_key: String,

    /// Lock timing.
    pub lock: LockConfig,

    /// Check free disk space before table rebuilds.
    pub check_disk_space: bool,

    /// Free space kept in reserve after a rebuild, in bytes.
    pub min_free_space_bytes: u64,

    /// Report tables missing from the target as drops.
    pub report_table_drops: bool,

    /// Schema version passed to hooks; hooks bound to another version are skipped.
    pub schema_version: Option<String>,

    /// Generator options such as backfills.
    pub generator: GeneratorOptions,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            mode: MigrationMode::Auto,
            allow_medium_in_safe_mode: false,
            use_lock: true,
            lock_key: DEFAULT_LOCK_KEY.to_string(),
            lock: LockConfig::default(),
            check_disk_space: true,
            min_free_space_bytes: DEFAULT_MIN_RESERVE_BYTES,
            report_table_drops: false,
            schema_version: None,
            generator: GeneratorOptions::default(),
        }
    }
}

impl MigrationConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Plan-only configuration.
    pub fn dry_run() -> Self {
        Self::default().with_mode(MigrationMode::DryRun)
    }

    /// Parse a JSON configuration; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, MigrationError> {
        let config: Self = serde_json::from_str(json).map_err(|e| MigrationError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for contradictions.
    pub fn validate(&self) -> Result<(), MigrationError> {
        if self.use_lock && self.lock_key.trim().is_empty() {
            return Err(MigrationError::Config {
                message: "lock_key must not be empty when locking is enabled".to_string(),
            });
        }
        if self.lock.poll_interval.is_zero() {
            return Err(MigrationError::Config {
                message: "lock.poll_interval must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Set the mode.
    pub fn with_mode(mut self, mode: MigrationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Allow MEDIUM migrations in safe mode.
    pub fn with_medium_in_safe_mode(mut self, allow: bool) -> Self {
        self.allow_medium_in_safe_mode = allow;
        self
    }

    /// Enable or disable locking.
    pub fn with_lock(mut self, use_lock: bool) -> Self {
        self.use_lock = use_lock;
        self
    }

    /// Set the lock key.
    pub fn with_lock_key(mut self, key: impl Into<String>) -> Self {
        self.lock_key = key.into();
        self
    }

    /// Set the lock acquisition timeout.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock.timeout = timeout;
        self
    }

    /// Replace the lock configuration.
    pub fn with_lock_config(mut self, lock: LockConfig) -> Self {
        self.lock = lock;
        self
    }

    /// Enable or disable the disk space pre-flight.
    pub fn with_disk_space_check(mut self, enabled: bool) -> Self {
        self.check_disk_space = enabled;
        self
    }

    /// Set the free space reserve.
    pub fn with_min_free_space(mut self, bytes: u64) -> Self {
        self.min_free_space_bytes = bytes;
        self
    }

    /// Report dropped tables.
    pub fn with_table_drops(mut self, enabled: bool) -> Self {
        self.report_table_drops = enabled;
        self
    }

    /// Set the schema version given to hooks.
    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    /// Backfill `table.column` with `value` when it is added NOT NULL.
    pub fn with_backfill(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        value: ColumnDefault,
    ) -> Self {
        self.generator = self.generator.with_backfill(table, column, value);
        self
    }
}

/// Serde adapter for a [`Duration`] stored as milliseconds.
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde adapter for an optional [`Duration`] stored as milliseconds.
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MigrationConfig::default();
        assert_eq!(config.mode, MigrationMode::Auto);
        assert!(config.use_lock);
        assert_eq!(config.lock_key, DEFAULT_LOCK_KEY);
        assert!(config.check_disk_space);
        assert!(!config.allow_medium_in_safe_mode);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = MigrationConfig::new()
            .with_mode(MigrationMode::Safe)
            .with_medium_in_safe_mode(true)
            .with_lock_key("app")
            .with_lock_timeout(Duration::from_secs(5))
            .with_schema_version("v2")
            .with_backfill("users", "email", ColumnDefault::Text(String::new()));

        assert_eq!(config.mode, MigrationMode::Safe);
        assert!(config.allow_medium_in_safe_mode);
        assert_eq!(config.lock_key, "app");
        assert_eq!(config.lock.timeout, Duration::from_secs(5));
        assert_eq!(config.schema_version.as_deref(), Some("v2"));
        assert_eq!(config.generator.backfills.len(), 1);
    }

    #[test]
    fn test_from_json() {
        let config = MigrationConfig::from_json(
            r#"{
                "mode": "dry_run",
                "lock": {"timeout": 1500},
                "generator": {"backfills": [
                    {"table": "users", "column": "active", "value": {"Bool": true}}
                ]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.mode, MigrationMode::DryRun);
        assert_eq!(config.lock.timeout, Duration::from_millis(1500));
        assert_eq!(config.lock_key, DEFAULT_LOCK_KEY);
        assert_eq!(
            config.generator.backfills[0].value,
            ColumnDefault::Bool(true)
        );
    }

    #[test]
    fn test_invalid_config() {
        assert!(matches!(
            MigrationConfig::from_json(r#"{"lock_key": " "}"#),
            Err(MigrationError::Config { .. })
        ));
        assert!(matches!(
            MigrationConfig::from_json(r#"{"mode": "yolo"}"#),
            Err(MigrationError::Config { .. })
        ));
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("DRY-RUN".parse::<MigrationMode>().unwrap(), MigrationMode::DryRun);
        assert_eq!(MigrationMode::Safe.to_string(), "safe");
        assert!("other".parse::<MigrationMode>().is_err());
    }

    #[test]
    fn test_duration_round_trip() {
        let json = serde_json::to_string(&LockConfig::default()).unwrap();
        assert!(json.contains("\"timeout\":30000"));
        assert!(json.contains("\"stale_after\":null"));
        let back: LockConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, LockConfig::default());
    }
}
