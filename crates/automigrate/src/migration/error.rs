//! Migration-specific error types.

use crate::backend::ExecutorError;
use crate::schema::IntrospectionError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Risk level of a schema change or migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    /// Additive, no data loss, no table rewrite.
    /// Examples: new tables, nullable or defaulted columns.
    Safe,
    /// May fail on existing data or needs attention.
    /// Examples: NOT NULL columns without default, new constraints.
    Medium,
    /// Rewrites or destroys data.
    /// Examples: dropped columns/tables, type changes.
    High,
}

impl RiskLevel {
    /// Stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "SAFE",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SAFE" => Ok(RiskLevel::Safe),
            "MEDIUM" => Ok(RiskLevel::Medium),
            "HIGH" => Ok(RiskLevel::High),
            other => Err(MigrationError::Storage {
                message: format!("unknown risk level '{other}'"),
            }),
        }
    }
}

/// Pipeline stage an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Reading the live schema.
    Detection,
    /// Grading changes.
    Classification,
    /// Building the plan.
    Generation,
    /// Acquiring or releasing the migration lock.
    Locking,
    /// Disk space pre-flight.
    Preflight,
    /// Running migration SQL.
    Execution,
    /// Reading or writing migration history.
    Recording,
    /// Invalid configuration or registration.
    Configuration,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Detection => "detection",
            Stage::Classification => "classification",
            Stage::Generation => "generation",
            Stage::Locking => "locking",
            Stage::Preflight => "preflight",
            Stage::Execution => "execution",
            Stage::Recording => "recording",
            Stage::Configuration => "configuration",
        };
        f.write_str(name)
    }
}

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// The live schema could not be read.
    #[error("schema detection failed: {0}")]
    Detection(#[from] IntrospectionError),

    /// No classification rule covers the change.
    #[error("no risk rule for {kind} on table '{table}'")]
    UnknownChangeKind {
        /// The change kind.
        kind: String,
        /// The table of the change.
        table: String,
    },

    /// A plan could not be generated.
    #[error("cannot generate migration for table '{table}': {reason}")]
    Generation {
        /// The table involved.
        table: String,
        /// Why generation failed.
        reason: String,
    },

    /// Not enough free disk space for a table rewrite.
    #[error("insufficient disk space: {required} bytes required, {available} bytes available")]
    InsufficientSpace {
        /// Bytes required.
        required: u64,
        /// Bytes available after the reserve.
        available: u64,
    },

    /// The migration lock could not be acquired in time.
    #[error("timed out after {timeout_ms}ms waiting for migration lock '{key}'")]
    LockTimeout {
        /// Lock key.
        key: String,
        /// Timeout in milliseconds.
        timeout_ms: u64,
    },

    /// The lock backend failed.
    #[error("lock error: {message}")]
    Lock {
        /// Error message.
        message: String,
    },

    /// A migration statement failed.
    #[error("migration {migration_id} failed at `{statement}`: {message}")]
    Execution {
        /// The failing migration.
        migration_id: String,
        /// The failing statement.
        statement: String,
        /// Database error text.
        message: String,
    },

    /// Execution was cancelled between migrations.
    #[error("migration cancelled after {applied} applied migration(s)")]
    Cancelled {
        /// Migrations applied before cancellation.
        applied: usize,
    },

    /// Migration history could not be read or written.
    #[error("migration storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// A hook could not be registered.
    #[error("hook registration failed: {message}")]
    Hook {
        /// Error message.
        message: String,
    },

    /// A referenced migration does not exist.
    #[error("migration not found: {version}")]
    NotFound {
        /// The requested version.
        version: String,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {message}")]
    Config {
        /// Error message.
        message: String,
    },

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// Pipeline stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            MigrationError::Detection(_) => Stage::Detection,
            MigrationError::UnknownChangeKind { .. } => Stage::Classification,
            MigrationError::Generation { .. } => Stage::Generation,
            MigrationError::InsufficientSpace { .. } => Stage::Preflight,
            MigrationError::LockTimeout { .. } | MigrationError::Lock { .. } => Stage::Locking,
            MigrationError::Execution { .. } | MigrationError::Cancelled { .. } => {
                Stage::Execution
            }
            MigrationError::Storage { .. } | MigrationError::NotFound { .. } => Stage::Recording,
            MigrationError::Hook { .. } | MigrationError::Config { .. } => Stage::Configuration,
            MigrationError::Io(_) => Stage::Locking,
        }
    }

    /// Wrap a history-table failure.
    pub(crate) fn storage(e: impl std::fmt::Display) -> Self {
        MigrationError::Storage {
            message: e.to_string(),
        }
    }

    /// Wrap a lock backend failure.
    pub(crate) fn lock(e: impl std::fmt::Display) -> Self {
        MigrationError::Lock {
            message: e.to_string(),
        }
    }

    /// Build an execution error from an executor failure.
    pub(crate) fn execution(migration_id: &str, fallback_sql: &str, e: ExecutorError) -> Self {
        match e {
            ExecutorError::Statement { sql, message, .. } => MigrationError::Execution {
                migration_id: migration_id.to_string(),
                statement: sql,
                message,
            },
            other => MigrationError::Execution {
                migration_id: migration_id.to_string(),
                statement: fallback_sql.to_string(),
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Safe < RiskLevel::Medium);
        assert!(RiskLevel::Medium < RiskLevel::High);
        assert_eq!(
            [RiskLevel::High, RiskLevel::Safe, RiskLevel::Medium].iter().max(),
            Some(&RiskLevel::High)
        );
    }

    #[test]
    fn test_risk_level_text() {
        assert_eq!(RiskLevel::Medium.to_string(), "MEDIUM");
        assert_eq!("high".parse::<RiskLevel>().unwrap(), RiskLevel::High);
        assert!("extreme".parse::<RiskLevel>().is_err());
        assert_eq!(serde_json::to_string(&RiskLevel::Safe).unwrap(), "\"SAFE\"");
    }

    #[test]
    fn test_error_stage() {
        let err = MigrationError::LockTimeout {
            key: "schema_migration".into(),
            timeout_ms: 100,
        };
        assert_eq!(err.stage(), Stage::Locking);
        assert!(err.to_string().contains("schema_migration"));

        let err = MigrationError::Detection(IntrospectionError::Query("boom".into()));
        assert_eq!(err.stage(), Stage::Detection);
    }

    #[test]
    fn test_execution_error_keeps_failing_statement() {
        let err = MigrationError::execution(
            "00000000000000000001_000",
            "BEGIN",
            ExecutorError::Statement {
                index: 1,
                sql: "DROP TABLE users".into(),
                message: "no such table: users".into(),
            },
        );
        assert_eq!(err.stage(), Stage::Execution);
        let text = err.to_string();
        assert!(text.contains("DROP TABLE users"));
        assert!(text.contains("no such table"));
    }
}
