//! Append-only migration history.
//!
//! Every applied, failed or rolled back migration appends one row to the
//! `_migrations` table. Rows are never updated or deleted.

use super::error::{MigrationError, RiskLevel};
use super::sql::placeholder;
use crate::backend::{SqlExecutor, SqlValue};
use crate::schema::Dialect;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Name of the history table.
pub const MIGRATIONS_TABLE: &str = "_migrations";

const COLUMNS: &str = "id, version, description, rollback_sql, risk_level, applied_at, status";

/// Status of a history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryStatus {
    /// The migration was applied.
    Applied,
    /// The migration failed.
    Failed,
    /// The migration was reverted.
    RolledBack,
}

impl HistoryStatus {
    /// Stored text form.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryStatus::Applied => "applied",
            HistoryStatus::Failed => "failed",
            HistoryStatus::RolledBack => "rolled_back",
        }
    }

    fn parse(s: &str) -> Result<Self, MigrationError> {
        match s {
            "applied" => Ok(HistoryStatus::Applied),
            "failed" => Ok(HistoryStatus::Failed),
            "rolled_back" => Ok(HistoryStatus::RolledBack),
            other => Err(MigrationError::storage(format!(
                "unknown history status '{other}'"
            ))),
        }
    }
}

/// One row of migration history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id (insertion order).
    pub id: i64,
    /// Migration version.
    pub version: String,
    /// Description.
    pub description: String,
    /// Statements reverting the migration.
    pub rollback_sql: Vec<String>,
    /// Risk of the migration.
    pub risk_level: RiskLevel,
    /// When the row was written.
    pub applied_at: DateTime<Utc>,
    /// Row status.
    pub status: HistoryStatus,
}

/// History ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryOrder {
    /// Most recent first.
    NewestFirst,
    /// Chronological.
    OldestFirst,
}

/// Migration history store.
pub struct MigrationStorage {
    executor: Arc<dyn SqlExecutor>,
}

impl MigrationStorage {
    /// Create a store over an executor.
    pub fn new(executor: Arc<dyn SqlExecutor>) -> Self {
        Self { executor }
    }

    fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }

    /// Create the history table and its index if missing.
    ///
    /// Idempotent; concurrent callers are safe.
    #[instrument(skip(self))]
    pub fn initialize(&self) -> Result<(), MigrationError> {
        let id_column = match self.dialect() {
            Dialect::Sqlite => "id INTEGER PRIMARY KEY AUTOINCREMENT",
            Dialect::Postgres => "id BIGSERIAL PRIMARY KEY",
            Dialect::MySql => "id BIGINT AUTO_INCREMENT PRIMARY KEY",
        };
        let text = match self.dialect() {
            // MySQL cannot index unbounded TEXT.
            Dialect::MySql => "VARCHAR(64)",
            Dialect::Sqlite | Dialect::Postgres => "TEXT",
        };
        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (\
                 {id_column}, \
                 version {text} NOT NULL, \
                 description TEXT NOT NULL, \
                 rollback_sql TEXT NOT NULL, \
                 risk_level {text} NOT NULL, \
                 applied_at {text} NOT NULL, \
                 status {text} NOT NULL)"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx{MIGRATIONS_TABLE}_applied_at \
                 ON {MIGRATIONS_TABLE} (applied_at)"
            ),
        ];

        for statement in &statements {
            match self.executor.execute(statement, &[]) {
                Ok(_) => {}
                // Lost a creation race with another process.
                Err(e) if e.to_string().contains("already exists") => {
                    debug!(error = %e, "History table created concurrently");
                }
                Err(e) => return Err(MigrationError::storage(e)),
            }
        }
        Ok(())
    }

    fn append(
        &self,
        version: &str,
        description: &str,
        rollback_sql: &[String],
        risk_level: RiskLevel,
        status: HistoryStatus,
    ) -> Result<(), MigrationError> {
        let d = self.dialect();
        let rollback = serde_json::to_string(rollback_sql).map_err(MigrationError::storage)?;
        let applied_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        let sql = format!(
            "INSERT INTO {MIGRATIONS_TABLE} \
             (version, description, rollback_sql, risk_level, applied_at, status) \
             VALUES ({}, {}, {}, {}, {}, {})",
            placeholder(d, 1),
            placeholder(d, 2),
            placeholder(d, 3),
            placeholder(d, 4),
            placeholder(d, 5),
            placeholder(d, 6),
        );
        self.executor
            .execute(
                &sql,
                &[
                    SqlValue::from(version),
                    SqlValue::from(description),
                    SqlValue::Text(rollback),
                    SqlValue::from(risk_level.as_str()),
                    SqlValue::Text(applied_at),
                    SqlValue::from(status.as_str()),
                ],
            )
            .map_err(MigrationError::storage)?;
        debug!(version, status = status.as_str(), "Recorded migration history");
        Ok(())
    }

    /// Record a successfully applied migration.
    pub fn record_migration(
        &self,
        version: &str,
        description: &str,
        rollback_sql: &[String],
        risk_level: RiskLevel,
    ) -> Result<(), MigrationError> {
        self.append(
            version,
            description,
            rollback_sql,
            risk_level,
            HistoryStatus::Applied,
        )
    }

    /// Record a failed migration.
    pub fn record_failure(
        &self,
        version: &str,
        description: &str,
        risk_level: RiskLevel,
        error: &str,
    ) -> Result<(), MigrationError> {
        self.append(
            version,
            &format!("{description} [failed: {error}]"),
            &[],
            risk_level,
            HistoryStatus::Failed,
        )
    }

    /// Record a reverted migration.
    pub fn record_rollback(
        &self,
        version: &str,
        description: &str,
        risk_level: RiskLevel,
    ) -> Result<(), MigrationError> {
        self.append(
            version,
            description,
            &[],
            risk_level,
            HistoryStatus::RolledBack,
        )
    }

    /// At most `limit` rows, newest first.
    pub fn get_migration_history(&self, limit: usize) -> Result<Vec<HistoryEntry>, MigrationError> {
        self.get_migration_history_ordered(limit, HistoryOrder::NewestFirst)
    }

    /// At most `limit` rows in the given order.
    ///
    /// `OldestFirst` returns the oldest `limit` rows.
    pub fn get_migration_history_ordered(
        &self,
        limit: usize,
        order: HistoryOrder,
    ) -> Result<Vec<HistoryEntry>, MigrationError> {
        let direction = match order {
            HistoryOrder::NewestFirst => "DESC",
            HistoryOrder::OldestFirst => "ASC",
        };
        let sql = format!(
            "SELECT {COLUMNS} FROM {MIGRATIONS_TABLE} ORDER BY id {direction} LIMIT {}",
            placeholder(self.dialect(), 1)
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .executor
            .query(&sql, &[SqlValue::Integer(limit)])
            .map_err(MigrationError::storage)?;
        rows.into_iter().map(parse_row).collect()
    }

    /// The applied entry for a version, unless it was rolled back since.
    pub fn find_applied(&self, version: &str) -> Result<Option<HistoryEntry>, MigrationError> {
        let sql = format!(
            "SELECT {COLUMNS} FROM {MIGRATIONS_TABLE} WHERE version = {} \
             AND status <> 'failed' ORDER BY id DESC LIMIT 1",
            placeholder(self.dialect(), 1)
        );
        let rows = self
            .executor
            .query(&sql, &[SqlValue::from(version)])
            .map_err(MigrationError::storage)?;

        match rows.into_iter().next() {
            Some(row) => {
                let entry = parse_row(row)?;
                Ok((entry.status == HistoryStatus::Applied).then_some(entry))
            }
            None => Ok(None),
        }
    }
}

fn parse_row(row: Vec<SqlValue>) -> Result<HistoryEntry, MigrationError> {
    let mut cells = row.into_iter();
    let mut next = |name: &str| {
        cells
            .next()
            .ok_or_else(|| MigrationError::storage(format!("history row is missing '{name}'")))
    };

    let id = next("id")?
        .as_i64()
        .ok_or_else(|| MigrationError::storage("history id is not an integer"))?;
    let version = text(next("version")?, "version")?;
    let description = text(next("description")?, "description")?;
    let rollback_sql: Vec<String> =
        serde_json::from_str(&text(next("rollback_sql")?, "rollback_sql")?)
            .map_err(MigrationError::storage)?;
    let risk_level: RiskLevel = text(next("risk_level")?, "risk_level")?.parse()?;
    let applied_at = DateTime::parse_from_rfc3339(&text(next("applied_at")?, "applied_at")?)
        .map_err(MigrationError::storage)?
        .with_timezone(&Utc);
    let status = HistoryStatus::parse(&text(next("status")?, "status")?)?;

    Ok(HistoryEntry {
        id,
        version,
        description,
        rollback_sql,
        risk_level,
        applied_at,
        status,
    })
}

fn text(value: SqlValue, name: &str) -> Result<String, MigrationError> {
    match value {
        SqlValue::Text(s) => Ok(s),
        other => Err(MigrationError::storage(format!(
            "history column '{name}' is not text: {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDatabase;

    fn storage() -> MigrationStorage {
        let db = Arc::new(SqliteDatabase::open_in_memory().unwrap());
        let storage = MigrationStorage::new(db);
        storage.initialize().unwrap();
        storage
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let storage = storage();
        storage.initialize().unwrap();
        storage.initialize().unwrap();
        assert!(storage.get_migration_history(10).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_read_back() {
        let storage = storage();
        let rollback = vec!["ALTER TABLE users DROP COLUMN age".to_string()];
        storage
            .record_migration("v1", "Add column 'users.age'", &rollback, RiskLevel::Safe)
            .unwrap();

        let history = storage.get_migration_history(10).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].version, "v1");
        assert_eq!(history[0].rollback_sql, rollback);
        assert_eq!(history[0].risk_level, RiskLevel::Safe);
        assert_eq!(history[0].status, HistoryStatus::Applied);
    }

    #[test]
    fn test_history_order_and_limit() {
        let storage = storage();
        for i in 0..5 {
            storage
                .record_migration(&format!("v{i}"), "m", &[], RiskLevel::Safe)
                .unwrap();
        }

        let newest: Vec<String> = storage
            .get_migration_history(3)
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(newest, vec!["v4", "v3", "v2"]);

        let oldest: Vec<String> = storage
            .get_migration_history_ordered(2, HistoryOrder::OldestFirst)
            .unwrap()
            .into_iter()
            .map(|e| e.version)
            .collect();
        assert_eq!(oldest, vec!["v0", "v1"]);
        assert!(storage.get_migration_history(0).unwrap().is_empty());
    }

    #[test]
    fn test_failures_and_rollbacks_are_appended() {
        let storage = storage();
        storage
            .record_migration("v1", "m", &["DROP TABLE t".to_string()], RiskLevel::High)
            .unwrap();
        assert!(storage.find_applied("v1").unwrap().is_some());

        storage.record_rollback("v1", "m", RiskLevel::High).unwrap();
        assert!(storage.find_applied("v1").unwrap().is_none());

        storage
            .record_failure("v2", "m2", RiskLevel::Medium, "constraint failed")
            .unwrap();
        assert!(storage.find_applied("v2").unwrap().is_none());

        let history = storage.get_migration_history(10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].status, HistoryStatus::Failed);
        assert!(history[0].description.contains("constraint failed"));
        assert_eq!(history[1].status, HistoryStatus::RolledBack);
    }
}
