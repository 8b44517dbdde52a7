//! Lock table provider for server databases.

use super::{new_holder_id, now_millis, poll_until, LockConfig, LockProvider, LockRecord};
use crate::backend::{ExecutorError, SqlExecutor, SqlValue};
use crate::migration::sql::placeholder;
use crate::migration::MigrationError;
use crate::schema::Dialect;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Name of the lock table.
pub const LOCKS_TABLE: &str = "_migration_locks";

/// Lock held as a row of `_migration_locks`, keyed by `lock_key`.
pub struct TableLock {
    executor: Arc<dyn SqlExecutor>,
    holder_id: String,
    config: LockConfig,
    table_ready: AtomicBool,
}

impl TableLock {
    /// Create a provider over an executor.
    pub fn new(executor: Arc<dyn SqlExecutor>, config: LockConfig) -> Self {
        Self {
            executor,
            holder_id: new_holder_id(),
            config,
            table_ready: AtomicBool::new(false),
        }
    }

    fn dialect(&self) -> Dialect {
        self.executor.dialect()
    }

    fn ensure_table(&self) -> Result<(), MigrationError> {
        if self.table_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {LOCKS_TABLE} (\
             lock_key VARCHAR(255) PRIMARY KEY, \
             holder_id VARCHAR(64) NOT NULL, \
             acquired_at BIGINT NOT NULL)"
        );
        match self.executor.execute(&sql, &[]) {
            Ok(_) => {}
            Err(e) if e.to_string().contains("already exists") => {}
            Err(e) => return Err(MigrationError::lock(e)),
        }
        self.table_ready.store(true, Ordering::Release);
        Ok(())
    }

    fn insert(&self, key: &str) -> Result<bool, MigrationError> {
        let d = self.dialect();
        let values = format!(
            "({}, {}, {})",
            placeholder(d, 1),
            placeholder(d, 2),
            placeholder(d, 3)
        );
        let sql = match d {
            Dialect::MySql => format!(
                "INSERT IGNORE INTO {LOCKS_TABLE} (lock_key, holder_id, acquired_at) VALUES {values}"
            ),
            Dialect::Sqlite | Dialect::Postgres => format!(
                "INSERT INTO {LOCKS_TABLE} (lock_key, holder_id, acquired_at) VALUES {values} \
                 ON CONFLICT (lock_key) DO NOTHING"
            ),
        };
        let params = [
            SqlValue::from(key),
            SqlValue::from(self.holder_id.as_str()),
            SqlValue::Integer(now_millis()),
        ];
        match self.executor.execute(&sql, &params) {
            Ok(rows) => Ok(rows > 0),
            // Contended; try again on the next poll.
            Err(ExecutorError::Busy(_)) => Ok(false),
            Err(e) => Err(MigrationError::lock(e)),
        }
    }

    fn current(&self, key: &str) -> Result<Option<LockRecord>, MigrationError> {
        let sql = format!(
            "SELECT holder_id, acquired_at FROM {LOCKS_TABLE} WHERE lock_key = {}",
            placeholder(self.dialect(), 1)
        );
        let rows = match self.executor.query(&sql, &[SqlValue::from(key)]) {
            Ok(rows) => rows,
            Err(ExecutorError::Busy(_)) => return Ok(None),
            Err(e) => return Err(MigrationError::lock(e)),
        };

        Ok(rows.into_iter().next().and_then(|row| {
            let holder_id = row.first()?.as_str()?.to_string();
            let acquired_at = row.get(1)?.as_i64()?;
            Some(LockRecord {
                holder_id,
                acquired_at,
                pid: 0,
            })
        }))
    }

    /// Delete the row only if it still holds the stale record.
    fn reclaim(&self, key: &str, stale: &LockRecord) -> Result<bool, MigrationError> {
        let d = self.dialect();
        let sql = format!(
            "DELETE FROM {LOCKS_TABLE} WHERE lock_key = {} AND holder_id = {} AND acquired_at = {}",
            placeholder(d, 1),
            placeholder(d, 2),
            placeholder(d, 3)
        );
        let params = [
            SqlValue::from(key),
            SqlValue::from(stale.holder_id.as_str()),
            SqlValue::Integer(stale.acquired_at),
        ];
        let deleted = match self.executor.execute(&sql, &params) {
            Ok(rows) => rows > 0,
            Err(ExecutorError::Busy(_)) => false,
            Err(e) => return Err(MigrationError::lock(e)),
        };
        if deleted {
            warn!(
                key,
                stale_holder = %stale.holder_id,
                age_ms = stale.age().as_millis() as u64,
                "Reclaimed stale migration lock"
            );
        }
        Ok(deleted)
    }

    fn try_acquire(&self, key: &str) -> Result<bool, MigrationError> {
        self.ensure_table()?;
        if self.insert(key)? {
            debug!(key, holder = %self.holder_id, "Lock row inserted");
            return Ok(true);
        }

        match self.current(key)? {
            Some(record) if record.holder_id == self.holder_id => Ok(true),
            Some(record) if record.is_stale(self.config.stale_threshold()) => {
                if self.reclaim(key, &record)? {
                    self.insert(key)
                } else {
                    Ok(false)
                }
            }
            _ => Ok(false),
        }
    }
}

impl LockProvider for TableLock {
    fn acquire(&self, key: &str, timeout: Duration) -> Result<bool, MigrationError> {
        poll_until(timeout, self.config.poll_interval, || self.try_acquire(key))
    }

    fn release(&self, key: &str) -> Result<bool, MigrationError> {
        self.ensure_table()?;
        let d = self.dialect();
        let sql = format!(
            "DELETE FROM {LOCKS_TABLE} WHERE lock_key = {} AND holder_id = {}",
            placeholder(d, 1),
            placeholder(d, 2)
        );
        let rows = self
            .executor
            .execute(
                &sql,
                &[SqlValue::from(key), SqlValue::from(self.holder_id.as_str())],
            )
            .map_err(MigrationError::lock)?;
        Ok(rows > 0)
    }

    fn holder_id(&self) -> &str {
        &self.holder_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SqliteDatabase;

    fn shared_db() -> Arc<SqliteDatabase> {
        Arc::new(SqliteDatabase::open_in_memory().unwrap())
    }

    #[test]
    fn test_exclusive_between_holders() {
        let db = shared_db();
        let config = LockConfig::default().with_poll_interval(Duration::from_millis(10));
        let a = TableLock::new(db.clone(), config.clone());
        let b = TableLock::new(db, config);

        assert!(a.acquire("schema_migration", Duration::ZERO).unwrap());
        assert!(!b.acquire("schema_migration", Duration::from_millis(30)).unwrap());
        assert!(!b.release("schema_migration").unwrap());

        assert!(a.release("schema_migration").unwrap());
        assert!(!a.release("schema_migration").unwrap());
        assert!(b.acquire("schema_migration", Duration::ZERO).unwrap());
    }

    #[test]
    fn test_stale_row_is_reclaimed() {
        let db = shared_db();
        let config = LockConfig::default().with_stale_after(Duration::from_millis(100));
        let survivor = TableLock::new(db.clone(), config);
        survivor.ensure_table().unwrap();

        db.execute(
            "INSERT INTO _migration_locks (lock_key, holder_id, acquired_at) VALUES (?1, ?2, ?3)",
            &[
                SqlValue::from("k"),
                SqlValue::from("crashed"),
                SqlValue::Integer(now_millis() - 60_000),
            ],
        )
        .unwrap();

        assert!(survivor.acquire("k", Duration::ZERO).unwrap());
        let record = survivor.current("k").unwrap().unwrap();
        assert_eq!(record.holder_id, survivor.holder_id());
    }

    #[test]
    fn test_fresh_row_is_not_reclaimed() {
        let db = shared_db();
        let holder = TableLock::new(db.clone(), LockConfig::default());
        let other = TableLock::new(db, LockConfig::default());

        assert!(holder.acquire("k", Duration::ZERO).unwrap());
        assert!(!other.acquire("k", Duration::ZERO).unwrap());
        assert_eq!(
            other.current("k").unwrap().unwrap().holder_id,
            holder.holder_id()
        );
    }
}
