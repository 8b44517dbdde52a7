//! Embedded SQLite backend.
//!
//! Implements both [`SqlExecutor`] and [`SchemaIntrospector`] over a single
//! `rusqlite` connection. Cross-process contention is absorbed by SQLite's
//! busy timeout; in-process callers are serialized by a mutex.

use super::{ExecutorError, SqlExecutor, SqlValue};
use crate::schema::table::unique_name;
use crate::schema::{
    ColumnDef, ColumnDefault, ConstraintDef, Dialect, IndexDef, IntrospectionError,
    SchemaIntrospector,
};
use parking_lot::Mutex;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Integrity check run before a rebuild commits.
const FOREIGN_KEY_CHECK: &str = "PRAGMA foreign_key_check";

/// Default busy timeout for file databases.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite database handle.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl SqliteDatabase {
    /// Open (or create) a database file in WAL mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ExecutorError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)?;
        conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(path = %path.display(), journal_mode = %mode, "Opened SQLite database");

        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path),
        })
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self, ExecutorError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: None,
        })
    }

    /// Path of the database file, `None` for in-memory databases.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a batch of statements outside any managed transaction.
    pub fn execute_batch(&self, sql: &str) -> Result<(), ExecutorError> {
        self.conn.lock().execute_batch(sql)?;
        Ok(())
    }

    fn unique_indexes(
        conn: &Connection,
        table: &str,
    ) -> Result<Vec<ConstraintDef>, IntrospectionError> {
        // origin 'c' = CREATE UNIQUE INDEX, 'u' = inline UNIQUE. Inline
        // constraints have generated autoindex names, so they get the
        // conventional constraint name instead.
        let mut stmt = conn.prepare(
            "SELECT name, origin FROM pragma_index_list(?1) \
             WHERE \"unique\" = 1 AND origin IN ('c', 'u') ORDER BY name",
        )?;
        let indexes = stmt
            .query_map(params![table], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut constraints = Vec::with_capacity(indexes.len());
        for (index, origin) in indexes {
            let columns = Self::index_columns(conn, &index)?;
            let inline = origin == "u";
            let name = if inline {
                unique_name(table, &columns)
            } else {
                index
            };
            constraints.push(ConstraintDef::Unique {
                name,
                columns,
                inline,
            });
        }
        Ok(constraints)
    }

    fn index_columns(conn: &Connection, index: &str) -> Result<Vec<String>, IntrospectionError> {
        let mut stmt = conn.prepare_cached("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
        let columns = stmt
            .query_map(params![index], |row| row.get::<_, Option<String>>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        // Expression terms have no column name.
        Ok(columns.into_iter().flatten().collect())
    }

    fn secondary_indexes(conn: &Connection, table: &str) -> Result<Vec<IndexDef>, IntrospectionError> {
        let mut stmt = conn.prepare(
            "SELECT name FROM pragma_index_list(?1) \
             WHERE \"unique\" = 0 AND origin = 'c' ORDER BY name",
        )?;
        let names = stmt
            .query_map(params![table], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut sql_stmt = conn.prepare(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1 AND sql IS NOT NULL",
        )?;
        let mut indexes = Vec::with_capacity(names.len());
        for name in names {
            let sql: Option<String> = sql_stmt
                .query_row(params![name], |row| row.get(0))
                .optional()?;
            if let Some(sql) = sql {
                indexes.push(IndexDef {
                    columns: Self::index_columns(conn, &name)?,
                    name,
                    sql,
                });
            }
        }
        Ok(indexes)
    }

    /// Run `statements` in one IMMEDIATE transaction on `conn`.
    ///
    /// With `check_foreign_keys`, `PRAGMA foreign_key_check` must come back
    /// empty before the commit.
    fn run_transaction(
        conn: &mut Connection,
        statements: &[String],
        check_foreign_keys: bool,
    ) -> Result<(), ExecutorError> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (index, sql) in statements.iter().enumerate() {
            if let Err(e) = tx.execute_batch(sql) {
                // Dropping the transaction rolls it back.
                return Err(ExecutorError::Statement {
                    index,
                    sql: sql.clone(),
                    message: e.to_string(),
                });
            }
        }

        if check_foreign_keys {
            let violations = {
                let mut stmt = tx.prepare("PRAGMA foreign_key_check")?;
                let rows = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(2)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            if let Some((child, parent)) = violations.first() {
                return Err(ExecutorError::Statement {
                    index: statements.len(),
                    sql: FOREIGN_KEY_CHECK.to_string(),
                    message: format!(
                        "{} foreign key violation(s), first in '{child}' referencing '{parent}'",
                        violations.len()
                    ),
                });
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn foreign_keys(
        conn: &Connection,
        table: &str,
    ) -> Result<Vec<ConstraintDef>, IntrospectionError> {
        let mut stmt = conn.prepare(
            "SELECT id, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?1) ORDER BY id, seq",
        )?;
        let rows = stmt
            .query_map(params![table], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut constraints: Vec<(i64, ConstraintDef)> = Vec::new();
        for (id, ref_table, from, to) in rows {
            // A missing "to" column means the parent's primary key.
            let to = to.unwrap_or_else(|| "id".to_string());
            let continues_last = matches!(constraints.last(), Some((last_id, _)) if *last_id == id);
            if continues_last {
                if let Some((
                    _,
                    ConstraintDef::ForeignKey {
                        columns,
                        references_columns,
                        ..
                    },
                )) = constraints.last_mut()
                {
                    columns.push(from);
                    references_columns.push(to);
                }
            } else {
                constraints.push((
                    id,
                    ConstraintDef::ForeignKey {
                        name: String::new(),
                        columns: vec![from],
                        references_table: ref_table,
                        references_columns: vec![to],
                    },
                ));
            }
        }

        Ok(constraints
            .into_iter()
            .map(|(_, mut fk)| {
                if let ConstraintDef::ForeignKey { name, columns, .. } = &mut fk {
                    *name = crate::schema::table::foreign_key_name(table, columns);
                }
                fk
            })
            .collect())
    }
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

fn to_value(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(i) => Value::Integer(*i),
        SqlValue::Real(r) => Value::Real(*r),
        SqlValue::Text(s) => Value::Text(s.clone()),
    }
}

fn from_value(value: Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(i) => SqlValue::Integer(i),
        Value::Real(r) => SqlValue::Real(r),
        Value::Text(s) => SqlValue::Text(s),
        Value::Blob(b) => SqlValue::Text(String::from_utf8_lossy(&b).into_owned()),
    }
}

impl SqlExecutor for SqliteDatabase {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, ExecutorError> {
        let conn = self.conn.lock();
        let changed = conn.execute(sql, params_from_iter(params.iter().map(to_value)))?;
        Ok(changed as u64)
    }

    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, ExecutorError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(sql)?;
        let width = stmt.column_count();
        let rows = stmt
            .query_map(params_from_iter(params.iter().map(to_value)), |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i).map(from_value))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn execute_transaction(&self, statements: &[String]) -> Result<(), ExecutorError> {
        let mut conn = self.conn.lock();
        Self::run_transaction(&mut conn, statements, false)
    }

    /// Follows SQLite's table rebuild procedure: foreign key enforcement is
    /// switched off outside the transaction so dropping the old table cannot
    /// cascade into child tables, and integrity is verified before commit.
    fn execute_rebuild(&self, statements: &[String]) -> Result<(), ExecutorError> {
        let mut conn = self.conn.lock();
        let enforced: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if !enforced {
            return Self::run_transaction(&mut conn, statements, false);
        }

        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        let result = Self::run_transaction(&mut conn, statements, true);
        if let Err(e) = conn.execute_batch("PRAGMA foreign_keys = ON") {
            warn!(error = %e, "Failed to re-enable foreign key enforcement");
            if result.is_ok() {
                return Err(e.into());
            }
        }
        result
    }
}

impl SchemaIntrospector for SqliteDatabase {
    fn table_names(&self) -> Result<Vec<String>, IntrospectionError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, IntrospectionError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid",
        )?;
        let columns = stmt
            .query_map(params![table], |row| {
                let not_null: i64 = row.get(2)?;
                let default: Option<String> = row.get(3)?;
                let pk: i64 = row.get(4)?;
                Ok(ColumnDef {
                    name: row.get(0)?,
                    sql_type: row.get(1)?,
                    nullable: not_null == 0,
                    default: default.as_deref().map(ColumnDefault::parse),
                    primary_key: pk > 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        if columns.is_empty() {
            return Err(IntrospectionError::TableNotFound(table.to_string()));
        }
        Ok(columns)
    }

    fn constraints(&self, table: &str) -> Result<Vec<ConstraintDef>, IntrospectionError> {
        let conn = self.conn.lock();
        let mut constraints = Self::unique_indexes(&conn, table)?;
        constraints.extend(Self::foreign_keys(&conn, table)?);
        Ok(constraints)
    }

    fn indexes(&self, table: &str) -> Result<Vec<IndexDef>, IntrospectionError> {
        let conn = self.conn.lock();
        Self::secondary_indexes(&conn, table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db_with_schema() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            r#"
            CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                email VARCHAR(255) NOT NULL,
                status TEXT DEFAULT 'active'
            );
            CREATE UNIQUE INDEX uq_users_email ON users (email);
            CREATE INDEX idx_users_status ON users (status);
            CREATE TABLE posts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER,
                FOREIGN KEY (user_id) REFERENCES users(id)
            );
            "#,
        )
        .unwrap();
        db
    }

    #[test]
    fn test_columns_are_introspected() {
        let db = db_with_schema();
        let columns = db.columns("users").unwrap();

        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert_eq!(columns[1].sql_type, "VARCHAR(255)");
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].default, Some(ColumnDefault::Text("active".into())));
    }

    #[test]
    fn test_missing_table_is_reported() {
        let db = db_with_schema();
        assert!(matches!(
            db.columns("nope"),
            Err(IntrospectionError::TableNotFound(_))
        ));
    }

    #[test]
    fn test_only_unique_indexes_are_constraints() {
        let db = db_with_schema();
        let constraints = db.constraints("users").unwrap();

        assert_eq!(constraints, vec![ConstraintDef::unique("uq_users_email", &["email"])]);
        assert!(!constraints[0].is_inline_unique());
    }

    #[test]
    fn test_foreign_keys_are_introspected() {
        let db = db_with_schema();
        let constraints = db.constraints("posts").unwrap();

        assert_eq!(
            constraints,
            vec![ConstraintDef::foreign_key("posts", &["user_id"], "users", &["id"])]
        );
    }

    #[test]
    fn test_query_and_execute() {
        let db = db_with_schema();
        let changed = db
            .execute(
                "INSERT INTO users (email) VALUES (?1)",
                &[SqlValue::from("a@example.com")],
            )
            .unwrap();
        assert_eq!(changed, 1);

        let rows = db.query("SELECT id, email, status FROM users", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][1], SqlValue::from("a@example.com"));
        assert_eq!(rows[0][2], SqlValue::from("active"));
    }

    #[test]
    fn test_failed_transaction_rolls_back() {
        let db = db_with_schema();
        let statements = vec![
            "CREATE TABLE t1 (id INTEGER)".to_string(),
            "INSERT INTO missing VALUES (1)".to_string(),
        ];

        match db.execute_transaction(&statements) {
            Err(ExecutorError::Statement { index, sql, .. }) => {
                assert_eq!(index, 1);
                assert_eq!(sql, statements[1]);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let names = db.table_names().unwrap();
        assert!(!names.contains(&"t1".to_string()));
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = tempfile::tempdir().unwrap();
        let db = SqliteDatabase::open(dir.path().join("app.db")).unwrap();
        let rows = db.query("PRAGMA journal_mode", &[]).unwrap();
        assert_eq!(rows[0][0], SqlValue::from("wal"));
        assert_eq!(db.path(), Some(dir.path().join("app.db").as_path()));
    }

    #[test]
    fn test_inline_unique_is_a_constraint() {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch("CREATE TABLE accounts (id INTEGER PRIMARY KEY, email TEXT UNIQUE)")
            .unwrap();

        let constraints = db.constraints("accounts").unwrap();
        assert_eq!(constraints.len(), 1);
        assert_eq!(constraints[0].name(), "uq_accounts_email");
        assert!(constraints[0].is_inline_unique());
    }

    #[test]
    fn test_secondary_indexes_are_introspected() {
        let db = db_with_schema();
        let indexes = db.indexes("users").unwrap();

        assert_eq!(indexes.len(), 1);
        assert_eq!(indexes[0].name, "idx_users_status");
        assert_eq!(indexes[0].columns, vec!["status".to_string()]);
        assert!(indexes[0].sql.starts_with("CREATE INDEX idx_users_status"));
        assert!(db.indexes("posts").unwrap().is_empty());
    }

    fn parent_with_cascading_child() -> SqliteDatabase {
        let db = SqliteDatabase::open_in_memory().unwrap();
        db.execute_batch(
            r#"
            CREATE TABLE users (id INTEGER PRIMARY KEY, age VARCHAR);
            CREATE TABLE posts (
                id INTEGER PRIMARY KEY,
                user_id INTEGER REFERENCES users(id) ON DELETE CASCADE
            );
            INSERT INTO users (id, age) VALUES (1, '30');
            INSERT INTO posts (id, user_id) VALUES (1, 1);
            "#,
        )
        .unwrap();
        db
    }

    fn foreign_keys_enabled(db: &SqliteDatabase) -> bool {
        db.query("PRAGMA foreign_keys", &[]).unwrap()[0][0] == SqlValue::Integer(1)
    }

    #[test]
    fn test_rebuild_keeps_child_rows() {
        let db = parent_with_cascading_child();
        assert!(foreign_keys_enabled(&db));

        let statements = vec![
            "CREATE TABLE users_new_1 (id INTEGER PRIMARY KEY, age INTEGER)".to_string(),
            "INSERT INTO users_new_1 (id, age) SELECT id, CAST(age AS INTEGER) FROM users"
                .to_string(),
            "DROP TABLE users".to_string(),
            "ALTER TABLE users_new_1 RENAME TO users".to_string(),
        ];
        db.execute_rebuild(&statements).unwrap();

        let posts = db.query("SELECT COUNT(*) FROM posts", &[]).unwrap();
        assert_eq!(posts[0][0], SqlValue::Integer(1));
        assert!(foreign_keys_enabled(&db));
    }

    #[test]
    fn test_rebuild_rejects_foreign_key_violations() {
        let db = parent_with_cascading_child();
        // The copy loses the parent row the post points at.
        let statements = vec![
            "CREATE TABLE users_new_1 (id INTEGER PRIMARY KEY, age INTEGER)".to_string(),
            "INSERT INTO users_new_1 (id, age) SELECT id, age FROM users WHERE id <> 1"
                .to_string(),
            "DROP TABLE users".to_string(),
            "ALTER TABLE users_new_1 RENAME TO users".to_string(),
        ];

        match db.execute_rebuild(&statements) {
            Err(ExecutorError::Statement { index, sql, message }) => {
                assert_eq!(index, statements.len());
                assert_eq!(sql, FOREIGN_KEY_CHECK);
                assert!(message.contains("'posts' referencing 'users'"), "{message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Rolled back, enforcement restored.
        let users = db.query("SELECT age FROM users", &[]).unwrap();
        assert_eq!(users[0][0], SqlValue::from("30"));
        assert!(foreign_keys_enabled(&db));
    }
}
