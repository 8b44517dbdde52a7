//! Database backends.
//!
//! The engine only talks to a database through [`SqlExecutor`]. Backends that
//! can also read their own catalog implement
//! [`SchemaIntrospector`](crate::schema::SchemaIntrospector) as well.

pub mod sqlite;

pub use sqlite::SqliteDatabase;

use crate::schema::Dialect;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A bound parameter or a result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// Double precision float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
}

impl SqlValue {
    /// Integer value, if this is an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Text value, if this is text.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::Integer(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

/// Errors returned by a [`SqlExecutor`].
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A single statement failed.
    #[error("sql error: {0}")]
    Sql(String),

    /// A statement inside a transaction failed; the transaction was rolled back.
    #[error("statement {index} failed ({sql}): {message}")]
    Statement {
        /// Zero-based index of the failing statement.
        index: usize,
        /// The failing statement.
        sql: String,
        /// Database error text.
        message: String,
    },

    /// The database is busy or locked by another connection.
    #[error("database busy: {0}")]
    Busy(String),
}

impl From<rusqlite::Error> for ExecutorError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::SqliteFailure(ref err, _)
                if matches!(
                    err.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                ExecutorError::Busy(e.to_string())
            }
            other => ExecutorError::Sql(other.to_string()),
        }
    }
}

/// Executes SQL against a database.
pub trait SqlExecutor: Send + Sync {
    /// Dialect spoken by the database.
    fn dialect(&self) -> Dialect;

    /// Execute one statement, returning the number of affected rows.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, ExecutorError>;

    /// Run a query and return all rows.
    fn query(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Vec<SqlValue>>, ExecutorError>;

    /// Execute statements in a single transaction.
    ///
    /// On failure the transaction is rolled back and the error names the
    /// failing statement.
    fn execute_transaction(&self, statements: &[String]) -> Result<(), ExecutorError>;

    /// Execute a table rebuild (create, copy, drop, rename) in a single
    /// transaction.
    ///
    /// Dropping the old table must not cascade into tables that reference
    /// it, and the result must satisfy every foreign key.
    fn execute_rebuild(&self, statements: &[String]) -> Result<(), ExecutorError> {
        self.execute_transaction(statements)
    }
}
