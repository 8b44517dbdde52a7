//! Schema model shared by the detector, the generator and the backends.
//!
//! A [`SchemaSnapshot`] is a point-in-time description of a set of tables.
//! The live side is produced by a [`SchemaIntrospector`], the declared side by
//! a [`TargetSchema`].

pub mod model;
pub mod table;
pub mod types;

pub use model::{DeclaredModel, ModelRegistry, SoftDelete, SOFT_DELETE_COLUMN};
pub use table::{ColumnDef, ColumnDefault, ConstraintDef, IndexDef, TableDef};
pub use types::{Dialect, TypeTag};

use crate::lock::LOCKS_TABLE;
use crate::migration::MIGRATIONS_TABLE;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Tables owned by the migration subsystem. Never reported as changes.
pub const INTERNAL_TABLES: &[&str] = &[MIGRATIONS_TABLE, LOCKS_TABLE];

/// Name prefix reserved by SQLite for its own tables.
const SQLITE_RESERVED_PREFIX: &str = "sqlite_";

/// Whether a table is internal bookkeeping rather than application schema.
pub fn is_internal_table(name: &str) -> bool {
    INTERNAL_TABLES.contains(&name) || name.starts_with(SQLITE_RESERVED_PREFIX)
}

/// Errors raised while reading the live schema.
#[derive(Debug, Error)]
pub enum IntrospectionError {
    /// The backend failed to answer a catalog query.
    #[error("catalog query failed: {0}")]
    Query(String),

    /// The requested table does not exist.
    #[error("table not found: {0}")]
    TableNotFound(String),
}

impl From<rusqlite::Error> for IntrospectionError {
    fn from(e: rusqlite::Error) -> Self {
        IntrospectionError::Query(e.to_string())
    }
}

/// Reads the schema of a live database.
pub trait SchemaIntrospector: Send + Sync {
    /// Names of all tables, internal ones included.
    fn table_names(&self) -> Result<Vec<String>, IntrospectionError>;

    /// Columns of a table in ordinal order.
    fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, IntrospectionError>;

    /// Unique and foreign key constraints of a table.
    fn constraints(&self, table: &str) -> Result<Vec<ConstraintDef>, IntrospectionError>;

    /// Secondary indexes of a table. Backends without index support report
    /// none.
    fn indexes(&self, _table: &str) -> Result<Vec<IndexDef>, IntrospectionError> {
        Ok(Vec::new())
    }

    /// Snapshot of every non-internal table.
    fn snapshot(&self) -> Result<SchemaSnapshot, IntrospectionError> {
        let mut snapshot = SchemaSnapshot::new();
        for name in self.table_names()? {
            if is_internal_table(&name) {
                continue;
            }
            let table = TableDef {
                columns: self.columns(&name)?,
                constraints: self.constraints(&name)?,
                indexes: self.indexes(&name)?,
                name,
            };
            snapshot.add_table(table);
        }
        Ok(snapshot)
    }
}

/// Provides the declared (desired) schema.
pub trait TargetSchema: Send + Sync {
    /// Snapshot of the declared schema.
    fn target_snapshot(&self) -> SchemaSnapshot;
}

/// A set of table definitions keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    tables: BTreeMap<String, TableDef>,
}

impl SchemaSnapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_table`](Self::add_table).
    pub fn with_table(mut self, table: TableDef) -> Self {
        self.add_table(table);
        self
    }

    /// Add or replace a table.
    pub fn add_table(&mut self, table: TableDef) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Remove a table.
    pub fn remove_table(&mut self, name: &str) -> Option<TableDef> {
        self.tables.remove(name)
    }

    /// Get a table by name.
    pub fn table(&self, name: &str) -> Option<&TableDef> {
        self.tables.get(name)
    }

    /// Get a mutable table by name.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableDef> {
        self.tables.get_mut(name)
    }

    /// Iterate tables in name order.
    pub fn tables(&self) -> impl Iterator<Item = &TableDef> {
        self.tables.values()
    }

    /// Table names in order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Number of tables.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the snapshot holds no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl TargetSchema for SchemaSnapshot {
    fn target_snapshot(&self) -> SchemaSnapshot {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedIntrospector(SchemaSnapshot);

    impl SchemaIntrospector for FixedIntrospector {
        fn table_names(&self) -> Result<Vec<String>, IntrospectionError> {
            let mut names: Vec<String> = self.0.table_names().map(String::from).collect();
            names.push("_migrations".into());
            names.push("sqlite_sequence".into());
            Ok(names)
        }

        fn columns(&self, table: &str) -> Result<Vec<ColumnDef>, IntrospectionError> {
            Ok(self.0.table(table).map(|t| t.columns.clone()).unwrap_or_default())
        }

        fn constraints(&self, table: &str) -> Result<Vec<ConstraintDef>, IntrospectionError> {
            Ok(self
                .0
                .table(table)
                .map(|t| t.constraints.clone())
                .unwrap_or_default())
        }
    }

    #[test]
    fn test_snapshot_skips_internal_tables() {
        let live = SchemaSnapshot::new()
            .with_table(TableDef::new("users").with_column(ColumnDef::new("id", "INTEGER")));
        let snapshot = FixedIntrospector(live.clone()).snapshot().unwrap();

        assert_eq!(snapshot, live);
        assert!(snapshot.table("_migrations").is_none());
    }

    #[test]
    fn test_internal_table_names() {
        assert!(is_internal_table("_migrations"));
        assert!(is_internal_table("_migration_locks"));
        assert!(is_internal_table("sqlite_sequence"));
        assert!(!is_internal_table("users"));
        assert!(!is_internal_table("migrations"));
        assert!(!is_internal_table("_migration_notes"));
    }

    #[test]
    fn test_tables_are_name_ordered() {
        let snapshot = SchemaSnapshot::new()
            .with_table(TableDef::new("zebra"))
            .with_table(TableDef::new("apple"));
        let names: Vec<&str> = snapshot.table_names().collect();
        assert_eq!(names, vec!["apple", "zebra"]);
    }
}
