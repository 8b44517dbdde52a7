//! Declared models.
//!
//! Applications describe their tables by implementing [`DeclaredModel`]. The
//! [`ModelRegistry`] collects them and serves as the [`TargetSchema`] of the
//! engine. Capabilities such as soft delete are explicit traits, resolved once
//! when the model is registered.

use super::table::{ColumnDef, TableDef};
use super::{SchemaSnapshot, TargetSchema};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Column added to every soft-deletable model.
pub const SOFT_DELETE_COLUMN: &str = "deleted_at";

/// A model whose table shape is declared in code.
pub trait DeclaredModel {
    /// Table definition of the model.
    fn table() -> TableDef;

    /// Soft-delete column, if the model supports soft delete.
    ///
    /// Models opt in by implementing [`SoftDelete`] and registering through
    /// [`ModelRegistry::register_soft_delete`].
    fn soft_delete_column() -> Option<&'static str> {
        None
    }
}

/// Capability marker: rows are flagged as deleted instead of removed.
pub trait SoftDelete: DeclaredModel {
    /// Name of the nullable timestamp column marking deletion.
    fn deleted_at_column() -> &'static str {
        SOFT_DELETE_COLUMN
    }
}

/// Registry of declared models.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    tables: RwLock<BTreeMap<String, TableDef>>,
}

impl ModelRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model.
    pub fn register<M: DeclaredModel>(&self) -> &Self {
        let mut table = M::table();
        if let Some(column) = M::soft_delete_column() {
            ensure_soft_delete_column(&mut table, column);
        }
        self.insert(table);
        self
    }

    /// Register a soft-deletable model, adding its deletion column.
    pub fn register_soft_delete<M: SoftDelete>(&self) -> &Self {
        let mut table = M::table();
        ensure_soft_delete_column(&mut table, M::deleted_at_column());
        self.insert(table);
        self
    }

    /// Register a raw table definition.
    pub fn register_table(&self, table: TableDef) -> &Self {
        self.insert(table);
        self
    }

    /// Whether a table has been registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tables.read().contains_key(name)
    }

    /// Number of registered tables.
    pub fn len(&self) -> usize {
        self.tables.read().len()
    }

    /// Whether no tables are registered.
    pub fn is_empty(&self) -> bool {
        self.tables.read().is_empty()
    }

    fn insert(&self, table: TableDef) {
        self.tables.write().insert(table.name.clone(), table);
    }
}

fn ensure_soft_delete_column(table: &mut TableDef, column: &str) {
    if !table.has_column(column) {
        table.columns.push(ColumnDef::new(column, "TIMESTAMP"));
    }
}

impl TargetSchema for ModelRegistry {
    fn target_snapshot(&self) -> SchemaSnapshot {
        let tables = self.tables.read();
        let mut snapshot = SchemaSnapshot::new();
        for table in tables.values() {
            snapshot.add_table(table.clone());
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct User;

    impl DeclaredModel for User {
        fn table() -> TableDef {
            TableDef::new("users")
                .with_column(ColumnDef::required("id", "INTEGER").primary_key())
                .with_column(ColumnDef::new("name", "TEXT"))
        }
    }

    struct Post;

    impl DeclaredModel for Post {
        fn table() -> TableDef {
            TableDef::new("posts").with_column(ColumnDef::required("id", "INTEGER").primary_key())
        }
    }

    impl SoftDelete for Post {}

    #[test]
    fn test_register_plain_model() {
        let registry = ModelRegistry::new();
        registry.register::<User>();

        let snapshot = registry.target_snapshot();
        let users = snapshot.table("users").unwrap();
        assert_eq!(users.columns.len(), 2);
        assert!(!users.has_column(SOFT_DELETE_COLUMN));
    }

    #[test]
    fn test_soft_delete_adds_nullable_column() {
        let registry = ModelRegistry::new();
        registry.register_soft_delete::<Post>().register::<User>();

        let snapshot = registry.target_snapshot();
        let posts = snapshot.table("posts").unwrap();
        let deleted_at = posts.column(SOFT_DELETE_COLUMN).unwrap();
        assert!(deleted_at.nullable);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_soft_delete_column_not_duplicated() {
        let registry = ModelRegistry::new();
        registry.register_soft_delete::<Post>();
        registry.register_soft_delete::<Post>();

        let snapshot = registry.target_snapshot();
        let count = snapshot
            .table("posts")
            .unwrap()
            .columns
            .iter()
            .filter(|c| c.name == SOFT_DELETE_COLUMN)
            .count();
        assert_eq!(count, 1);
    }
}
