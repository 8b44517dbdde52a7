//! Schema change detection.
//!
//! Compares the live schema with the declared target and produces an ordered
//! list of [`SchemaChange`]s. Detection is read-only.

use super::error::MigrationError;
use crate::schema::{
    ColumnDef, ConstraintDef, SchemaIntrospector, SchemaSnapshot, TableDef, TargetSchema,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, instrument};

/// Kind of a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    /// A table exists in the target but not live.
    CreateTable,
    /// A table exists live but not in the target.
    DropTable,
    /// A column exists in the target but not live.
    AddColumn,
    /// A column exists live but not in the target.
    DropColumn,
    /// A column's normalized type differs.
    AlterColumnType,
    /// A constraint exists in the target but not live.
    AddConstraint,
    /// A constraint exists live but not in the target.
    DropConstraint,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeKind::CreateTable => "CreateTable",
            ChangeKind::DropTable => "DropTable",
            ChangeKind::AddColumn => "AddColumn",
            ChangeKind::DropColumn => "DropColumn",
            ChangeKind::AlterColumnType => "AlterColumnType",
            ChangeKind::AddConstraint => "AddConstraint",
            ChangeKind::DropConstraint => "DropConstraint",
        };
        f.write_str(name)
    }
}

/// Old or new definition attached to a change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Definition {
    /// A whole table.
    Table(TableDef),
    /// A single column.
    Column(ColumnDef),
    /// A constraint.
    Constraint(ConstraintDef),
}

impl Definition {
    /// The column, if this is a column definition.
    pub fn as_column(&self) -> Option<&ColumnDef> {
        match self {
            Definition::Column(c) => Some(c),
            _ => None,
        }
    }

    /// The table, if this is a table definition.
    pub fn as_table(&self) -> Option<&TableDef> {
        match self {
            Definition::Table(t) => Some(t),
            _ => None,
        }
    }

    /// The constraint, if this is a constraint definition.
    pub fn as_constraint(&self) -> Option<&ConstraintDef> {
        match self {
            Definition::Constraint(c) => Some(c),
            _ => None,
        }
    }
}

/// A single difference between the live and the target schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Kind of change.
    pub kind: ChangeKind,
    /// Affected table.
    pub table: String,
    /// Affected column or constraint name, if any.
    pub column: Option<String>,
    /// Live definition.
    pub old_definition: Option<Definition>,
    /// Target definition.
    pub new_definition: Option<Definition>,
    /// Human-readable summary.
    pub description: String,
}

impl SchemaChange {
    /// A table to create.
    pub fn create_table(table: &TableDef) -> Self {
        Self {
            kind: ChangeKind::CreateTable,
            table: table.name.clone(),
            column: None,
            old_definition: None,
            new_definition: Some(Definition::Table(table.clone())),
            description: format!("Create table '{}'", table.name),
        }
    }

    /// A table to drop.
    pub fn drop_table(table: &TableDef) -> Self {
        Self {
            kind: ChangeKind::DropTable,
            table: table.name.clone(),
            column: None,
            old_definition: Some(Definition::Table(table.clone())),
            new_definition: None,
            description: format!("Drop table '{}'", table.name),
        }
    }

    /// A column to add.
    pub fn add_column(table: &str, column: &ColumnDef) -> Self {
        Self {
            kind: ChangeKind::AddColumn,
            table: table.to_string(),
            column: Some(column.name.clone()),
            old_definition: None,
            new_definition: Some(Definition::Column(column.clone())),
            description: format!("Add column '{}.{}'", table, column.name),
        }
    }

    /// A column to drop.
    pub fn drop_column(table: &str, column: &ColumnDef) -> Self {
        Self {
            kind: ChangeKind::DropColumn,
            table: table.to_string(),
            column: Some(column.name.clone()),
            old_definition: Some(Definition::Column(column.clone())),
            new_definition: None,
            description: format!("Drop column '{}.{}'", table, column.name),
        }
    }

    /// A column whose type changes.
    pub fn alter_column_type(table: &str, old: &ColumnDef, new: &ColumnDef) -> Self {
        Self {
            kind: ChangeKind::AlterColumnType,
            table: table.to_string(),
            column: Some(new.name.clone()),
            old_definition: Some(Definition::Column(old.clone())),
            new_definition: Some(Definition::Column(new.clone())),
            description: format!(
                "Change type of '{}.{}' from {} to {}",
                table, new.name, old.sql_type, new.sql_type
            ),
        }
    }

    /// A constraint to add.
    pub fn add_constraint(table: &str, constraint: &ConstraintDef) -> Self {
        Self {
            kind: ChangeKind::AddConstraint,
            table: table.to_string(),
            column: Some(constraint.name().to_string()),
            old_definition: None,
            new_definition: Some(Definition::Constraint(constraint.clone())),
            description: format!("Add constraint '{}' on '{}'", constraint.name(), table),
        }
    }

    /// A constraint to drop.
    pub fn drop_constraint(table: &str, constraint: &ConstraintDef) -> Self {
        Self {
            kind: ChangeKind::DropConstraint,
            table: table.to_string(),
            column: Some(constraint.name().to_string()),
            old_definition: Some(Definition::Constraint(constraint.clone())),
            new_definition: None,
            description: format!("Drop constraint '{}' on '{}'", constraint.name(), table),
        }
    }

    /// New column definition, for column changes.
    pub fn new_column(&self) -> Option<&ColumnDef> {
        self.new_definition.as_ref().and_then(Definition::as_column)
    }

    /// Old column definition, for column changes.
    pub fn old_column(&self) -> Option<&ColumnDef> {
        self.old_definition.as_ref().and_then(Definition::as_column)
    }

    /// Affected constraint, for constraint changes.
    pub fn constraint(&self) -> Option<&ConstraintDef> {
        self.new_definition
            .as_ref()
            .or(self.old_definition.as_ref())
            .and_then(Definition::as_constraint)
    }
}

/// Detector configuration.
#[derive(Debug, Clone, Default)]
pub struct DetectorOptions {
    /// Report live tables missing from the target as `DropTable`.
    pub report_table_drops: bool,
}

impl DetectorOptions {
    /// Set whether table drops are reported.
    pub fn with_table_drops(mut self, enabled: bool) -> Self {
        self.report_table_drops = enabled;
        self
    }
}

/// Detects differences between the live and the target schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaDetector {
    options: DetectorOptions,
}

impl SchemaDetector {
    /// Create a detector.
    pub fn new(options: DetectorOptions) -> Self {
        Self { options }
    }

    /// Introspect the live database and compare it with the target.
    ///
    /// An empty result means the database is up to date.
    #[instrument(skip_all)]
    pub fn detect_changes(
        &self,
        live: &dyn SchemaIntrospector,
        target: &dyn TargetSchema,
    ) -> Result<Vec<SchemaChange>, MigrationError> {
        let live = live.snapshot()?;
        let target = target.target_snapshot();
        Ok(self.diff(&live, &target))
    }

    /// Compare two snapshots.
    pub fn diff(&self, live: &SchemaSnapshot, target: &SchemaSnapshot) -> Vec<SchemaChange> {
        let mut names: Vec<&str> = live.table_names().chain(target.table_names()).collect();
        names.sort_unstable();
        names.dedup();

        let mut changes = Vec::new();
        for name in names {
            match (live.table(name), target.table(name)) {
                (None, Some(target_table)) => {
                    changes.push(SchemaChange::create_table(target_table));
                }
                (Some(live_table), None) => {
                    if self.options.report_table_drops {
                        changes.push(SchemaChange::drop_table(live_table));
                    } else {
                        debug!(table = name, "Ignoring table absent from target schema");
                    }
                }
                (Some(live_table), Some(target_table)) => {
                    Self::diff_columns(live_table, target_table, &mut changes);
                    Self::diff_constraints(live_table, target_table, &mut changes);
                }
                (None, None) => {}
            }
        }

        debug!(count = changes.len(), "Schema diff computed");
        changes
    }

    fn diff_columns(live: &TableDef, target: &TableDef, changes: &mut Vec<SchemaChange>) {
        for column in &target.columns {
            match live.column(&column.name) {
                None => changes.push(SchemaChange::add_column(&target.name, column)),
                Some(existing) if existing.type_tag() != column.type_tag() => {
                    changes.push(SchemaChange::alter_column_type(&target.name, existing, column));
                }
                Some(_) => {}
            }
        }

        for column in &live.columns {
            if !target.has_column(&column.name) {
                changes.push(SchemaChange::drop_column(&target.name, column));
            }
        }
    }

    fn diff_constraints(live: &TableDef, target: &TableDef, changes: &mut Vec<SchemaChange>) {
        let live_keys: HashSet<String> = live.constraints.iter().map(|c| c.match_key()).collect();
        let target_keys: HashSet<String> =
            target.constraints.iter().map(|c| c.match_key()).collect();

        for constraint in &target.constraints {
            if !live_keys.contains(&constraint.match_key()) {
                changes.push(SchemaChange::add_constraint(&target.name, constraint));
            }
        }
        for constraint in &live.constraints {
            if !target_keys.contains(&constraint.match_key()) {
                changes.push(SchemaChange::drop_constraint(&target.name, constraint));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users() -> TableDef {
        TableDef::new("users")
            .with_column(ColumnDef::required("id", "INTEGER").primary_key())
            .with_column(ColumnDef::new("name", "VARCHAR(255)"))
    }

    #[test]
    fn test_no_changes() {
        let snapshot = SchemaSnapshot::new().with_table(users());
        let changes = SchemaDetector::default().diff(&snapshot, &snapshot);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_create_table() {
        let target = SchemaSnapshot::new().with_table(users());
        let changes = SchemaDetector::default().diff(&SchemaSnapshot::new(), &target);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::CreateTable);
        assert_eq!(changes[0].new_definition, Some(Definition::Table(users())));
        assert_eq!(changes[0].description, "Create table 'users'");
    }

    #[test]
    fn test_table_drop_only_when_enabled() {
        let live = SchemaSnapshot::new().with_table(users());
        let target = SchemaSnapshot::new();

        assert!(SchemaDetector::default().diff(&live, &target).is_empty());

        let detector = SchemaDetector::new(DetectorOptions::default().with_table_drops(true));
        let changes = detector.diff(&live, &target);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::DropTable);
    }

    #[test]
    fn test_add_and_drop_column() {
        let live = SchemaSnapshot::new().with_table(users());
        let target = SchemaSnapshot::new().with_table(
            TableDef::new("users")
                .with_column(ColumnDef::required("id", "INTEGER").primary_key())
                .with_column(ColumnDef::new("age", "INTEGER")),
        );

        let changes = SchemaDetector::default().diff(&live, &target);
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::AddColumn, ChangeKind::DropColumn]);
        assert_eq!(changes[0].column.as_deref(), Some("age"));
        assert_eq!(changes[1].column.as_deref(), Some("name"));
    }

    #[test]
    fn test_type_spelling_is_not_a_change() {
        let live = SchemaSnapshot::new().with_table(users());
        let target = SchemaSnapshot::new().with_table(
            TableDef::new("users")
                .with_column(ColumnDef::required("id", "BIGINT").primary_key())
                .with_column(ColumnDef::new("name", "TEXT")),
        );
        assert!(SchemaDetector::default().diff(&live, &target).is_empty());
    }

    #[test]
    fn test_alter_column_type() {
        let live = SchemaSnapshot::new().with_table(users());
        let target = SchemaSnapshot::new().with_table(
            TableDef::new("users")
                .with_column(ColumnDef::required("id", "INTEGER").primary_key())
                .with_column(ColumnDef::new("name", "INTEGER")),
        );

        let changes = SchemaDetector::default().diff(&live, &target);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::AlterColumnType);
        assert_eq!(changes[0].old_column().unwrap().sql_type, "VARCHAR(255)");
        assert_eq!(changes[0].new_column().unwrap().sql_type, "INTEGER");
    }

    #[test]
    fn test_constraint_changes() {
        let live = SchemaSnapshot::new().with_table(
            users().with_constraint(ConstraintDef::unique("uq_old", &["name"])),
        );
        let target = SchemaSnapshot::new().with_table(users().with_unique(&["name"]));

        let changes = SchemaDetector::default().diff(&live, &target);
        let kinds: Vec<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ChangeKind::AddConstraint, ChangeKind::DropConstraint]
        );
        assert_eq!(changes[0].constraint().unwrap().name(), "uq_users_name");
        assert_eq!(changes[1].constraint().unwrap().name(), "uq_old");
    }

    #[test]
    fn test_output_is_table_ordered() {
        let target = SchemaSnapshot::new()
            .with_table(TableDef::new("zeta").with_column(ColumnDef::new("id", "INTEGER")))
            .with_table(TableDef::new("alpha").with_column(ColumnDef::new("id", "INTEGER")));

        let changes = SchemaDetector::default().diff(&SchemaSnapshot::new(), &target);
        let tables: Vec<&str> = changes.iter().map(|c| c.table.as_str()).collect();
        assert_eq!(tables, vec!["alpha", "zeta"]);
    }
}
