//! Migration plan generation.
//!
//! Turns classified schema changes into an ordered list of reversible
//! [`Migration`]s. Changes a dialect can express in place become direct DDL;
//! high-risk changes and changes the dialect cannot express are folded per
//! table into a single Copy-Swap-Drop rebuild.

use super::detect::{ChangeKind, Definition, SchemaChange};
use super::error::{MigrationError, RiskLevel};
use super::risk::{ClassifiedChange, RiskClassifier};
use super::sql;
use crate::schema::{ColumnDef, ColumnDefault, ConstraintDef, Dialect, SchemaSnapshot, TableDef};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, instrument};

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Strictly increasing microsecond timestamp.
///
/// Falls forward by one microsecond when the wall clock has not advanced (or
/// went backwards) since the previous call.
pub fn monotonic_micros() -> u64 {
    let now = Utc::now().timestamp_micros().max(0) as u64;
    let mut last = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_MICROS.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Generate a migration id. Lexical order equals creation order.
pub fn generate_migration_id(base_micros: u64, sequence: usize) -> String {
    format!("{base_micros:020}_{sequence:03}")
}

/// How a migration changes the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strategy {
    /// Statements executed in place.
    DirectDdl,
    /// Table rebuilt through a copy.
    CopySwapDrop,
}

/// A single reversible schema migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Migration {
    /// Version id.
    pub id: String,
    /// Human-readable summary.
    pub description: String,
    /// Risk of the migration.
    pub risk_level: RiskLevel,
    /// Statements applying the migration.
    pub upgrade_sql: Vec<String>,
    /// Statements reverting the migration.
    pub rollback_sql: Vec<String>,
    /// Whether an operator must approve the migration.
    pub requires_confirmation: bool,
    /// Execution strategy.
    pub strategy: Strategy,
    /// Affected table.
    pub table: String,
    /// Whether the migration moves data (copy or backfill).
    pub has_dml: bool,
}

impl Migration {
    /// Upgrade statements without an explicit `BEGIN`/`COMMIT` frame.
    pub fn upgrade_statements(&self) -> Vec<String> {
        strip_transaction_frame(&self.upgrade_sql)
    }
}

/// Whether statements carry an explicit transaction frame, which only
/// Copy-Swap-Drop rebuilds do.
pub fn is_rebuild(statements: &[String]) -> bool {
    statements
        .first()
        .is_some_and(|s| s.eq_ignore_ascii_case(sql::BEGIN))
}

/// Remove a leading `BEGIN TRANSACTION` and trailing `COMMIT`.
pub fn strip_transaction_frame(statements: &[String]) -> Vec<String> {
    let mut slice = statements;
    if let Some((first, rest)) = slice.split_first() {
        if first.eq_ignore_ascii_case(sql::BEGIN) || first.eq_ignore_ascii_case("BEGIN") {
            slice = rest;
        }
    }
    if let Some((last, rest)) = slice.split_last() {
        if last.eq_ignore_ascii_case(sql::COMMIT) {
            slice = rest;
        }
    }
    slice.to_vec()
}

/// Lifecycle status of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanStatus {
    /// Nothing executed yet.
    Pending,
    /// Some migrations applied, then execution stopped.
    Partial,
    /// Every executed migration succeeded.
    Complete,
    /// The first executed migration failed.
    Failed,
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlanStatus::Pending => write!(f, "pending"),
            PlanStatus::Partial => write!(f, "partial"),
            PlanStatus::Complete => write!(f, "complete"),
            PlanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// An ordered set of migrations: SAFE, then MEDIUM, then HIGH.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    /// Migrations in execution order.
    pub migrations: Vec<Migration>,
    /// Plan status.
    pub status: PlanStatus,
    /// Operator-facing warnings.
    pub warnings: Vec<String>,
    /// Target dialect.
    pub dialect: Dialect,
    /// When the plan was generated.
    pub created_at: DateTime<Utc>,
}

impl MigrationPlan {
    /// An empty plan.
    pub fn empty(dialect: Dialect) -> Self {
        Self {
            migrations: Vec::new(),
            status: PlanStatus::Complete,
            warnings: Vec::new(),
            dialect,
            created_at: Utc::now(),
        }
    }

    /// Number of migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if this plan has no migrations.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Highest risk in the plan.
    pub fn max_risk(&self) -> Option<RiskLevel> {
        self.migrations.iter().map(|m| m.risk_level).max()
    }

    /// Serialize the plan as pretty JSON.
    pub fn to_json(&self) -> Result<String, MigrationError> {
        serde_json::to_string_pretty(self).map_err(|e| MigrationError::Generation {
            table: String::new(),
            reason: format!("plan serialization failed: {e}"),
        })
    }
}

impl std::fmt::Display for MigrationPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Migration plan ({}, {} migration(s)",
            self.dialect,
            self.migrations.len()
        )?;
        if let Some(risk) = self.max_risk() {
            write!(f, ", max risk {risk}")?;
        }
        writeln!(f, ", {})", self.status)?;

        for migration in &self.migrations {
            write!(
                f,
                "  [{}] {} {}",
                migration.risk_level, migration.id, migration.description
            )?;
            if migration.strategy == Strategy::CopySwapDrop {
                write!(f, " (copy-swap-drop)")?;
            }
            if migration.requires_confirmation {
                write!(f, " (requires confirmation)")?;
            }
            writeln!(f)?;
        }

        if !self.warnings.is_empty() {
            writeln!(f, "Warnings:")?;
            for warning in &self.warnings {
                writeln!(f, "  - {warning}")?;
            }
        }
        Ok(())
    }
}

/// Explicit backfill value for a NOT NULL column added without default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backfill {
    /// Table name.
    pub table: String,
    /// Column name.
    pub column: String,
    /// Value written into existing rows.
    pub value: ColumnDefault,
}

/// Generator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorOptions {
    /// Configured backfills.
    pub backfills: Vec<Backfill>,
}

impl GeneratorOptions {
    /// Backfill existing rows of `table.column` with `value`, turning the
    /// column addition into a SAFE migration.
    pub fn with_backfill(
        mut self,
        table: impl Into<String>,
        column: impl Into<String>,
        value: ColumnDefault,
    ) -> Self {
        self.backfills.push(Backfill {
            table: table.into(),
            column: column.into(),
            value,
        });
        self
    }

    fn backfill_for(&self, table: &str, column: &str) -> Option<&Backfill> {
        self.backfills
            .iter()
            .find(|b| b.table == table && b.column == column)
    }
}

/// One migration before SQL generation.
enum Unit {
    Direct(ClassifiedChange),
    Rebuild {
        table: String,
        changes: Vec<ClassifiedChange>,
        risk: RiskLevel,
    },
}

impl Unit {
    fn risk(&self) -> RiskLevel {
        match self {
            Unit::Direct(c) => c.risk,
            Unit::Rebuild { risk, .. } => *risk,
        }
    }
}

/// Generates migration plans.
#[derive(Debug, Clone)]
pub struct MigrationGenerator {
    dialect: Dialect,
    options: GeneratorOptions,
    classifier: RiskClassifier,
}

impl MigrationGenerator {
    /// Create a generator for a dialect.
    pub fn new(dialect: Dialect, options: GeneratorOptions) -> Self {
        Self {
            dialect,
            options,
            classifier: RiskClassifier::new(),
        }
    }

    /// Use a custom classifier.
    pub fn with_classifier(mut self, classifier: RiskClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Target dialect.
    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Classify changes and build a plan.
    ///
    /// `live` is the schema the changes were detected against; it is needed
    /// to rebuild tables.
    pub fn generate_plan(
        &self,
        changes: &[SchemaChange],
        live: &SchemaSnapshot,
    ) -> Result<MigrationPlan, MigrationError> {
        let classified = self.classifier.classify_all(changes)?;
        self.plan_classified(classified, live)
    }

    /// Build a plan from already classified changes.
    #[instrument(skip_all, fields(dialect = %self.dialect, changes = classified.len()))]
    pub fn plan_classified(
        &self,
        classified: Vec<ClassifiedChange>,
        live: &SchemaSnapshot,
    ) -> Result<MigrationPlan, MigrationError> {
        if classified.is_empty() {
            return Ok(MigrationPlan::empty(self.dialect));
        }
        for c in &classified {
            reject_primary_key_addition(&c.change)?;
        }

        let mut warnings =
            self.missing_backfill_warnings(classified.iter().map(|c| &c.change));
        let mut units = self.group(classified);
        // Stable: detection order is kept within a tier.
        units.sort_by_key(Unit::risk);

        let base = monotonic_micros();
        let mut working = live.clone();
        let mut migrations = Vec::with_capacity(units.len());
        for (sequence, unit) in units.into_iter().enumerate() {
            let id = generate_migration_id(base, sequence);
            let migration = match unit {
                Unit::Direct(change) => self.direct(id, change, &mut working)?,
                Unit::Rebuild {
                    table,
                    changes,
                    risk,
                } => self.rebuild(id, &table, &changes, risk, &mut working)?,
            };
            migrations.push(migration);
        }

        warnings.extend(self.warnings(&migrations));
        debug!(migrations = migrations.len(), warnings = warnings.len(), "Plan generated");

        Ok(MigrationPlan {
            migrations,
            status: PlanStatus::Pending,
            warnings,
            dialect: self.dialect,
            created_at: Utc::now(),
        })
    }

    fn needs_rebuild(&self, change: &ClassifiedChange) -> bool {
        let c = &change.change;
        match c.kind {
            ChangeKind::CreateTable | ChangeKind::DropTable => false,
            ChangeKind::AddColumn => {
                change.risk == RiskLevel::High || !self.dialect.supports_add_column()
            }
            ChangeKind::DropColumn => {
                change.risk == RiskLevel::High || !self.dialect.supports_drop_column()
            }
            ChangeKind::AlterColumnType => {
                change.risk == RiskLevel::High || !self.dialect.supports_alter_column_type()
            }
            ChangeKind::AddConstraint | ChangeKind::DropConstraint => {
                let fk = c.constraint().is_some_and(ConstraintDef::is_foreign_key);
                // Inline UNIQUE has no index of its own to drop.
                let inline = c.kind == ChangeKind::DropConstraint
                    && c.constraint().is_some_and(ConstraintDef::is_inline_unique);
                change.risk == RiskLevel::High
                    || inline
                    || (fk && !self.dialect.supports_alter_foreign_keys())
            }
        }
    }

    fn group(&self, classified: Vec<ClassifiedChange>) -> Vec<Unit> {
        let mut units: Vec<Unit> = Vec::new();
        for change in classified {
            if !self.needs_rebuild(&change) {
                units.push(Unit::Direct(change));
                continue;
            }
            let existing = units.iter_mut().find_map(|u| match u {
                Unit::Rebuild {
                    table,
                    changes,
                    risk,
                } if *table == change.change.table => Some((changes, risk)),
                _ => None,
            });
            match existing {
                Some((changes, risk)) => {
                    *risk = (*risk).max(change.risk);
                    changes.push(change);
                }
                None => units.push(Unit::Rebuild {
                    table: change.change.table.clone(),
                    risk: change.risk,
                    changes: vec![change],
                }),
            }
        }
        units
    }

    fn direct(
        &self,
        id: String,
        classified: ClassifiedChange,
        working: &mut SchemaSnapshot,
    ) -> Result<Migration, MigrationError> {
        let d = self.dialect;
        let ClassifiedChange { change, mut risk } = classified;
        let table = change.table.clone();
        let mut description = change.description.clone();
        let mut has_dml = false;

        let (upgrade_sql, rollback_sql) = match change.kind {
            ChangeKind::CreateTable => {
                let def = required_table(change.new_definition.as_ref(), &table)?;
                let mut up = vec![sql::create_table(def, d)];
                up.extend(sql::create_unique_indexes(def, d));
                (up, vec![sql::drop_table(&table, d)])
            }
            ChangeKind::DropTable => {
                let def = required_table(change.old_definition.as_ref(), &table)?;
                let mut down = vec![sql::create_table(def, d)];
                down.extend(sql::create_unique_indexes(def, d));
                down.extend(sql::restore_indexes(def));
                (vec![sql::drop_table(&table, d)], down)
            }
            ChangeKind::AddColumn => {
                let column = required_column(change.new_column(), &table)?;
                let down = vec![sql::drop_column(&table, &column.name, d)];
                match self.options.backfill_for(&table, &column.name) {
                    Some(backfill) if !column.is_nullable_or_defaulted() => {
                        risk = RiskLevel::Safe;
                        has_dml = true;
                        description = format!("{description} (backfilled)");
                        (self.backfill_sql(&table, column, &backfill.value), down)
                    }
                    _ => (vec![sql::add_column(&table, column, d)], down),
                }
            }
            ChangeKind::DropColumn => {
                let column = required_column(change.old_column(), &table)?;
                (
                    vec![sql::drop_column(&table, &column.name, d)],
                    vec![sql::add_column(&table, &column.clone().nullable(), d)],
                )
            }
            ChangeKind::AlterColumnType => {
                let old = required_column(change.old_column(), &table)?;
                let new = required_column(change.new_column(), &table)?;
                match (
                    sql::alter_column_type(&table, new, d),
                    sql::alter_column_type(&table, old, d),
                ) {
                    (Some(up), Some(down)) => (vec![up], vec![down]),
                    _ => {
                        return Err(MigrationError::Generation {
                            table,
                            reason: format!("{d} cannot change column types in place"),
                        })
                    }
                }
            }
            ChangeKind::AddConstraint => {
                let constraint = required_constraint(&change, &table)?;
                match constraint {
                    ConstraintDef::Unique { name, .. } => (
                        vec![sql::create_unique_index(&table, constraint, d)],
                        vec![sql::drop_index(&table, name, d)],
                    ),
                    ConstraintDef::ForeignKey { name, .. } => (
                        vec![sql::add_foreign_key(&table, constraint, d)],
                        vec![sql::drop_foreign_key(&table, name, d)],
                    ),
                }
            }
            ChangeKind::DropConstraint => {
                let constraint = required_constraint(&change, &table)?;
                match constraint {
                    ConstraintDef::Unique { name, .. } => (
                        vec![sql::drop_index(&table, name, d)],
                        vec![sql::create_unique_index(&table, constraint, d)],
                    ),
                    ConstraintDef::ForeignKey { name, .. } => (
                        vec![sql::drop_foreign_key(&table, name, d)],
                        vec![sql::add_foreign_key(&table, constraint, d)],
                    ),
                }
            }
        };

        apply_change(working, &change)?;

        Ok(Migration {
            id,
            description,
            risk_level: risk,
            upgrade_sql,
            rollback_sql,
            requires_confirmation: risk == RiskLevel::High,
            strategy: Strategy::DirectDdl,
            table,
            has_dml,
        })
    }

    fn backfill_sql(&self, table: &str, column: &ColumnDef, value: &ColumnDefault) -> Vec<String> {
        let d = self.dialect;
        let name = sql::quote_ident(&column.name, d);
        let quoted_table = sql::quote_ident(table, d);
        let defaulted = column.clone().with_default(value.clone());
        match d {
            // SQLite cannot add NOT NULL to an existing column.
            Dialect::Sqlite => vec![
                sql::add_column(table, &defaulted, d),
                sql::backfill_update(table, &column.name, value, d),
            ],
            Dialect::Postgres => vec![
                sql::add_column(table, &defaulted.clone().nullable(), d),
                sql::backfill_update(table, &column.name, value, d),
                format!("ALTER TABLE {quoted_table} ALTER COLUMN {name} SET NOT NULL"),
                format!("ALTER TABLE {quoted_table} ALTER COLUMN {name} DROP DEFAULT"),
            ],
            Dialect::MySql => vec![
                sql::add_column(table, &defaulted.clone().nullable(), d),
                sql::backfill_update(table, &column.name, value, d),
                format!(
                    "ALTER TABLE {quoted_table} MODIFY COLUMN {}",
                    sql::column_sql(&column.clone().not_null(), false, d)
                ),
            ],
        }
    }

    fn rebuild(
        &self,
        id: String,
        table: &str,
        changes: &[ClassifiedChange],
        risk: RiskLevel,
        working: &mut SchemaSnapshot,
    ) -> Result<Migration, MigrationError> {
        let before = working
            .table(table)
            .cloned()
            .ok_or_else(|| MigrationError::Generation {
                table: table.to_string(),
                reason: "table does not exist in the live schema".to_string(),
            })?;

        for classified in changes {
            apply_change(working, &classified.change)?;
        }
        let after = working
            .table(table)
            .cloned()
            .ok_or_else(|| MigrationError::Generation {
                table: table.to_string(),
                reason: "table vanished while planning".to_string(),
            })?;

        let upgrade_sql =
            sql::copy_swap_drop(&before, &after, &monotonic_micros().to_string(), self.dialect);
        let rollback_sql =
            sql::copy_swap_drop(&after, &before, &monotonic_micros().to_string(), self.dialect);

        let summary: Vec<&str> = changes.iter().map(|c| c.change.description.as_str()).collect();
        Ok(Migration {
            id,
            description: format!("Rebuild table '{}': {}", table, summary.join("; ")),
            risk_level: risk,
            upgrade_sql,
            rollback_sql,
            requires_confirmation: risk == RiskLevel::High,
            strategy: Strategy::CopySwapDrop,
            table: table.to_string(),
            has_dml: true,
        })
    }

    fn warnings(&self, migrations: &[Migration]) -> Vec<String> {
        let mut warnings = Vec::new();

        let high = migrations
            .iter()
            .filter(|m| m.risk_level == RiskLevel::High)
            .count();
        if high > 1 {
            warnings.push(format!("Plan contains {high} high-risk migrations"));
        }

        for migration in migrations {
            if migration.strategy == Strategy::DirectDdl
                && migration
                    .upgrade_sql
                    .iter()
                    .any(|s| s.starts_with("DROP TABLE"))
            {
                warnings.push(format!(
                    "Table '{}' will be dropped; rollback restores its shape but not its data",
                    migration.table
                ));
            }
            if migration.strategy == Strategy::CopySwapDrop {
                warnings.push(format!(
                    "Table '{}' will be rebuilt; requires free disk space for a full copy",
                    migration.table
                ));
            }
        }
        warnings
    }

    fn missing_backfill_warnings<'a>(
        &self,
        changes: impl Iterator<Item = &'a SchemaChange>,
    ) -> Vec<String> {
        changes
            .filter(|c| c.kind == ChangeKind::AddColumn)
            .filter_map(|c| c.new_column().map(|col| (c, col)))
            .filter(|(c, col)| {
                !col.is_nullable_or_defaulted()
                    && self.options.backfill_for(&c.table, &col.name).is_none()
            })
            .map(|(c, col)| {
                format!(
                    "Column '{}.{}' is NOT NULL without default; existing rows will reject it unless a backfill is configured",
                    c.table, col.name
                )
            })
            .collect()
    }
}

/// Existing rows cannot receive distinct values for a new primary key
/// column, so such additions are refused rather than silently emitted
/// without the key.
fn reject_primary_key_addition(change: &SchemaChange) -> Result<(), MigrationError> {
    match change.new_column() {
        Some(column) if change.kind == ChangeKind::AddColumn && column.primary_key => {
            Err(MigrationError::Generation {
                table: change.table.clone(),
                reason: format!(
                    "cannot add primary key column '{}' to an existing table",
                    column.name
                ),
            })
        }
        _ => Ok(()),
    }
}

fn required_table<'a>(
    def: Option<&'a Definition>,
    table: &str,
) -> Result<&'a TableDef, MigrationError> {
    def.and_then(Definition::as_table)
        .ok_or_else(|| MigrationError::Generation {
            table: table.to_string(),
            reason: "missing table definition".to_string(),
        })
}

fn required_column<'a>(
    column: Option<&'a ColumnDef>,
    table: &str,
) -> Result<&'a ColumnDef, MigrationError> {
    column.ok_or_else(|| MigrationError::Generation {
        table: table.to_string(),
        reason: "missing column definition".to_string(),
    })
}

fn required_constraint<'a>(
    change: &'a SchemaChange,
    table: &str,
) -> Result<&'a ConstraintDef, MigrationError> {
    change.constraint().ok_or_else(|| MigrationError::Generation {
        table: table.to_string(),
        reason: "missing constraint definition".to_string(),
    })
}

/// Apply a change to a schema snapshot, mirroring what its SQL does.
pub fn apply_change(
    schema: &mut SchemaSnapshot,
    change: &SchemaChange,
) -> Result<(), MigrationError> {
    let missing = || MigrationError::Generation {
        table: change.table.clone(),
        reason: format!("cannot apply {} to an unknown table", change.kind),
    };

    match change.kind {
        ChangeKind::CreateTable => {
            let def = required_table(change.new_definition.as_ref(), &change.table)?;
            schema.add_table(def.clone());
        }
        ChangeKind::DropTable => {
            schema.remove_table(&change.table);
        }
        ChangeKind::AddColumn => {
            let column = required_column(change.new_column(), &change.table)?;
            let table = schema.table_mut(&change.table).ok_or_else(missing)?;
            if !table.has_column(&column.name) {
                table.columns.push(column.clone());
            }
        }
        ChangeKind::DropColumn => {
            let column = required_column(change.old_column(), &change.table)?;
            let table = schema.table_mut(&change.table).ok_or_else(missing)?;
            table.columns.retain(|c| c.name != column.name);
            table.indexes.retain(|i| !i.columns.contains(&column.name));
        }
        ChangeKind::AlterColumnType => {
            let column = required_column(change.new_column(), &change.table)?;
            let table = schema.table_mut(&change.table).ok_or_else(missing)?;
            if let Some(existing) = table.columns.iter_mut().find(|c| c.name == column.name) {
                *existing = column.clone();
            }
        }
        ChangeKind::AddConstraint => {
            let constraint = required_constraint(change, &change.table)?;
            let table = schema.table_mut(&change.table).ok_or_else(missing)?;
            table.constraints.push(constraint.clone());
        }
        ChangeKind::DropConstraint => {
            let constraint = required_constraint(change, &change.table)?;
            let key = constraint.match_key();
            let table = schema.table_mut(&change.table).ok_or_else(missing)?;
            table.constraints.retain(|c| c.match_key() != key);
        }
    }
    Ok(())
}
