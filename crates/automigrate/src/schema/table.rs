//! Table, column and constraint definitions.

use super::types::{Dialect, TypeTag};
use serde::{Deserialize, Serialize};

/// Server-side default of a column (the SQL `DEFAULT` clause).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ColumnDefault {
    /// `DEFAULT NULL`.
    Null,
    /// Boolean literal.
    Bool(bool),
    /// Integer literal.
    Integer(i64),
    /// Floating point literal.
    Real(f64),
    /// String literal.
    Text(String),
    /// `CURRENT_TIMESTAMP`.
    CurrentTimestamp,
    /// Raw SQL expression, emitted verbatim.
    Expression(String),
}

impl ColumnDefault {
    /// Render as a SQL literal/expression for the given dialect.
    pub fn to_sql(&self, dialect: Dialect) -> String {
        match self {
            ColumnDefault::Null => "NULL".to_string(),
            ColumnDefault::Bool(b) => match dialect {
                Dialect::Postgres => if *b { "TRUE" } else { "FALSE" }.to_string(),
                Dialect::Sqlite | Dialect::MySql => if *b { "1" } else { "0" }.to_string(),
            },
            ColumnDefault::Integer(i) => i.to_string(),
            ColumnDefault::Real(r) => {
                let text = r.to_string();
                if text.contains('.') || text.contains('e') || text.contains("inf") {
                    text
                } else {
                    format!("{text}.0")
                }
            }
            ColumnDefault::Text(s) => format!("'{}'", s.replace('\'', "''")),
            ColumnDefault::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
            ColumnDefault::Expression(expr) => expr.clone(),
        }
    }

    /// Parse a default as reported by an introspector (e.g. SQLite's
    /// `dflt_value`).
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let unwrapped = trimmed
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(trimmed)
            .trim();

        if unwrapped.len() >= 2 && unwrapped.starts_with('\'') && unwrapped.ends_with('\'') {
            let inner = &unwrapped[1..unwrapped.len() - 1];
            return ColumnDefault::Text(inner.replace("''", "'"));
        }

        match unwrapped.to_ascii_uppercase().as_str() {
            "NULL" => return ColumnDefault::Null,
            "TRUE" => return ColumnDefault::Bool(true),
            "FALSE" => return ColumnDefault::Bool(false),
            "CURRENT_TIMESTAMP" | "NOW()" => return ColumnDefault::CurrentTimestamp,
            _ => {}
        }

        if let Ok(i) = unwrapped.parse::<i64>() {
            ColumnDefault::Integer(i)
        } else if let Ok(r) = unwrapped.parse::<f64>() {
            ColumnDefault::Real(r)
        } else {
            ColumnDefault::Expression(unwrapped.to_string())
        }
    }
}

/// A column definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Declared SQL type, as written (e.g. `VARCHAR(255)`).
    pub sql_type: String,
    /// Whether NULL is allowed.
    pub nullable: bool,
    /// Server-side default.
    pub default: Option<ColumnDefault>,
    /// Whether the column is (part of) the primary key.
    pub primary_key: bool,
}

impl ColumnDef {
    /// Create a nullable column without default.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
            primary_key: false,
        }
    }

    /// Create a NOT NULL column without default.
    pub fn required(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self::new(name, sql_type).not_null()
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Mark the column nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Set the server-side default.
    pub fn with_default(mut self, default: ColumnDefault) -> Self {
        self.default = Some(default);
        self
    }

    /// Mark the column as primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Canonical type tag of the declared type.
    pub fn type_tag(&self) -> TypeTag {
        TypeTag::normalize(&self.sql_type)
    }

    /// Check if this column has a default value.
    pub fn has_default(&self) -> bool {
        matches!(self.default, Some(ref d) if *d != ColumnDefault::Null)
    }

    /// Whether existing rows can receive this column without a backfill.
    pub fn is_nullable_or_defaulted(&self) -> bool {
        self.nullable || self.has_default()
    }
}

/// A table-level constraint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintDef {
    /// Unique constraint, materialized as a named unique index.
    Unique {
        /// Constraint (index) name.
        name: String,
        /// Constrained columns.
        columns: Vec<String>,
        /// Declared inline in `CREATE TABLE`; only a rebuild can remove it.
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        inline: bool,
    },
    /// Foreign key.
    ForeignKey {
        /// Constraint name.
        name: String,
        /// Referencing columns.
        columns: Vec<String>,
        /// Referenced table.
        references_table: String,
        /// Referenced columns.
        references_columns: Vec<String>,
    },
}

impl ConstraintDef {
    /// Create a unique constraint.
    pub fn unique(name: impl Into<String>, columns: &[&str]) -> Self {
        ConstraintDef::Unique {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            inline: false,
        }
    }

    /// Create a foreign key named `fk_<table>_<columns>`.
    pub fn foreign_key(
        table: &str,
        columns: &[&str],
        references_table: impl Into<String>,
        references_columns: &[&str],
    ) -> Self {
        let columns: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        ConstraintDef::ForeignKey {
            name: foreign_key_name(table, &columns),
            columns,
            references_table: references_table.into(),
            references_columns: references_columns.iter().map(|c| c.to_string()).collect(),
        }
    }

    /// Constraint name.
    pub fn name(&self) -> &str {
        match self {
            ConstraintDef::Unique { name, .. } | ConstraintDef::ForeignKey { name, .. } => name,
        }
    }

    /// Constrained columns.
    pub fn columns(&self) -> &[String] {
        match self {
            ConstraintDef::Unique { columns, .. } | ConstraintDef::ForeignKey { columns, .. } => {
                columns
            }
        }
    }

    /// Key used to match live and declared constraints.
    ///
    /// Foreign keys are matched by shape since SQLite does not keep their
    /// names.
    pub fn match_key(&self) -> String {
        match self {
            ConstraintDef::Unique { name, .. } => format!("unique:{name}"),
            ConstraintDef::ForeignKey {
                columns,
                references_table,
                references_columns,
                ..
            } => format!(
                "fk:{}->{}({})",
                columns.join(","),
                references_table,
                references_columns.join(",")
            ),
        }
    }

    /// Whether this is a foreign key.
    pub fn is_foreign_key(&self) -> bool {
        matches!(self, ConstraintDef::ForeignKey { .. })
    }

    /// Whether this is a unique constraint declared inside `CREATE TABLE`.
    pub fn is_inline_unique(&self) -> bool {
        matches!(self, ConstraintDef::Unique { inline: true, .. })
    }
}

/// Default unique constraint name.
pub fn unique_name(table: &str, columns: &[String]) -> String {
    format!("uq_{}_{}", table, columns.join("_"))
}

/// Default foreign key name.
pub fn foreign_key_name(table: &str, columns: &[String]) -> String {
    format!("fk_{}_{}", table, columns.join("_"))
}

/// A secondary, non-unique index of a live table.
///
/// Indexes are not compared by the detector; they are kept so that a table
/// rebuild can restore them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    /// Index name.
    pub name: String,
    /// Indexed columns; expression terms are omitted.
    pub columns: Vec<String>,
    /// The `CREATE INDEX` statement as stored by the database.
    pub sql: String,
}

impl IndexDef {
    /// Create an index definition.
    pub fn new(name: impl Into<String>, columns: &[&str], sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            sql: sql.into(),
        }
    }
}

/// A table definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
    /// Table constraints.
    pub constraints: Vec<ConstraintDef>,
    /// Secondary indexes.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
}

impl TableDef {
    /// Create an empty table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            constraints: Vec::new(),
            indexes: Vec::new(),
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Add several columns.
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = ColumnDef>) -> Self {
        self.columns.extend(columns);
        self
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: ConstraintDef) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add a unique constraint named `uq_<table>_<columns>`.
    pub fn with_unique(mut self, columns: &[&str]) -> Self {
        let owned: Vec<String> = columns.iter().map(|c| c.to_string()).collect();
        let name = unique_name(&self.name, &owned);
        self.constraints.push(ConstraintDef::unique(name, columns));
        self
    }

    /// Add a secondary index.
    pub fn with_index(mut self, index: IndexDef) -> Self {
        self.indexes.push(index);
        self
    }

    /// Add a foreign key.
    pub fn with_foreign_key(
        mut self,
        columns: &[&str],
        references_table: &str,
        references_columns: &[&str],
    ) -> Self {
        let fk = ConstraintDef::foreign_key(&self.name, columns, references_table, references_columns);
        self.constraints.push(fk);
        self
    }

    /// Get a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether a column exists.
    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }

    /// Primary key columns in declaration order.
    pub fn primary_key(&self) -> Vec<&ColumnDef> {
        self.columns.iter().filter(|c| c.primary_key).collect()
    }

    /// Unique constraints of this table.
    pub fn unique_constraints(&self) -> impl Iterator<Item = &ConstraintDef> {
        self.constraints
            .iter()
            .filter(|c| matches!(c, ConstraintDef::Unique { .. }))
    }

    /// Secondary indexes whose columns all still exist.
    pub fn restorable_indexes(&self) -> impl Iterator<Item = &IndexDef> {
        self.indexes
            .iter()
            .filter(|i| i.columns.iter().all(|c| self.has_column(c)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_builder() {
        let table = TableDef::new("users")
            .with_column(ColumnDef::required("id", "INTEGER").primary_key())
            .with_column(ColumnDef::new("name", "VARCHAR"))
            .with_unique(&["name"]);

        assert_eq!(table.columns.len(), 2);
        assert_eq!(table.primary_key().len(), 1);
        assert!(table.has_column("name"));
        assert!(!table.has_column("age"));
        assert_eq!(table.constraints[0].name(), "uq_users_name");
    }

    #[test]
    fn test_nullable_or_defaulted() {
        assert!(ColumnDef::new("a", "INTEGER").is_nullable_or_defaulted());
        assert!(ColumnDef::required("a", "INTEGER")
            .with_default(ColumnDefault::Integer(0))
            .is_nullable_or_defaulted());
        assert!(!ColumnDef::required("a", "INTEGER").is_nullable_or_defaulted());
        assert!(!ColumnDef::required("a", "INTEGER")
            .with_default(ColumnDefault::Null)
            .is_nullable_or_defaulted());
    }

    #[test]
    fn test_default_parse() {
        assert_eq!(ColumnDefault::parse("'active'"), ColumnDefault::Text("active".into()));
        assert_eq!(ColumnDefault::parse("'it''s'"), ColumnDefault::Text("it's".into()));
        assert_eq!(ColumnDefault::parse("0"), ColumnDefault::Integer(0));
        assert_eq!(ColumnDefault::parse("1.5"), ColumnDefault::Real(1.5));
        assert_eq!(ColumnDefault::parse("NULL"), ColumnDefault::Null);
        assert_eq!(ColumnDefault::parse("current_timestamp"), ColumnDefault::CurrentTimestamp);
        assert_eq!(ColumnDefault::parse("(1)"), ColumnDefault::Integer(1));
        assert_eq!(
            ColumnDefault::parse("lower('X')"),
            ColumnDefault::Expression("lower('X')".into())
        );
    }

    #[test]
    fn test_default_render() {
        assert_eq!(ColumnDefault::Text("it's".into()).to_sql(Dialect::Sqlite), "'it''s'");
        assert_eq!(ColumnDefault::Bool(true).to_sql(Dialect::Postgres), "TRUE");
        assert_eq!(ColumnDefault::Bool(true).to_sql(Dialect::Sqlite), "1");
        assert_eq!(ColumnDefault::Real(2.0).to_sql(Dialect::Sqlite), "2.0");
    }

    #[test]
    fn test_foreign_key_match_key_ignores_name() {
        let a = ConstraintDef::foreign_key("posts", &["user_id"], "users", &["id"]);
        let b = ConstraintDef::ForeignKey {
            name: "custom".into(),
            columns: vec!["user_id".into()],
            references_table: "users".into(),
            references_columns: vec!["id".into()],
        };
        assert_eq!(a.match_key(), b.match_key());
        assert_eq!(a.name(), "fk_posts_user_id");
    }

    #[test]
    fn test_restorable_indexes_skip_missing_columns() {
        let table = TableDef::new("users")
            .with_column(ColumnDef::new("name", "TEXT"))
            .with_index(IndexDef::new(
                "idx_users_name",
                &["name"],
                "CREATE INDEX idx_users_name ON users (name)",
            ))
            .with_index(IndexDef::new(
                "idx_users_legacy",
                &["legacy"],
                "CREATE INDEX idx_users_legacy ON users (legacy)",
            ));

        let names: Vec<&str> = table.restorable_indexes().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["idx_users_name"]);
    }
}
