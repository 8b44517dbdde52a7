//! Canonical column types and SQL dialects.
//!
//! Live databases report type names in their own vocabulary (`VARCHAR(255)`,
//! `character varying`, `TEXT`, `STRING`, ...). Comparisons between the live
//! and the declared schema always go through [`TypeTag::normalize`] so that
//! spelling differences never show up as type changes.

use serde::{Deserialize, Serialize};

/// Canonical type tag used when comparing column types.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// Whole numbers of any width.
    Integer,
    /// Floating point numbers.
    Real,
    /// Fixed-precision decimals.
    Numeric,
    /// Character data of any length.
    Text,
    /// Booleans.
    Boolean,
    /// Binary data.
    Blob,
    /// Date and time, with or without zone.
    Timestamp,
    /// Calendar date.
    Date,
    /// Time of day.
    Time,
    /// JSON documents.
    Json,
    /// UUIDs.
    Uuid,
    /// Anything not recognized, kept by its upper-cased base name.
    Other(String),
}

impl TypeTag {
    /// Normalize a dialect-specific type name to its canonical tag.
    ///
    /// Length and precision arguments are ignored, as are `UNSIGNED` and
    /// array markers.
    pub fn normalize(raw: &str) -> Self {
        let upper = raw.trim().to_ascii_uppercase();
        let base = match upper.find('(') {
            Some(idx) => upper[..idx].trim_end(),
            None => upper.as_str(),
        };
        let base = base.trim_end_matches("[]").trim_end_matches(" UNSIGNED").trim();

        match base {
            "INT" | "INTEGER" | "INT2" | "INT4" | "INT8" | "SMALLINT" | "BIGINT" | "TINYINT"
            | "MEDIUMINT" | "SERIAL" | "SMALLSERIAL" | "BIGSERIAL" => TypeTag::Integer,
            "REAL" | "FLOAT" | "FLOAT4" | "FLOAT8" | "DOUBLE" | "DOUBLE PRECISION" => {
                TypeTag::Real
            }
            "NUMERIC" | "DECIMAL" | "MONEY" => TypeTag::Numeric,
            "TEXT" | "VARCHAR" | "CHAR" | "CHARACTER" | "CHARACTER VARYING" | "NVARCHAR"
            | "NCHAR" | "STRING" | "CLOB" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" | "CITEXT" => {
                TypeTag::Text
            }
            "BOOL" | "BOOLEAN" => TypeTag::Boolean,
            "BLOB" | "BYTEA" | "BINARY" | "VARBINARY" | "LONGBLOB" => TypeTag::Blob,
            "TIMESTAMP" | "TIMESTAMPTZ" | "DATETIME" | "TIMESTAMP WITH TIME ZONE"
            | "TIMESTAMP WITHOUT TIME ZONE" => TypeTag::Timestamp,
            "DATE" => TypeTag::Date,
            "TIME" | "TIMETZ" | "TIME WITH TIME ZONE" | "TIME WITHOUT TIME ZONE" => TypeTag::Time,
            "JSON" | "JSONB" => TypeTag::Json,
            "UUID" => TypeTag::Uuid,
            other => TypeTag::Other(other.to_string()),
        }
    }

    /// The SQL type used when a value must be converted to this tag.
    pub fn cast_target(&self, dialect: Dialect) -> String {
        match (self, dialect) {
            (TypeTag::Integer, Dialect::MySql) => "SIGNED".to_string(),
            (TypeTag::Integer, _) => "INTEGER".to_string(),
            (TypeTag::Real, Dialect::Postgres) => "DOUBLE PRECISION".to_string(),
            (TypeTag::Real, Dialect::MySql) => "DOUBLE".to_string(),
            (TypeTag::Real, Dialect::Sqlite) => "REAL".to_string(),
            (TypeTag::Numeric, Dialect::MySql) => "DECIMAL".to_string(),
            (TypeTag::Numeric, _) => "NUMERIC".to_string(),
            (TypeTag::Text, Dialect::MySql) => "CHAR".to_string(),
            (TypeTag::Text, _) => "TEXT".to_string(),
            (TypeTag::Boolean, Dialect::Postgres) => "BOOLEAN".to_string(),
            (TypeTag::Boolean, Dialect::MySql) => "UNSIGNED".to_string(),
            (TypeTag::Boolean, Dialect::Sqlite) => "INTEGER".to_string(),
            (TypeTag::Blob, Dialect::Postgres) => "BYTEA".to_string(),
            (TypeTag::Blob, Dialect::MySql) => "BINARY".to_string(),
            (TypeTag::Blob, Dialect::Sqlite) => "BLOB".to_string(),
            (TypeTag::Timestamp, Dialect::MySql) => "DATETIME".to_string(),
            (TypeTag::Timestamp, _) => "TIMESTAMP".to_string(),
            (TypeTag::Date, _) => "DATE".to_string(),
            (TypeTag::Time, _) => "TIME".to_string(),
            (TypeTag::Json, Dialect::Postgres) => "JSONB".to_string(),
            (TypeTag::Json, Dialect::MySql) => "JSON".to_string(),
            (TypeTag::Json, Dialect::Sqlite) => "TEXT".to_string(),
            (TypeTag::Uuid, Dialect::Postgres) => "UUID".to_string(),
            (TypeTag::Uuid, Dialect::MySql) => "CHAR".to_string(),
            (TypeTag::Uuid, Dialect::Sqlite) => "TEXT".to_string(),
            (TypeTag::Other(name), _) => name.clone(),
        }
    }
}

impl std::fmt::Display for TypeTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeTag::Integer => write!(f, "integer"),
            TypeTag::Real => write!(f, "real"),
            TypeTag::Numeric => write!(f, "numeric"),
            TypeTag::Text => write!(f, "text"),
            TypeTag::Boolean => write!(f, "boolean"),
            TypeTag::Blob => write!(f, "blob"),
            TypeTag::Timestamp => write!(f, "timestamp"),
            TypeTag::Date => write!(f, "date"),
            TypeTag::Time => write!(f, "time"),
            TypeTag::Json => write!(f, "json"),
            TypeTag::Uuid => write!(f, "uuid"),
            TypeTag::Other(name) => write!(f, "{}", name.to_ascii_lowercase()),
        }
    }
}

/// SQL dialect a plan is generated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    /// Embedded, file-backed SQLite.
    #[default]
    Sqlite,
    /// PostgreSQL server.
    Postgres,
    /// MySQL / MariaDB server.
    MySql,
}

impl Dialect {
    /// Whether the database lives in a local file (and so needs a disk check).
    pub fn is_file_based(self) -> bool {
        matches!(self, Dialect::Sqlite)
    }

    /// Whether `ALTER TABLE ... ALTER COLUMN ... TYPE` (or equivalent) exists.
    pub fn supports_alter_column_type(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }

    /// Whether `ALTER TABLE ... ADD COLUMN` exists.
    pub fn supports_add_column(self) -> bool {
        true
    }

    /// Whether `ALTER TABLE ... DROP COLUMN` exists (SQLite 3.35+).
    pub fn supports_drop_column(self) -> bool {
        true
    }

    /// Whether foreign keys can be added to or dropped from an existing table.
    pub fn supports_alter_foreign_keys(self) -> bool {
        !matches!(self, Dialect::Sqlite)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Sqlite => write!(f, "sqlite"),
            Dialect::Postgres => write!(f, "postgres"),
            Dialect::MySql => write!(f, "mysql"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_spellings_normalize_to_text() {
        for raw in ["VARCHAR", "varchar(255)", "TEXT", "STRING", "character varying(40)", "CHAR(2)"] {
            assert_eq!(TypeTag::normalize(raw), TypeTag::Text, "{raw}");
        }
    }

    #[test]
    fn test_integer_spellings_normalize_to_integer() {
        for raw in ["INT", "integer", "BIGINT", "int8", "serial", "INT UNSIGNED", "tinyint(1)"] {
            assert_eq!(TypeTag::normalize(raw), TypeTag::Integer, "{raw}");
        }
    }

    #[test]
    fn test_precision_is_ignored() {
        assert_eq!(TypeTag::normalize("NUMERIC(10, 2)"), TypeTag::normalize("decimal"));
        assert_eq!(
            TypeTag::normalize("timestamp with time zone"),
            TypeTag::Timestamp
        );
    }

    #[test]
    fn test_unknown_type_keeps_name() {
        assert_eq!(
            TypeTag::normalize("geometry(Point)"),
            TypeTag::Other("GEOMETRY".into())
        );
        assert_eq!(TypeTag::normalize("geometry").to_string(), "geometry");
    }

    #[test]
    fn test_varchar_and_integer_differ() {
        assert_ne!(TypeTag::normalize("VARCHAR"), TypeTag::normalize("INTEGER"));
    }

    #[test]
    fn test_dialect_capabilities() {
        assert!(Dialect::Sqlite.is_file_based());
        assert!(!Dialect::Sqlite.supports_alter_column_type());
        assert!(!Dialect::Sqlite.supports_alter_foreign_keys());
        assert!(Dialect::Postgres.supports_alter_column_type());
        assert!(!Dialect::Postgres.is_file_based());
        assert_eq!(TypeTag::Integer.cast_target(Dialect::MySql), "SIGNED");
        assert_eq!(TypeTag::Real.cast_target(Dialect::Postgres), "DOUBLE PRECISION");
    }
}
