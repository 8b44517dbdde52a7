//! DDL/DML rendering.
//!
//! Identifiers are emitted bare when they are plain words and quoted
//! otherwise, so generated SQL reads like hand-written SQL.

use crate::schema::{ColumnDef, ColumnDefault, ConstraintDef, Dialect, TableDef, TypeTag};

const RESERVED: &[&str] = &[
    "all", "and", "as", "by", "check", "column", "constraint", "create", "default", "delete",
    "desc", "distinct", "drop", "from", "group", "having", "in", "index", "insert", "into", "key",
    "limit", "not", "null", "or", "order", "primary", "references", "select", "set", "table",
    "to", "union", "unique", "update", "user", "values", "where",
];

/// Quote an identifier if it is not a plain, non-reserved word.
pub fn quote_ident(name: &str, dialect: Dialect) -> String {
    let plain = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&name.to_ascii_lowercase().as_str());

    if plain {
        name.to_string()
    } else {
        match dialect {
            Dialect::MySql => format!("`{}`", name.replace('`', "``")),
            Dialect::Sqlite | Dialect::Postgres => format!("\"{}\"", name.replace('"', "\"\"")),
        }
    }
}

/// Bind parameter placeholder for the 1-based `index`.
pub fn placeholder(dialect: Dialect, index: usize) -> String {
    match dialect {
        Dialect::Sqlite => format!("?{index}"),
        Dialect::Postgres => format!("${index}"),
        Dialect::MySql => "?".to_string(),
    }
}

fn ident_list(names: &[String], dialect: Dialect) -> String {
    names
        .iter()
        .map(|n| quote_ident(n, dialect))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Column definition as used in `CREATE TABLE` and `ADD COLUMN`.
pub fn column_sql(column: &ColumnDef, inline_primary_key: bool, dialect: Dialect) -> String {
    let mut sql = format!("{} {}", quote_ident(&column.name, dialect), column.sql_type);
    if inline_primary_key {
        sql.push_str(" PRIMARY KEY");
    }
    if !column.nullable {
        sql.push_str(" NOT NULL");
    }
    if let Some(default) = &column.default {
        sql.push_str(" DEFAULT ");
        sql.push_str(&default.to_sql(dialect));
    }
    sql
}

/// `CREATE TABLE` for a table definition under the given name.
///
/// Unique constraints are not part of the statement; see
/// [`create_unique_indexes`].
pub fn create_table_as(table: &TableDef, name: &str, dialect: Dialect) -> String {
    let pk = table.primary_key();
    let inline_pk = pk.len() == 1;

    let mut parts: Vec<String> = table
        .columns
        .iter()
        .map(|c| column_sql(c, inline_pk && c.primary_key, dialect))
        .collect();

    if pk.len() > 1 {
        let names: Vec<String> = pk.iter().map(|c| c.name.clone()).collect();
        parts.push(format!("PRIMARY KEY ({})", ident_list(&names, dialect)));
    }

    for constraint in &table.constraints {
        if let ConstraintDef::ForeignKey { .. } = constraint {
            parts.push(foreign_key_clause(constraint, dialect));
        }
    }

    format!(
        "CREATE TABLE {} ({})",
        quote_ident(name, dialect),
        parts.join(", ")
    )
}

/// `CREATE TABLE` for a table definition.
pub fn create_table(table: &TableDef, dialect: Dialect) -> String {
    create_table_as(table, &table.name, dialect)
}

/// `CREATE UNIQUE INDEX` statements for every unique constraint of a table.
pub fn create_unique_indexes(table: &TableDef, dialect: Dialect) -> Vec<String> {
    table
        .unique_constraints()
        .map(|c| create_unique_index(&table.name, c, dialect))
        .collect()
}

/// Stored `CREATE INDEX` statements of a table's secondary indexes, skipping
/// indexes on columns the table no longer has.
pub fn restore_indexes(table: &TableDef) -> Vec<String> {
    table.restorable_indexes().map(|i| i.sql.clone()).collect()
}

/// `DROP TABLE`.
pub fn drop_table(name: &str, dialect: Dialect) -> String {
    format!("DROP TABLE {}", quote_ident(name, dialect))
}

/// `ALTER TABLE ... RENAME TO`.
pub fn rename_table(from: &str, to: &str, dialect: Dialect) -> String {
    format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(from, dialect),
        quote_ident(to, dialect)
    )
}

/// `ALTER TABLE ... ADD COLUMN`.
pub fn add_column(table: &str, column: &ColumnDef, dialect: Dialect) -> String {
    format!(
        "ALTER TABLE {} ADD COLUMN {}",
        quote_ident(table, dialect),
        column_sql(column, false, dialect)
    )
}

/// `ALTER TABLE ... DROP COLUMN`.
pub fn drop_column(table: &str, column: &str, dialect: Dialect) -> String {
    format!(
        "ALTER TABLE {} DROP COLUMN {}",
        quote_ident(table, dialect),
        quote_ident(column, dialect)
    )
}

/// In-place column type change, for dialects that support it.
pub fn alter_column_type(table: &str, column: &ColumnDef, dialect: Dialect) -> Option<String> {
    let table = quote_ident(table, dialect);
    let name = quote_ident(&column.name, dialect);
    match dialect {
        Dialect::Postgres => Some(format!(
            "ALTER TABLE {table} ALTER COLUMN {name} TYPE {ty} USING {name}::{ty}",
            ty = column.sql_type
        )),
        Dialect::MySql => Some(format!(
            "ALTER TABLE {table} MODIFY COLUMN {}",
            column_sql(column, false, dialect)
        )),
        Dialect::Sqlite => None,
    }
}

/// `CREATE UNIQUE INDEX` for a unique constraint.
pub fn create_unique_index(table: &str, constraint: &ConstraintDef, dialect: Dialect) -> String {
    format!(
        "CREATE UNIQUE INDEX {} ON {} ({})",
        quote_ident(constraint.name(), dialect),
        quote_ident(table, dialect),
        ident_list(constraint.columns(), dialect)
    )
}

/// `DROP INDEX`.
pub fn drop_index(table: &str, name: &str, dialect: Dialect) -> String {
    match dialect {
        Dialect::MySql => format!(
            "DROP INDEX {} ON {}",
            quote_ident(name, dialect),
            quote_ident(table, dialect)
        ),
        Dialect::Sqlite | Dialect::Postgres => format!("DROP INDEX {}", quote_ident(name, dialect)),
    }
}

fn foreign_key_clause(constraint: &ConstraintDef, dialect: Dialect) -> String {
    match constraint {
        ConstraintDef::ForeignKey {
            name,
            columns,
            references_table,
            references_columns,
        } => {
            let body = format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                ident_list(columns, dialect),
                quote_ident(references_table, dialect),
                ident_list(references_columns, dialect)
            );
            match dialect {
                // SQLite does not keep constraint names.
                Dialect::Sqlite => body,
                Dialect::Postgres | Dialect::MySql => {
                    format!("CONSTRAINT {} {}", quote_ident(name, dialect), body)
                }
            }
        }
        ConstraintDef::Unique { name, columns, .. } => format!(
            "CONSTRAINT {} UNIQUE ({})",
            quote_ident(name, dialect),
            ident_list(columns, dialect)
        ),
    }
}

/// `ALTER TABLE ... ADD CONSTRAINT` for a foreign key.
pub fn add_foreign_key(table: &str, constraint: &ConstraintDef, dialect: Dialect) -> String {
    format!(
        "ALTER TABLE {} ADD {}",
        quote_ident(table, dialect),
        foreign_key_clause(constraint, dialect)
    )
}

/// `ALTER TABLE ... DROP CONSTRAINT` (or `DROP FOREIGN KEY` on MySQL).
pub fn drop_foreign_key(table: &str, name: &str, dialect: Dialect) -> String {
    let keyword = match dialect {
        Dialect::MySql => "FOREIGN KEY",
        Dialect::Sqlite | Dialect::Postgres => "CONSTRAINT",
    };
    format!(
        "ALTER TABLE {} DROP {} {}",
        quote_ident(table, dialect),
        keyword,
        quote_ident(name, dialect)
    )
}

/// `UPDATE ... SET c = v WHERE c IS NULL`.
pub fn backfill_update(table: &str, column: &str, value: &ColumnDefault, dialect: Dialect) -> String {
    let column = quote_ident(column, dialect);
    format!(
        "UPDATE {} SET {column} = {} WHERE {column} IS NULL",
        quote_ident(table, dialect),
        value.to_sql(dialect)
    )
}

/// Expression producing `target`'s value from the `source` table's columns.
fn copy_expression(target: &ColumnDef, source: &TableDef, dialect: Dialect) -> String {
    match source.column(&target.name) {
        Some(existing) if existing.type_tag() == target.type_tag() => {
            quote_ident(&target.name, dialect)
        }
        Some(_) => format!(
            "CAST({} AS {})",
            quote_ident(&target.name, dialect),
            target.type_tag().cast_target(dialect)
        ),
        None => match &target.default {
            Some(default) => default.to_sql(dialect),
            None if target.nullable => "NULL".to_string(),
            None => zero_value(&target.type_tag()).to_string(),
        },
    }
}

/// Placeholder for NOT NULL columns that have no source and no default.
fn zero_value(tag: &TypeTag) -> &'static str {
    match tag {
        TypeTag::Integer | TypeTag::Boolean => "0",
        TypeTag::Real | TypeTag::Numeric => "0.0",
        TypeTag::Blob => "X''",
        _ => "''",
    }
}

/// `INSERT INTO new (cols) SELECT <mapping> FROM old`.
///
/// Every column is listed explicitly; type changes are converted with
/// `CAST`.
pub fn copy_rows(
    from_name: &str,
    source: &TableDef,
    into_name: &str,
    target: &TableDef,
    dialect: Dialect,
) -> String {
    let names: Vec<String> = target.columns.iter().map(|c| c.name.clone()).collect();
    let mapping: Vec<String> = target
        .columns
        .iter()
        .map(|c| copy_expression(c, source, dialect))
        .collect();

    format!(
        "INSERT INTO {} ({}) SELECT {} FROM {}",
        quote_ident(into_name, dialect),
        ident_list(&names, dialect),
        mapping.join(", "),
        quote_ident(from_name, dialect)
    )
}

/// Transaction start statement.
pub const BEGIN: &str = "BEGIN TRANSACTION";
/// Transaction end statement.
pub const COMMIT: &str = "COMMIT";

/// Full Copy-Swap-Drop sequence rebuilding `source` into `target`.
///
/// Unique constraints, inline ones included, come back as unique indexes and
/// secondary indexes are replayed from their stored SQL. Foreign keys of
/// other tables keep pointing at the table name; the executor keeps them
/// from cascading while the old table is dropped.
pub fn copy_swap_drop(
    source: &TableDef,
    target: &TableDef,
    suffix: &str,
    dialect: Dialect,
) -> Vec<String> {
    let temp = format!("{}_new_{}", target.name, suffix);
    let mut statements = vec![
        BEGIN.to_string(),
        create_table_as(target, &temp, dialect),
        copy_rows(&source.name, source, &temp, target, dialect),
        drop_table(&source.name, dialect),
        rename_table(&temp, &target.name, dialect),
    ];
    statements.extend(create_unique_indexes(target, dialect));
    statements.extend(restore_indexes(target));
    statements.push(COMMIT.to_string());
    statements
}
