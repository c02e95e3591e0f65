//! Destination store abstraction
//!
//! Loaded tables live in a relational store reached through sqlx. The
//! orchestrator writes through [`Destination`]; validation only issues
//! read-only parameterized SELECTs against one table at a time.

pub mod connection;
pub mod postgres;
pub mod sqlite;

pub use connection::{connect_destination, init_pg_pool, init_sqlite_pool};
pub use postgres::PostgresDestination;
pub use sqlite::SqliteDestination;

use crate::catalog::ColumnMetadata;
use crate::connectors::Record;
use crate::error::Result;
use crate::ingestion::schema_inference::InferredType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Largest bind-parameter count used in one statement
pub(crate) const MAX_BIND_PARAMS: usize = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Postgres,
    Sqlite,
}

impl SqlDialect {
    pub fn quote_ident(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    pub fn quote_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Fully qualified, quoted table reference
    pub fn qualify(&self, table: &TableRef) -> String {
        match self {
            SqlDialect::Postgres => format!(
                "{}.{}",
                self.quote_ident(&table.dataset),
                self.quote_ident(&table.table)
            ),
            SqlDialect::Sqlite => self.quote_ident(&table.physical_name(*self)),
        }
    }

    /// Bind placeholder for the 1-based parameter `index`
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${}", index),
            SqlDialect::Sqlite => "?".to_string(),
        }
    }

    pub fn column_type(&self, inferred: InferredType) -> &'static str {
        match (self, inferred.storage_class()) {
            (SqlDialect::Postgres, InferredType::Boolean) => "BOOLEAN",
            (SqlDialect::Postgres, InferredType::Integer) => "BIGINT",
            (SqlDialect::Postgres, InferredType::Float) => "DOUBLE PRECISION",
            (SqlDialect::Postgres, InferredType::Date) => "DATE",
            (SqlDialect::Postgres, _) => "TEXT",
            (SqlDialect::Sqlite, InferredType::Boolean | InferredType::Integer) => "INTEGER",
            (SqlDialect::Sqlite, InferredType::Float) => "REAL",
            (SqlDialect::Sqlite, _) => "TEXT",
        }
    }

    pub fn cast(&self, expr: &str, inferred: InferredType) -> String {
        format!("CAST({} AS {})", expr, self.column_type(inferred))
    }

    pub fn cast_text(&self, expr: &str) -> String {
        format!("CAST({} AS TEXT)", expr)
    }

    /// Text form of a column value, identical across dialects. SQLite keeps
    /// booleans as 0/1, which render as `true`/`false` like Postgres does.
    pub fn text_value(&self, expr: &str, inferred: InferredType) -> String {
        match (self, inferred) {
            (SqlDialect::Sqlite, InferredType::Boolean) => format!(
                "CASE {expr} WHEN 1 THEN 'true' WHEN 0 THEN 'false' ELSE {text} END",
                expr = expr,
                text = self.cast_text(expr)
            ),
            _ => self.cast_text(expr),
        }
    }

    /// Predicate true when the text expression `text` does not match the
    /// regex bound at `placeholder`
    pub fn regex_mismatch(&self, text: &str, placeholder: &str) -> String {
        match self {
            SqlDialect::Postgres => format!("NOT ({} ~ {})", text, placeholder),
            SqlDialect::Sqlite => format!("NOT ({} REGEXP {})", text, placeholder),
        }
    }

    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(SqlDialect::Postgres)
        } else if url.starts_with("sqlite:") {
            Some(SqlDialect::Sqlite)
        } else {
            None
        }
    }
}

/// A destination table: dataset (schema) plus table name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    pub fn new(dataset: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            table: table.into(),
        }
    }

    /// Parses `dataset.table`
    pub fn parse(qualified: &str) -> Option<Self> {
        let (dataset, table) = qualified.split_once('.')?;
        if dataset.is_empty() || table.is_empty() {
            return None;
        }
        Some(Self::new(dataset, table))
    }

    /// Name of the table object inside the store
    pub fn physical_name(&self, dialect: SqlDialect) -> String {
        match dialect {
            SqlDialect::Postgres => self.table.clone(),
            SqlDialect::Sqlite => format!("{}__{}", self.dataset, self.table),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.dataset, self.table)
    }
}

/// A bind parameter for a validation query
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SqlParam {
    Integer(i64),
    Float(f64),
    Text(String),
}

/// Null-fill counts for a set of columns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FillCounts {
    pub row_count: u64,
    /// Non-null values per requested column, same order
    pub non_null: Vec<u64>,
}

#[async_trait]
pub trait Destination: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Creates the dataset (schema) if the store has such a concept
    async fn ensure_dataset(&self, dataset: &str) -> Result<()>;

    /// Creates the table or evolves it to `columns`: new columns are added,
    /// widened columns change type. Never drops anything.
    async fn sync_table(&self, table: &TableRef, columns: &[ColumnMetadata]) -> Result<()>;

    /// Appends records in one transaction, `batch_size` rows per statement.
    /// Returns the number of rows written.
    async fn insert_records(
        &self,
        table: &TableRef,
        columns: &[ColumnMetadata],
        records: &[Record],
        batch_size: usize,
    ) -> Result<u64>;

    async fn row_count(&self, table: &TableRef) -> Result<u64>;

    /// Runs a single-value COUNT query
    async fn count(&self, sql: &str, params: &[SqlParam]) -> Result<u64>;

    /// Runs a single-column query; values are returned as text
    async fn sample(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Option<String>>>;

    async fn fill_counts(&self, table: &TableRef, columns: &[String]) -> Result<FillCounts>;
}

/// Text form of a cell for binding through a cast, `None` for null
pub(crate) fn cell_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Rows per INSERT statement so the bind count stays under the store limit
pub(crate) fn rows_per_statement(batch_size: usize, column_count: usize) -> usize {
    let by_params = MAX_BIND_PARAMS / column_count.max(1);
    batch_size.min(by_params).max(1)
}

/// Column list for a multi-row INSERT
pub(crate) fn column_list(dialect: SqlDialect, columns: &[ColumnMetadata]) -> String {
    columns
        .iter()
        .map(|c| dialect.quote_ident(&c.column_name))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quoting() {
        let d = SqlDialect::Postgres;
        assert_eq!(d.quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(d.quote_literal("O'Brien"), "'O''Brien'");
    }

    #[test]
    fn test_qualify_per_dialect() {
        let t = TableRef::new("filesystem_ab12", "states");
        assert_eq!(SqlDialect::Postgres.qualify(&t), "\"filesystem_ab12\".\"states\"");
        assert_eq!(SqlDialect::Sqlite.qualify(&t), "\"filesystem_ab12__states\"");
        assert_eq!(t.to_string(), "filesystem_ab12.states");
        assert_eq!(TableRef::parse("filesystem_ab12.states"), Some(t));
        assert_eq!(TableRef::parse("nodot"), None);
    }

    #[test]
    fn test_placeholders_and_types() {
        assert_eq!(SqlDialect::Postgres.placeholder(3), "$3");
        assert_eq!(SqlDialect::Sqlite.placeholder(3), "?");
        assert_eq!(SqlDialect::Postgres.column_type(InferredType::Categorical), "TEXT");
        assert_eq!(SqlDialect::Sqlite.column_type(InferredType::Boolean), "INTEGER");
        assert_eq!(SqlDialect::Postgres.cast("\"x\"", InferredType::Float), "CAST(\"x\" AS DOUBLE PRECISION)");
    }

    #[test]
    fn test_booleans_render_alike() {
        assert_eq!(SqlDialect::Postgres.text_value("\"ok\"", InferredType::Boolean), "CAST(\"ok\" AS TEXT)");
        assert_eq!(
            SqlDialect::Sqlite.text_value("\"ok\"", InferredType::Boolean),
            "CASE \"ok\" WHEN 1 THEN 'true' WHEN 0 THEN 'false' ELSE CAST(\"ok\" AS TEXT) END"
        );
        assert_eq!(SqlDialect::Sqlite.text_value("\"n\"", InferredType::Integer), "CAST(\"n\" AS TEXT)");
    }

    #[test]
    fn test_rows_per_statement() {
        assert_eq!(rows_per_statement(1000, 3), 1000);
        assert_eq!(rows_per_statement(1000, 300), 100);
        assert_eq!(rows_per_statement(0, 3), 1);
    }

    #[test]
    fn test_dialect_from_url() {
        assert_eq!(SqlDialect::from_url("postgresql://x/y"), Some(SqlDialect::Postgres));
        assert_eq!(SqlDialect::from_url("sqlite::memory:"), Some(SqlDialect::Sqlite));
        assert_eq!(SqlDialect::from_url("mysql://x"), None);
    }
}
