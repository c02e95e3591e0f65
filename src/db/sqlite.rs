//! SQLite destination: datasets are flattened into `{dataset}__{table}`
//!
//! SQLite columns are dynamically typed, so a widened column keeps its
//! declared affinity and new values are stored as they come.

use crate::catalog::ColumnMetadata;
use crate::connectors::Record;
use crate::db::{cell_text, column_list, rows_per_statement, Destination, FillCounts, SqlDialect, SqlParam, TableRef};
use crate::error::Result;
use crate::ingestion::schema_inference::InferredType;
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqliteArguments;
use sqlx::query::Query;
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, info};

const DIALECT: SqlDialect = SqlDialect::Sqlite;

pub struct SqliteDestination {
    pool: SqlitePool,
}

impl SqliteDestination {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn existing_columns(&self, table: &TableRef) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM pragma_table_info(?)")
            .bind(table.physical_name(DIALECT))
            .fetch_all(&self.pool)
            .await?;
        Ok(names)
    }
}

/// Binds a cell with the storage class of its column
fn bind_cell<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Option<&Value>,
    column_type: InferredType,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match (column_type.storage_class(), value) {
        (_, None | Some(Value::Null)) => query.bind(None::<String>),
        (InferredType::Boolean, Some(Value::Bool(b))) => query.bind(i64::from(*b)),
        (InferredType::Integer, Some(Value::Number(n))) if n.is_i64() => query.bind(n.as_i64()),
        (InferredType::Float, Some(Value::Number(n))) => query.bind(n.as_f64()),
        (_, Some(other)) => query.bind(cell_text(other)),
    }
}

#[async_trait]
impl Destination for SqliteDestination {
    fn dialect(&self) -> SqlDialect {
        DIALECT
    }

    async fn ensure_dataset(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }

    async fn sync_table(&self, table: &TableRef, columns: &[ColumnMetadata]) -> Result<()> {
        if columns.is_empty() {
            return Ok(());
        }
        let qualified = DIALECT.qualify(table);
        let existing = self.existing_columns(table).await?;

        if existing.is_empty() {
            let definitions = columns
                .iter()
                .map(|c| {
                    format!(
                        "{} {}",
                        DIALECT.quote_ident(&c.column_name),
                        DIALECT.column_type(c.inferred_type)
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            sqlx::query(&format!("CREATE TABLE IF NOT EXISTS {} ({})", qualified, definitions))
                .execute(&self.pool)
                .await?;
            info!(table = %table, columns = columns.len(), "Created table");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for column in columns.iter().filter(|c| !existing.contains(&c.column_name)) {
            sqlx::query(&format!(
                "ALTER TABLE {} ADD COLUMN {} {}",
                qualified,
                DIALECT.quote_ident(&column.column_name),
                DIALECT.column_type(column.inferred_type)
            ))
            .execute(&mut *tx)
            .await?;
            info!(table = %table, column = %column.column_name, "Added column");
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_records(
        &self,
        table: &TableRef,
        columns: &[ColumnMetadata],
        records: &[Record],
        batch_size: usize,
    ) -> Result<u64> {
        if records.is_empty() || columns.is_empty() {
            return Ok(0);
        }

        let prefix = format!(
            "INSERT INTO {} ({}) VALUES ",
            DIALECT.qualify(table),
            column_list(DIALECT, columns)
        );
        let tuple = format!("({})", vec!["?"; columns.len()].join(", "));
        let chunk_rows = rows_per_statement(batch_size, columns.len());

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in records.chunks(chunk_rows) {
            let sql = format!("{}{}", prefix, vec![tuple.as_str(); chunk.len()].join(", "));
            let mut query = sqlx::query(&sql);
            for record in chunk {
                for column in columns {
                    query = bind_cell(query, record.get(&column.column_name), column.inferred_type);
                }
            }
            written += query.execute(&mut *tx).await?.rows_affected();
        }
        tx.commit().await?;

        debug!(table = %table, rows = written, "Inserted records");
        Ok(written)
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", DIALECT.qualify(table));
        self.count(&sql, &[]).await
    }

    async fn count(&self, sql: &str, params: &[SqlParam]) -> Result<u64> {
        let mut query = sqlx::query_scalar::<_, i64>(sql);
        for param in params {
            query = match param {
                SqlParam::Text(s) => query.bind(s.clone()),
                SqlParam::Integer(i) => query.bind(*i),
                SqlParam::Float(f) => query.bind(*f),
            };
        }
        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn sample(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Option<String>>> {
        let mut query = sqlx::query_scalar::<_, Option<String>>(sql);
        for param in params {
            query = match param {
                SqlParam::Text(s) => query.bind(s.clone()),
                SqlParam::Integer(i) => query.bind(*i),
                SqlParam::Float(f) => query.bind(*f),
            };
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn fill_counts(&self, table: &TableRef, columns: &[String]) -> Result<FillCounts> {
        let counts = std::iter::once("COUNT(*)".to_string())
            .chain(
                columns
                    .iter()
                    .map(|c| format!("COUNT({})", DIALECT.quote_ident(c))),
            )
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("SELECT {} FROM {}", counts, DIALECT.qualify(table));
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;

        let row_count = row.try_get::<i64, _>(0)?.max(0) as u64;
        let non_null = (1..=columns.len())
            .map(|i| row.try_get::<i64, _>(i).map(|n| n.max(0) as u64))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(FillCounts { row_count, non_null })
    }
}
