//! PostgreSQL destination: one schema per dataset

use crate::catalog::ColumnMetadata;
use crate::connectors::Record;
use crate::db::{cell_text, column_list, rows_per_statement, Destination, FillCounts, SqlDialect, SqlParam, TableRef};
use crate::error::Result;
use crate::ingestion::schema_inference::InferredType;
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, info};

const DIALECT: SqlDialect = SqlDialect::Postgres;

/// Storage class of an `information_schema.columns.data_type` value
fn storage_type(data_type: &str) -> Option<InferredType> {
    match data_type.to_ascii_lowercase().as_str() {
        "boolean" => Some(InferredType::Boolean),
        "bigint" | "integer" | "smallint" => Some(InferredType::Integer),
        "double precision" | "real" | "numeric" => Some(InferredType::Float),
        "date" => Some(InferredType::Date),
        "text" | "character varying" | "character" => Some(InferredType::String),
        _ => None,
    }
}

/// Target type when an existing column must be altered for `wanted`.
/// Columns are only ever widened; a narrower wanted type keeps the column.
fn widened_type(data_type: &str, wanted: InferredType) -> Option<InferredType> {
    let current = storage_type(data_type)?;
    let wanted = wanted.storage_class();
    current.widens_to(wanted).then_some(wanted)
}

/// Type inserted values are cast to: the physical column type when known
fn insert_type(existing: Option<&str>, wanted: InferredType) -> &'static str {
    DIALECT.column_type(existing.and_then(storage_type).unwrap_or(wanted))
}

pub struct PostgresDestination {
    pool: PgPool,
}

impl PostgresDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `(column_name, data_type)` in ordinal order; empty when the table
    /// does not exist
    async fn existing_columns(&self, table: &TableRef) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query_as::<_, (String, String)>(
            r#"
            SELECT column_name::text, data_type::text
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2
            ORDER BY ordinal_position
            "#,
        )
        .bind(&table.dataset)
        .bind(&table.table)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl Destination for PostgresDestination {
    fn dialect(&self) -> SqlDialect {
        DIALECT
    }

    async fn ensure_dataset(&self, dataset: &str) -> Result<()> {
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            DIALECT.quote_ident(dataset)
        ))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sync_table(&self, table: &TableRef, columns: &[ColumnMetadata]) -> Result<()> {
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
        for column in columns {
            let wanted = DIALECT.column_type(column.inferred_type);
            let ident = DIALECT.quote_ident(&column.column_name);
            match existing.iter().find(|(name, _)| *name == column.column_name) {
                None => {
                    sqlx::query(&format!(
                        "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {} {}",
                        qualified, ident, wanted
                    ))
                    .execute(&mut *tx)
                    .await?;
                    info!(table = %table, column = %column.column_name, "Added column");
                }
                Some((_, current)) => match widened_type(current, column.inferred_type) {
                    Some(target) => {
                        let target_sql = DIALECT.column_type(target);
                        sqlx::query(&format!(
                            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}",
                            qualified,
                            ident,
                            target_sql,
                            DIALECT.cast(&ident, target)
                        ))
                        .execute(&mut *tx)
                        .await?;
                        info!(table = %table, column = %column.column_name, from = %current, to = target_sql, "Widened column");
                    }
                    None if !current.eq_ignore_ascii_case(wanted) => {
                        debug!(table = %table, column = %column.column_name, existing = %current, inferred = wanted, "Keeping wider column type");
                    }
                    None => {}
                },
            }
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
        let chunk_rows = rows_per_statement(batch_size, columns.len());
        let existing = self.existing_columns(table).await?;
        let cast_types: Vec<&'static str> = columns
            .iter()
            .map(|c| {
                let physical = existing
                    .iter()
                    .find(|(name, _)| *name == c.column_name)
                    .map(|(_, data_type)| data_type.as_str());
                insert_type(physical, c.inferred_type)
            })
            .collect();

        let mut tx = self.pool.begin().await?;
        let mut written = 0u64;
        for chunk in records.chunks(chunk_rows) {
            // Values travel as text and are cast server-side to the column type
            let mut index = 0;
            let tuples = chunk
                .iter()
                .map(|_| {
                    let cells = cast_types
                        .iter()
                        .map(|ty| {
                            index += 1;
                            format!("CAST({} AS {})", DIALECT.placeholder(index), ty)
                        })
                        .collect::<Vec<_>>()
                        .join(", ");
                    format!("({})", cells)
                })
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("{}{}", prefix, tuples);

            let mut query = sqlx::query(&sql);
            for record in chunk {
                for column in columns {
                    query = query.bind(record.get(&column.column_name).and_then(cell_text));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_column_is_never_narrowed() {
        assert_eq!(widened_type("text", InferredType::Integer), None);
        assert_eq!(widened_type("double precision", InferredType::Integer), None);
        assert_eq!(widened_type("text", InferredType::Categorical), None);
        assert_eq!(insert_type(Some("text"), InferredType::Integer), "TEXT");
        assert_eq!(insert_type(Some("double precision"), InferredType::Integer), "DOUBLE PRECISION");
    }

    #[test]
    fn test_existing_column_widens() {
        assert_eq!(widened_type("bigint", InferredType::Float), Some(InferredType::Float));
        assert_eq!(widened_type("bigint", InferredType::String), Some(InferredType::String));
        assert_eq!(widened_type("date", InferredType::Categorical), Some(InferredType::String));
        assert_eq!(widened_type("bigint", InferredType::Integer), None);
        assert_eq!(widened_type("USER-DEFINED", InferredType::String), None);
        assert_eq!(insert_type(None, InferredType::Boolean), "BOOLEAN");
        assert_eq!(insert_type(Some("ARRAY"), InferredType::String), "TEXT");
    }
}
