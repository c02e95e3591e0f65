//! Relational connector - reads tables from a Postgres or SQLite database
//!
//! Rows come back as JSON objects (`row_to_json` / `json_object`) so they go
//! through the same schema inference as file payloads.

use crate::connectors::formats::flatten_into;
use crate::connectors::normalizer::SourceConfigNormalizer;
use crate::connectors::{ExtractionRequest, Record, Selector, SourceConnector, SourceKind, SourceUnit};
use crate::db::SqlDialect;
use crate::error::{is_transient_database_error, LumosError, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

const SOURCE_POOL_SIZE: u32 = 4;

enum SourcePool {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

pub struct RelationalConnector {
    pool: SourcePool,
    schema: String,
    tables: Vec<String>,
}

impl RelationalConnector {
    /// Builds a lazily-connecting pool; nothing touches the network until
    /// the first discover/extract call.
    pub fn from_request(request: &ExtractionRequest) -> Result<Self> {
        let (schema, tables) = match &request.selector {
            Selector::Tables { schema, tables } => (schema.clone(), tables.clone()),
            Selector::Files { .. } => {
                return Err(LumosError::Configuration(
                    "Relational source requires a table selector".to_string(),
                ))
            }
        };

        SourceConfigNormalizer::validate_connection_string(&request.location)?;

        let pool = if request.location.starts_with("sqlite:") {
            let options = SqliteConnectOptions::from_str(&request.location)
                .map_err(|e| LumosError::Configuration(format!("Invalid SQLite connection string: {}", e)))?
                .read_only(true);
            SourcePool::Sqlite(
                SqlitePoolOptions::new()
                    .max_connections(SOURCE_POOL_SIZE)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect_lazy_with(options),
            )
        } else {
            let mut options = PgConnectOptions::from_str(&request.location)
                .map_err(|e| LumosError::Configuration(format!("Invalid PostgreSQL connection string: {}", e)))?;
            if let Some(password) = request.credentials.get("password") {
                options = options.password(password);
            }
            SourcePool::Postgres(
                PgPoolOptions::new()
                    .max_connections(SOURCE_POOL_SIZE)
                    .acquire_timeout(Duration::from_secs(30))
                    .connect_lazy_with(options),
            )
        };

        Ok(Self {
            pool,
            schema,
            tables,
        })
    }

    fn dialect(&self) -> SqlDialect {
        match self.pool {
            SourcePool::Postgres(_) => SqlDialect::Postgres,
            SourcePool::Sqlite(_) => SqlDialect::Sqlite,
        }
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let names = match &self.pool {
            SourcePool::Postgres(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT table_name::text FROM information_schema.tables \
                     WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
                )
                .bind(&self.schema)
                .fetch_all(pool)
                .await?
            }
            SourcePool::Sqlite(pool) => {
                sqlx::query_scalar::<_, String>(
                    "SELECT name FROM sqlite_master \
                     WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                )
                .fetch_all(pool)
                .await?
            }
        };
        Ok(names)
    }

    async fn fetch_json_rows(&self, table: &str) -> Result<Vec<String>> {
        let dialect = self.dialect();
        let rows = match &self.pool {
            SourcePool::Postgres(pool) => {
                let sql = format!(
                    "SELECT row_to_json(t)::text FROM {}.{} AS t",
                    dialect.quote_ident(&self.schema),
                    dialect.quote_ident(table)
                );
                sqlx::query_scalar::<_, String>(&sql).fetch_all(pool).await?
            }
            SourcePool::Sqlite(pool) => {
                let columns: Vec<String> = sqlx::query(&format!(
                    "SELECT name FROM pragma_table_info({})",
                    dialect.quote_literal(table)
                ))
                .fetch_all(pool)
                .await?
                .iter()
                .map(|row| row.try_get::<String, _>(0))
                .collect::<std::result::Result<_, _>>()?;

                if columns.is_empty() {
                    return Err(LumosError::Extraction(format!("Table {} not found", table)));
                }

                let pairs = columns
                    .iter()
                    .map(|c| format!("{}, {}", dialect.quote_literal(c), dialect.quote_ident(c)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let sql = format!(
                    "SELECT json_object({}) FROM {}",
                    pairs,
                    dialect.quote_ident(table)
                );
                sqlx::query_scalar::<_, String>(&sql).fetch_all(pool).await?
            }
        };
        Ok(rows)
    }
}

#[async_trait]
impl SourceConnector for RelationalConnector {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Relational
    }

    async fn discover(&self) -> Result<Vec<SourceUnit>> {
        let available = self.list_tables().await?;

        let selected: Vec<String> = if self.tables.is_empty() {
            available
        } else {
            let missing: Vec<&String> =
                self.tables.iter().filter(|t| !available.contains(t)).collect();
            if !missing.is_empty() {
                info!(schema = %self.schema, ?missing, "Requested tables not found in source");
            }
            // Missing tables still become units so they surface as failed units
            self.tables.clone()
        };

        info!(schema = %self.schema, tables = selected.len(), "Discovered source tables");
        Ok(selected
            .into_iter()
            .map(|table| SourceUnit {
                locator: format!("{}.{}", self.schema, table),
                name: table,
                format: None,
            })
            .collect())
    }

    async fn extract(&self, unit: &SourceUnit) -> Result<Vec<Record>> {
        let rows = self.fetch_json_rows(&unit.name).await.map_err(|e| match e {
            LumosError::Database(sqlx::Error::Database(db)) if !is_transient_database_error(db.as_ref()) => {
                LumosError::Extraction(format!("{}: {}", unit.locator, db))
            }
            other => other,
        })?;

        rows.into_iter()
            .map(|text| match serde_json::from_str::<Value>(&text)? {
                Value::Object(obj) => {
                    let mut record = Record::new();
                    flatten_into("", obj, &mut record);
                    Ok(record)
                }
                _ => Err(LumosError::Extraction(format!(
                    "{}: row is not a JSON object",
                    unit.locator
                ))),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::normalizer::RawSourceConfig;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn seed_sqlite(path: &std::path::Path) {
        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await.unwrap();
        sqlx::query("CREATE TABLE customers (id INTEGER, name TEXT, vip BOOLEAN)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO customers VALUES (1, 'Ann', 1), (2, NULL, 0)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("CREATE TABLE orders (id INTEGER, total REAL)")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;
    }

    fn request_for(path: &std::path::Path, tables: Option<Vec<&str>>) -> ExtractionRequest {
        let raw = RawSourceConfig {
            connection_string: Some(format!("sqlite://{}", path.display())),
            tables: tables.map(|t| t.into_iter().map(str::to_string).collect()),
            ..Default::default()
        };
        SourceConfigNormalizer::normalize(&raw, SourceKind::Relational).unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_discovery_and_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("source.db");
        seed_sqlite(&db).await;

        let connector = RelationalConnector::from_request(&request_for(&db, None)).unwrap();
        let units = connector.discover().await.unwrap();
        let names: Vec<_> = units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);

        let rows = connector.extract(&units[0]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["name"], Value::String("Ann".to_string()));
        assert_eq!(rows[1]["name"], Value::Null);
    }

    #[tokio::test]
    async fn test_missing_table_fails_its_unit_only() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("source.db");
        seed_sqlite(&db).await;

        let connector =
            RelationalConnector::from_request(&request_for(&db, Some(vec!["orders", "ghost"])))
                .unwrap();
        let units = connector.discover().await.unwrap();
        assert_eq!(units.len(), 2);

        let ghost = units.iter().find(|u| u.name == "ghost").unwrap();
        assert!(matches!(
            connector.extract(ghost).await,
            Err(LumosError::Extraction(_))
        ));
        let orders = units.iter().find(|u| u.name == "orders").unwrap();
        assert!(connector.extract(orders).await.unwrap().is_empty());
    }
}
