//! Database connection management using sqlx

use crate::config::DestinationConfig;
use crate::db::{Destination, PostgresDestination, SqlDialect, SqliteDestination};
use crate::error::{LumosError, Result};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Initialize a PostgreSQL connection pool
pub async fn init_pg_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<PgPool> {
    let options = PgConnectOptions::from_str(database_url)
        .map_err(|e| LumosError::Configuration(format!("Invalid PostgreSQL URL: {}", e)))?;

    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

/// Initialize a SQLite connection pool with REGEXP support. The file is
/// created when missing.
pub async fn init_sqlite_pool(
    database_url: &str,
    max_connections: u32,
    acquire_timeout: Duration,
) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| LumosError::Configuration(format!("Invalid SQLite URL: {}", e)))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .with_regexp();

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(acquire_timeout)
        .connect_with(options)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    Ok(pool)
}

/// Opens the destination named by `config.database_url`
pub async fn connect_destination(config: &DestinationConfig) -> Result<Arc<dyn Destination>> {
    let dialect = SqlDialect::from_url(&config.database_url).ok_or_else(|| {
        LumosError::Configuration(
            "Destination database_url must start with postgres://, postgresql:// or sqlite:"
                .to_string(),
        )
    })?;

    let destination: Arc<dyn Destination> = match dialect {
        SqlDialect::Postgres => {
            let pool = init_pg_pool(
                &config.database_url,
                config.max_connections,
                config.acquire_timeout,
            )
            .await?;
            Arc::new(PostgresDestination::new(pool))
        }
        SqlDialect::Sqlite => {
            let pool = init_sqlite_pool(
                &config.database_url,
                config.max_connections,
                config.acquire_timeout,
            )
            .await?;
            Arc::new(SqliteDestination::new(pool))
        }
    };

    info!(dialect = ?dialect, max_connections = config.max_connections, "Connected to destination");
    Ok(destination)
}
