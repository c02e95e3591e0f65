use thiserror::Error;

#[derive(Error, Debug)]
pub enum LumosError {
    /// Malformed or missing source configuration. Never retried.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A source unit (file, object, table) could not be read or parsed.
    /// Transient causes keep their typed variant; this one is never retried.
    #[error("Extraction error: {0}")]
    Extraction(String),

    /// Writing to the destination store failed for good. Never retried.
    #[error("Load error: {0}")]
    Load(String),

    /// The compiler cannot translate a rule specification into SQL.
    #[error("Unsupported rule {rule_id}: {reason}")]
    UnsupportedRule { rule_id: String, reason: String },

    /// A compiled rule failed or timed out while running.
    #[error("Rule execution error: {0}")]
    RuleExecution(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Polars error: {0}")]
    Polars(String),

    #[error("Object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),
}

impl From<polars::error::PolarsError> for LumosError {
    fn from(err: polars::error::PolarsError) -> Self {
        LumosError::Polars(err.to_string())
    }
}

impl LumosError {
    /// Transient failures worth another attempt under the retry policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            LumosError::Io(err) => !matches!(
                err.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidInput
                    | std::io::ErrorKind::InvalidData
                    | std::io::ErrorKind::UnexpectedEof
            ),
            LumosError::ObjectStore(err) => !matches!(
                err,
                object_store::Error::NotFound { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::UnknownConfigurationKey { .. }
            ),
            LumosError::Database(sqlx::Error::Database(db)) => is_transient_database_error(db.as_ref()),
            LumosError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Protocol(_)
            ),
            _ => false,
        }
    }
}

/// Lock contention, serialization failures and lost connections reported
/// by the server, classified by SQLSTATE (Postgres) or result code (SQLite).
pub(crate) fn is_transient_database_error(db: &dyn sqlx::error::DatabaseError) -> bool {
    if let Some(pg) = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
        return is_transient_sqlstate(pg.code());
    }
    if db.try_downcast_ref::<sqlx::sqlite::SqliteError>().is_some() {
        return db
            .code()
            .and_then(|code| code.parse::<u32>().ok())
            .is_some_and(is_transient_sqlite_code);
    }
    false
}

/// Connection exceptions (class 08), serialization failure, deadlock,
/// too many connections and server shutdown
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08") || matches!(code, "40001" | "40P01" | "53300" | "57P01" | "57P02" | "57P03")
}

/// SQLITE_BUSY and SQLITE_LOCKED, including their extended codes
fn is_transient_sqlite_code(code: u32) -> bool {
    matches!(code & 0xff, 5 | 6)
}

pub type Result<T> = std::result::Result<T, LumosError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_errors_are_not_retryable() {
        let err = LumosError::Configuration("missing path".to_string());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_string_errors_are_never_retried() {
        assert!(!LumosError::Load("database is locked".to_string()).is_retryable());
        assert!(!LumosError::Extraction("connection reset by peer".to_string()).is_retryable());
    }

    #[test]
    fn test_typed_errors_are_classified_by_kind() {
        use std::io::{Error, ErrorKind};
        assert!(LumosError::Database(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!LumosError::Database(sqlx::Error::RowNotFound).is_retryable());
        assert!(LumosError::Io(Error::from(ErrorKind::ConnectionReset)).is_retryable());
        assert!(LumosError::Io(Error::from(ErrorKind::TimedOut)).is_retryable());
        assert!(!LumosError::Io(Error::from(ErrorKind::NotFound)).is_retryable());
    }

    #[test]
    fn test_server_codes() {
        assert!(is_transient_sqlstate("40001"));
        assert!(is_transient_sqlstate("40P01"));
        assert!(is_transient_sqlstate("08006"));
        assert!(!is_transient_sqlstate("23505"));
        assert!(!is_transient_sqlstate("42P01"));
        assert!(is_transient_sqlite_code(5));
        assert!(is_transient_sqlite_code(517));
        assert!(is_transient_sqlite_code(6));
        assert!(!is_transient_sqlite_code(19));
        assert!(!is_transient_sqlite_code(2067));
    }
}
