//! Source configuration normalization
//!
//! Pure transformation from a loosely-shaped source configuration into a
//! canonical [`ExtractionRequest`]. Canonical means: trailing separators
//! stripped from paths and URLs, glob defaulting to match-all, and a
//! relational table filter that is deduplicated and sorted so identity
//! derivation does not depend on the order tables were listed in.

use crate::connectors::{Credentials, ExtractionRequest, FileFormat, Selector, SourceKind};
use crate::error::{LumosError, Result};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use sqlx::sqlite::SqliteConnectOptions;
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use url::Url;

/// Source configuration as supplied by the CLI / config layer
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawSourceConfig {
    /// Filesystem: file or directory path
    pub path: Option<String>,
    /// Object store: bucket URL, e.g. `s3://bucket/prefix`
    pub bucket_url: Option<String>,
    /// Relational: `postgres://...` or `sqlite:...`
    pub connection_string: Option<String>,

    pub file_glob: Option<String>,
    pub file_format: Option<String>,
    pub recursive: Option<bool>,

    pub schema: Option<String>,
    pub tables: Option<Vec<String>>,

    #[serde(skip_serializing)]
    pub credentials: BTreeMap<String, String>,

    /// Destination table override
    pub table_name: Option<String>,
    /// Destination dataset (schema) override
    pub dataset_name: Option<String>,
}

pub struct SourceConfigNormalizer;

impl SourceConfigNormalizer {
    pub fn normalize(raw: &RawSourceConfig, source_kind: SourceKind) -> Result<ExtractionRequest> {
        let (location, selector) = match source_kind {
            SourceKind::Filesystem => {
                let path = Self::mandatory(&raw.path, "path", source_kind)?;
                (Self::strip_trailing_separators(&path), Self::file_selector(raw)?)
            }
            SourceKind::ObjectStore => {
                let bucket_url = Self::mandatory(&raw.bucket_url, "bucket_url", source_kind)?;
                let location = Self::strip_trailing_separators(&bucket_url);
                Self::validate_bucket_url(&location)?;
                (location, Self::file_selector(raw)?)
            }
            SourceKind::Relational => {
                let conn = Self::mandatory(&raw.connection_string, "connection_string", source_kind)?;
                Self::validate_connection_string(&conn)?;
                (conn, Self::table_selector(raw)?)
            }
        };

        Ok(ExtractionRequest {
            source_kind,
            location,
            selector,
            credentials: Credentials::new(raw.credentials.clone()),
            requested_destination_table: Self::non_empty(&raw.table_name),
            requested_dataset: Self::non_empty(&raw.dataset_name),
        })
    }

    fn mandatory(value: &Option<String>, field: &str, kind: SourceKind) -> Result<String> {
        Self::non_empty(value).ok_or_else(|| {
            LumosError::Configuration(format!(
                "Missing required field '{}' for {} source",
                field, kind
            ))
        })
    }

    fn non_empty(value: &Option<String>) -> Option<String> {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Strip trailing `/` and `\` but never reduce a root or scheme to nothing.
    pub fn strip_trailing_separators(location: &str) -> String {
        let trimmed = location.trim();
        let stripped = trimmed.trim_end_matches(['/', '\\']);
        if stripped.is_empty() {
            return trimmed.chars().take(1).collect();
        }
        if stripped.ends_with(':') {
            // "s3://" or "C:\" - keep the separator that makes it meaningful
            return trimmed.to_string();
        }
        stripped.to_string()
    }

    fn file_selector(raw: &RawSourceConfig) -> Result<Selector> {
        let glob = Self::non_empty(&raw.file_glob).unwrap_or_else(|| "*".to_string());
        glob::Pattern::new(&glob).map_err(|e| {
            LumosError::Configuration(format!("Invalid file_glob '{}': {}", glob, e))
        })?;

        let format = match Self::non_empty(&raw.file_format) {
            Some(f) => Some(FileFormat::from_str(&f)?),
            None => None,
        };

        Ok(Selector::Files {
            glob,
            format,
            recursive: raw.recursive.unwrap_or(true),
        })
    }

    fn table_selector(raw: &RawSourceConfig) -> Result<Selector> {
        let schema = Self::non_empty(&raw.schema).unwrap_or_else(|| "public".to_string());

        let tables: BTreeSet<String> = raw
            .tables
            .iter()
            .flatten()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        Ok(Selector::Tables {
            schema,
            tables: tables.into_iter().collect(),
        })
    }

    fn validate_bucket_url(location: &str) -> Result<()> {
        let url = Url::parse(location).map_err(|e| {
            LumosError::Configuration(format!("Invalid bucket_url '{}': {}", location, e))
        })?;
        object_store::ObjectStoreScheme::parse(&url).map_err(|e| {
            LumosError::Configuration(format!(
                "Unsupported object store URL '{}': {}",
                location, e
            ))
        })?;
        Ok(())
    }

    /// The connection string must parse as a Postgres or SQLite descriptor
    /// before anything tries to use it.
    pub fn validate_connection_string(conn: &str) -> Result<()> {
        if conn.starts_with("postgres://") || conn.starts_with("postgresql://") {
            PgConnectOptions::from_str(conn).map_err(|e| {
                LumosError::Configuration(format!("Invalid PostgreSQL connection string: {}", e))
            })?;
            Ok(())
        } else if conn.starts_with("sqlite:") {
            SqliteConnectOptions::from_str(conn).map_err(|e| {
                LumosError::Configuration(format!("Invalid SQLite connection string: {}", e))
            })?;
            Ok(())
        } else {
            Err(LumosError::Configuration(
                "Invalid connection string format: expected postgres://, postgresql:// or sqlite:"
                    .to_string(),
            ))
        }
    }
}
