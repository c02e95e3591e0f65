//! Source connectors
//!
//! Normalizes the three source kinds (local files, object storage,
//! relational databases) into one [`ExtractionRequest`] and reads records
//! from it through the [`SourceConnector`] trait:
//! - `normalizer`: raw configuration -> ExtractionRequest
//! - `identity`: ExtractionRequest -> PipelineIdentity
//! - `filesystem`, `object_storage`, `relational`: unit discovery and extraction
//! - `formats`: file payload parsing shared by file-like sources

pub mod filesystem;
pub mod formats;
pub mod identity;
pub mod normalizer;
pub mod object_storage;
pub mod relational;

pub use filesystem::FilesystemConnector;
pub use formats::FileFormat;
pub use identity::{sanitize_table_name, PipelineIdentity, PipelineIdentityResolver};
pub use normalizer::{RawSourceConfig, SourceConfigNormalizer};
pub use object_storage::ObjectStoreConnector;
pub use relational::RelationalConnector;

use crate::error::{LumosError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// One extracted row, keyed by (flattened) column name
pub type Record = Map<String, Value>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Filesystem,
    ObjectStore,
    Relational,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Filesystem => "filesystem",
            SourceKind::ObjectStore => "object_store",
            SourceKind::Relational => "relational",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = LumosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "filesystem" | "fs" | "local" | "file" => Ok(SourceKind::Filesystem),
            "object_store" | "object-store" | "s3" | "gcs" | "azure" => Ok(SourceKind::ObjectStore),
            "relational" | "postgres" | "postgresql" | "sqlite" | "sql" => Ok(SourceKind::Relational),
            other => Err(LumosError::Configuration(format!(
                "Unsupported source type '{}'. Supported types: filesystem, object_store, relational",
                other
            ))),
        }
    }
}

/// Which part of a location gets extracted
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Selector {
    /// File-like sources: glob relative to the location, optional format hint
    Files {
        glob: String,
        format: Option<FileFormat>,
        recursive: bool,
    },
    /// Relational sources: schema plus a sorted, deduplicated table filter
    /// (empty means every base table in the schema)
    Tables { schema: String, tables: Vec<String> },
}

impl Selector {
    /// Stable textual form used for identity derivation
    pub fn canonical_key(&self) -> String {
        match self {
            Selector::Files {
                glob,
                format,
                recursive,
            } => format!(
                "files:{}:{}:{}",
                glob,
                format.map(|f| f.as_str()).unwrap_or("auto"),
                if *recursive { "recursive" } else { "flat" }
            ),
            Selector::Tables { schema, tables } => {
                format!("tables:{}:{}", schema, tables.join(","))
            }
        }
    }
}

/// Opaque key/value credentials. `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Credentials(BTreeMap<String, String>);

impl Credentials {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self(values)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "***")))
            .finish()
    }
}

/// Canonical extraction request produced by the normalizer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionRequest {
    pub source_kind: SourceKind,
    /// Path, bucket URL or connection string, trailing separators stripped
    pub location: String,
    pub selector: Selector,
    #[serde(default, skip_serializing)]
    pub credentials: Credentials,
    pub requested_destination_table: Option<String>,
    pub requested_dataset: Option<String>,
}

/// One independently loadable piece of a source: a file, an object or a table
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceUnit {
    /// Full path, object key or qualified table name
    pub locator: String,
    /// Short name the default table name is derived from
    pub name: String,
    pub format: Option<FileFormat>,
}

/// Source connector trait
///
/// Implementations:
/// - FilesystemConnector: local files matched by a glob
/// - ObjectStoreConnector: objects under a bucket prefix
/// - RelationalConnector: tables of a Postgres or SQLite database
#[async_trait]
pub trait SourceConnector: Send + Sync {
    fn source_kind(&self) -> SourceKind;

    /// List the units this source would extract, in a stable order
    async fn discover(&self) -> Result<Vec<SourceUnit>>;

    /// Read every record of one unit
    async fn extract(&self, unit: &SourceUnit) -> Result<Vec<Record>>;
}

/// Build the connector for a normalized request
pub fn open_connector(request: &ExtractionRequest) -> Result<Arc<dyn SourceConnector>> {
    let connector: Arc<dyn SourceConnector> = match request.source_kind {
        SourceKind::Filesystem => Arc::new(FilesystemConnector::from_request(request)?),
        SourceKind::ObjectStore => Arc::new(ObjectStoreConnector::from_request(request)?),
        SourceKind::Relational => Arc::new(RelationalConnector::from_request(request)?),
    };
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_aliases() {
        assert_eq!("s3".parse::<SourceKind>().unwrap(), SourceKind::ObjectStore);
        assert_eq!("postgres".parse::<SourceKind>().unwrap(), SourceKind::Relational);
        assert_eq!("filesystem".parse::<SourceKind>().unwrap(), SourceKind::Filesystem);
        assert!(matches!(
            "ftp".parse::<SourceKind>(),
            Err(LumosError::Configuration(_))
        ));
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new(
            [("aws_secret_access_key".to_string(), "hunter2".to_string())]
                .into_iter()
                .collect(),
        );
        let printed = format!("{:?}", creds);
        assert!(printed.contains("aws_secret_access_key"));
        assert!(!printed.contains("hunter2"));
    }
}
