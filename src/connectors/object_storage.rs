//! Object store connector - objects under a bucket URL prefix
//!
//! Any URL scheme the `object_store` crate understands works here; the
//! request's credentials are passed through as store options
//! (`aws_access_key_id`, `google_service_account`, ...).

use crate::connectors::formats::{self, file_stem, FileFormat};
use crate::connectors::{ExtractionRequest, Record, Selector, SourceConnector, SourceKind, SourceUnit};
use crate::error::{LumosError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::info;
use url::Url;

pub struct ObjectStoreConnector {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    pattern: glob::Pattern,
    file_format: Option<FileFormat>,
    recursive: bool,
}

impl ObjectStoreConnector {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: ObjectPath,
        file_glob: &str,
        file_format: Option<FileFormat>,
        recursive: bool,
    ) -> Result<Self> {
        let pattern = glob::Pattern::new(file_glob).map_err(|e| {
            LumosError::Configuration(format!("Invalid file_glob '{}': {}", file_glob, e))
        })?;
        Ok(Self {
            store,
            prefix,
            pattern,
            file_format,
            recursive,
        })
    }

    pub fn from_request(request: &ExtractionRequest) -> Result<Self> {
        let (glob, format, recursive) = match &request.selector {
            Selector::Files {
                glob,
                format,
                recursive,
            } => (glob.as_str(), *format, *recursive),
            Selector::Tables { .. } => {
                return Err(LumosError::Configuration(
                    "Object store source requires a file selector".to_string(),
                ))
            }
        };

        let url = Url::parse(&request.location).map_err(|e| {
            LumosError::Configuration(format!("Invalid bucket_url '{}': {}", request.location, e))
        })?;
        let options = request
            .credentials
            .iter()
            .map(|(k, v)| (k.to_lowercase(), v.clone()));
        let (store, prefix) = object_store::parse_url_opts(&url, options)?;

        Self::new(Arc::from(store), prefix, glob, format, recursive)
    }

    /// Key relative to the prefix, used for glob matching
    fn relative_key<'a>(&self, key: &'a str) -> &'a str {
        let prefix = self.prefix.as_ref();
        if prefix.is_empty() {
            return key;
        }
        key.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .unwrap_or(key)
    }

    fn matches(&self, key: &str) -> bool {
        let relative = self.relative_key(key);
        if !self.recursive && relative.contains('/') {
            return false;
        }
        let file_name = relative.rsplit('/').next().unwrap_or(relative);
        self.pattern.matches(relative) || self.pattern.matches(file_name)
    }
}

#[async_trait]
impl SourceConnector for ObjectStoreConnector {
    fn source_kind(&self) -> SourceKind {
        SourceKind::ObjectStore
    }

    async fn discover(&self) -> Result<Vec<SourceUnit>> {
        let prefix = if self.prefix.as_ref().is_empty() {
            None
        } else {
            Some(&self.prefix)
        };

        let objects: Vec<_> = self.store.list(prefix).try_collect().await?;

        let mut units: Vec<SourceUnit> = objects
            .into_iter()
            .map(|meta| meta.location.to_string())
            .filter(|key| self.matches(key))
            .map(|key| SourceUnit {
                name: file_stem(&key),
                format: self.file_format.or_else(|| FileFormat::from_path(&key)),
                locator: key,
            })
            .collect();
        units.sort();

        info!(prefix = %self.prefix, objects = units.len(), "Found matching objects");
        Ok(units)
    }

    async fn extract(&self, unit: &SourceUnit) -> Result<Vec<Record>> {
        let format = unit.format.ok_or_else(|| {
            LumosError::Extraction(format!(
                "Cannot detect file format of {}; set file_format explicitly",
                unit.locator
            ))
        })?;

        let location = ObjectPath::from(unit.locator.as_str());
        let bytes = self.store.get(&location).await?.bytes().await?;

        formats::parse_records(format, &bytes)
            .map_err(|e| LumosError::Extraction(format!("{}: {}", unit.locator, e)))
    }
}
