//! Filesystem connector - local files matched by a glob under a path

use crate::connectors::formats::{self, file_stem, FileFormat};
use crate::connectors::{ExtractionRequest, Record, Selector, SourceConnector, SourceKind, SourceUnit};
use crate::error::{LumosError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub struct FilesystemConnector {
    root: PathBuf,
    file_glob: String,
    file_format: Option<FileFormat>,
    recursive: bool,
}

impl FilesystemConnector {
    pub fn new(root: impl Into<PathBuf>, file_glob: &str, file_format: Option<FileFormat>, recursive: bool) -> Self {
        Self {
            root: root.into(),
            file_glob: file_glob.to_string(),
            file_format,
            recursive,
        }
    }

    pub fn from_request(request: &ExtractionRequest) -> Result<Self> {
        match &request.selector {
            Selector::Files {
                glob,
                format,
                recursive,
            } => Ok(Self::new(&request.location, glob, *format, *recursive)),
            Selector::Tables { .. } => Err(LumosError::Configuration(
                "Filesystem source requires a file selector".to_string(),
            )),
        }
    }

    fn glob_pattern(&self) -> String {
        let base = self.root.to_string_lossy();
        let base = base.trim_end_matches(['/', '\\']);
        if self.recursive && !self.file_glob.contains("**") {
            format!("{}/**/{}", base, self.file_glob)
        } else {
            format!("{}/{}", base, self.file_glob)
        }
    }

    fn unit_for(&self, path: &Path) -> SourceUnit {
        let locator = path.to_string_lossy().to_string();
        SourceUnit {
            name: file_stem(&locator),
            format: self.file_format.or_else(|| FileFormat::from_path(&locator)),
            locator,
        }
    }

    fn list_files(&self) -> Result<Vec<PathBuf>> {
        if !self.root.exists() {
            return Err(LumosError::Extraction(format!(
                "Path does not exist: {}",
                self.root.display()
            )));
        }

        if self.root.is_file() {
            return Ok(vec![self.root.clone()]);
        }

        let pattern = self.glob_pattern();
        debug!(pattern = %pattern, "Listing files");

        let entries = glob::glob(&pattern).map_err(|e| {
            LumosError::Configuration(format!("Invalid file pattern '{}': {}", pattern, e))
        })?;

        let mut files = Vec::new();
        for entry in entries {
            match entry {
                Ok(path) if path.is_file() => files.push(path),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable path {}: {}", e.path().display(), e),
            }
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl SourceConnector for FilesystemConnector {
    fn source_kind(&self) -> SourceKind {
        SourceKind::Filesystem
    }

    async fn discover(&self) -> Result<Vec<SourceUnit>> {
        let files = self.list_files()?;
        info!(
            root = %self.root.display(),
            pattern = %self.file_glob,
            files = files.len(),
            "Found matching files"
        );
        Ok(files.iter().map(|path| self.unit_for(path)).collect())
    }

    async fn extract(&self, unit: &SourceUnit) -> Result<Vec<Record>> {
        let format = unit.format.ok_or_else(|| {
            LumosError::Extraction(format!(
                "Cannot detect file format of {}; set file_format explicitly",
                unit.locator
            ))
        })?;

        let bytes = tokio::fs::read(&unit.locator).await?;
        formats::parse_records(format, &bytes).map_err(|e| match e {
            LumosError::Io(_) => e,
            other => LumosError::Extraction(format!("{}: {}", unit.locator, other)),
        })
    }
}
