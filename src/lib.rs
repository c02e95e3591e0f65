pub mod catalog;
pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod ingestion;
pub mod validation;

pub use catalog::{ColumnMetadata, SchemaCatalog};
pub use config::LumosConfig;
pub use connectors::{ExtractionRequest, PipelineIdentity, PipelineIdentityResolver, SourceConfigNormalizer, SourceKind};
pub use error::{LumosError, Result};
pub use ingestion::{ExtractionLoadOrchestrator, LoadResult, LoadStatus};
pub use validation::{validate_table, RuleSpecification, ValidationReport};
