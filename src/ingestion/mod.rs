//! Ingestion Module
//!
//! Moves data from a normalized source into the destination store:
//! - Schema inference with type promotion
//! - Automatic table creation and evolution
//! - Bounded retry around source reads and destination writes
//! - Fail-soft per source unit

pub mod orchestrator;
pub mod retry;
pub mod schema_inference;

pub use orchestrator::ExtractionLoadOrchestrator;
pub use retry::RetryPolicy;
pub use schema_inference::{InferredColumn, InferredSchema, InferredType, SchemaInference};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Outcome of one extraction run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoadResult {
    /// Ingestion run ID
    pub run_id: String,

    pub pipeline_name: String,

    pub dataset_name: String,

    pub status: LoadStatus,

    /// Tables that received data, in load order (`dataset.table`)
    pub tables_loaded: Vec<String>,

    /// Rows written per table in this run
    pub row_counts: BTreeMap<String, u64>,

    /// Units that were skipped because of an error
    pub failed_units: Vec<UnitFailure>,

    /// Summary of the failure cause (if not fully successful)
    pub error: Option<String>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LoadResult {
    pub fn total_rows(&self) -> u64 {
        self.row_counts.values().sum()
    }

    pub fn is_success(&self) -> bool {
        self.status == LoadStatus::Success
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadStatus {
    Success,
    Partial,
    Failed,
}

impl LoadStatus {
    /// Zero loaded tables is a failure; any skipped unit makes it partial
    pub fn from_counts(loaded: usize, failed: usize) -> Self {
        match (loaded, failed) {
            (0, _) => LoadStatus::Failed,
            (_, 0) => LoadStatus::Success,
            _ => LoadStatus::Partial,
        }
    }
}

impl fmt::Display for LoadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LoadStatus::Success => "success",
            LoadStatus::Partial => "partial",
            LoadStatus::Failed => "failed",
        })
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadStage {
    Discover,
    Extract,
    Load,
}

/// A source unit that did not make it into the destination
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct UnitFailure {
    /// File path, object key, `schema.table`, or the source location for
    /// discovery failures
    pub unit: String,
    pub stage: LoadStage,
    pub error: String,
    pub attempts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_counts() {
        assert_eq!(LoadStatus::from_counts(0, 0), LoadStatus::Failed);
        assert_eq!(LoadStatus::from_counts(0, 3), LoadStatus::Failed);
        assert_eq!(LoadStatus::from_counts(4, 0), LoadStatus::Success);
        assert_eq!(LoadStatus::from_counts(4, 1), LoadStatus::Partial);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&LoadStatus::Partial).unwrap(), "\"partial\"");
    }
}
