//! Validation Module
//!
//! Rule specifications arrive from the rule-generation service as structured
//! input. Each one is compiled into a count/sample query pair against a
//! single loaded table, executed with a per-rule timeout, and folded into a
//! per-column report.

pub mod compiler;
pub mod completeness;
pub mod executor;
pub mod report;
pub mod severity;

pub use compiler::RuleCompiler;
pub use completeness::{ColumnFillRate, CompletenessReport};
pub use executor::RuleExecutor;
pub use report::{ColumnValidation, ResultAggregator, ValidationReport, ValidationSummary};
pub use severity::{Severity, SeverityThresholds};

use crate::catalog::SchemaCatalog;
use crate::config::ValidationSettings;
use crate::db::{Destination, SqlParam, TableRef};
use crate::error::LumosError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Closed set of rule kinds. Anything else deserializes to `Unsupported`
/// and fails compilation with `UnsupportedRule`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RuleKind {
    Pattern,
    Length,
    Range,
    Enumeration,
    NullCheck,
    Uniqueness,
    Unsupported(String),
}

impl RuleKind {
    pub fn as_str(&self) -> &str {
        match self {
            RuleKind::Pattern => "pattern",
            RuleKind::Length => "length",
            RuleKind::Range => "range",
            RuleKind::Enumeration => "enumeration",
            RuleKind::NullCheck => "null-check",
            RuleKind::Uniqueness => "uniqueness",
            RuleKind::Unsupported(kind) => kind,
        }
    }
}

impl From<String> for RuleKind {
    fn from(value: String) -> Self {
        match value.trim().to_lowercase().replace('_', "-").as_str() {
            "pattern" | "regex" => RuleKind::Pattern,
            "length" => RuleKind::Length,
            "range" => RuleKind::Range,
            "enumeration" | "enum" | "allowed-values" => RuleKind::Enumeration,
            "null-check" | "not-null" | "nullcheck" => RuleKind::NullCheck,
            "uniqueness" | "unique" => RuleKind::Uniqueness,
            _ => RuleKind::Unsupported(value),
        }
    }
}

impl From<RuleKind> for String {
    fn from(kind: RuleKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Numeric or textual (e.g. ISO date) range bound
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RangeBound {
    Number(f64),
    Text(String),
}

/// Values the compiler needs for each kind. Irrelevant fields are ignored.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleParameters {
    /// Regex for `pattern`
    pub pattern: Option<String>,
    /// Inclusive lower bound for `range` and `length`
    pub min: Option<RangeBound>,
    /// Inclusive upper bound for `range` and `length`
    pub max: Option<RangeBound>,
    /// Allowed literals for `enumeration`
    pub allowed_values: Vec<String>,
    /// For `null-check`: the column is a required field
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleSpecification {
    /// Caller-assigned id such as `R001`; derived from the rule when absent
    #[serde(default)]
    pub rule_id: Option<String>,
    pub column_name: String,
    pub rule_text: String,
    pub rule_kind: RuleKind,
    #[serde(default)]
    pub parameters: RuleParameters,
}

/// Count/sample query pair for one rule against one table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompiledRule {
    pub rule_id: String,
    pub column_name: String,
    pub rule_kind: RuleKind,
    pub rule_text: String,
    pub table: TableRef,
    pub count_query: String,
    /// At most [`MAX_SAMPLE_VIOLATIONS`] distinct violating values
    pub sample_query: String,
    /// Bind parameters shared by both queries
    pub params: Vec<SqlParam>,
    /// Violations of uniqueness or required-field rules are always HIGH
    pub structural: bool,
}

pub const MAX_SAMPLE_VIOLATIONS: usize = 5;

/// Why a rule produced no violation count
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum RuleFailure {
    Unsupported { reason: String },
    Timeout { after_ms: u64 },
    Error { message: String },
    Cancelled,
}

impl fmt::Display for RuleFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleFailure::Unsupported { reason } => write!(f, "unsupported: {}", reason),
            RuleFailure::Timeout { after_ms } => write!(f, "timed out after {} ms", after_ms),
            RuleFailure::Error { message } => write!(f, "error: {}", message),
            RuleFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Result of one rule. `violation_count` and `severity` are `None` exactly
/// when `failure` is set; a rule that could not run never reads as clean.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RuleOutcome {
    pub rule_id: String,
    pub column_name: String,
    pub rule_kind: RuleKind,
    pub rule_text: String,
    pub violation_count: Option<u64>,
    pub row_count: Option<u64>,
    pub severity: Option<Severity>,
    pub sample_violations: Vec<String>,
    pub failure: Option<RuleFailure>,
    pub duration_ms: u64,
}

impl RuleOutcome {
    pub fn failed(
        rule_id: impl Into<String>,
        column_name: impl Into<String>,
        rule_kind: RuleKind,
        rule_text: impl Into<String>,
        failure: RuleFailure,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            column_name: column_name.into(),
            rule_kind,
            rule_text: rule_text.into(),
            violation_count: None,
            row_count: None,
            severity: None,
            sample_violations: Vec::new(),
            failure: Some(failure),
            duration_ms: 0,
        }
    }

    pub fn executed(&self) -> bool {
        self.failure.is_none()
    }
}

/// Compiles, runs and aggregates `specs` against one loaded table.
///
/// Column metadata comes from the catalog. Specs naming an unknown column or
/// an untranslatable rule are reported as "could not run" outcomes in their
/// original position.
pub async fn validate_table(
    destination: Arc<dyn Destination>,
    catalog: &SchemaCatalog,
    table: &TableRef,
    specs: &[RuleSpecification],
    settings: &ValidationSettings,
    cancel: CancellationToken,
) -> ValidationReport {
    let key = table.to_string();
    let columns = catalog.get(&key);
    if columns.is_empty() {
        warn!(table = %key, "Table is not in the schema catalog");
    }

    let compiler = RuleCompiler::new(destination.dialect());
    let mut outcomes: Vec<Option<RuleOutcome>> = vec![None; specs.len()];
    let mut compiled = Vec::new();
    let mut positions = Vec::new();

    for (index, spec) in specs.iter().enumerate() {
        let result = match columns.iter().find(|c| c.column_name == spec.column_name) {
            Some(column) => compiler.compile(spec, column, table),
            None => Err(LumosError::UnsupportedRule {
                rule_id: compiler::rule_id_for(spec),
                reason: format!("column {} not found in {}", spec.column_name, key),
            }),
        };
        match result {
            Ok(rule) => {
                compiled.push(rule);
                positions.push(index);
            }
            Err(err) => {
                let (rule_id, reason) = match err {
                    LumosError::UnsupportedRule { rule_id, reason } => (rule_id, reason),
                    other => (compiler::rule_id_for(spec), other.to_string()),
                };
                warn!(rule_id = %rule_id, reason = %reason, "Rule could not be compiled");
                outcomes[index] = Some(RuleOutcome::failed(
                    rule_id,
                    &spec.column_name,
                    spec.rule_kind.clone(),
                    &spec.rule_text,
                    RuleFailure::Unsupported { reason },
                ));
            }
        }
    }

    let executor = RuleExecutor::new(Arc::clone(&destination), settings);
    let executed = executor.execute_batch(compiled, cancel.clone()).await;
    for (index, outcome) in positions.into_iter().zip(executed) {
        outcomes[index] = Some(outcome);
    }

    let completeness = if cancel.is_cancelled() || columns.is_empty() {
        None
    } else {
        match completeness::profile(destination.as_ref(), table, columns).await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(table = %key, error = %err, "Completeness profiling failed");
                None
            }
        }
    };

    let report = ResultAggregator::new(&key)
        .with_columns(columns)
        .with_completeness(completeness, settings.fill_rate_threshold)
        .aggregate(&outcomes.into_iter().flatten().collect::<Vec<_>>());

    info!(
        table = %key,
        rules = report.summary.total_rules,
        failed = report.summary.failed_to_execute,
        highest = ?report.summary.highest_severity,
        "Validation finished"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_kind_parsing() {
        assert_eq!(RuleKind::from("null_check".to_string()), RuleKind::NullCheck);
        assert_eq!(RuleKind::from("Enumeration".to_string()), RuleKind::Enumeration);
        assert_eq!(
            RuleKind::from("cross-table".to_string()),
            RuleKind::Unsupported("cross-table".to_string())
        );
    }

    #[test]
    fn test_spec_from_json() {
        let spec: RuleSpecification = serde_json::from_str(
            r#"{
                "column_name": "age",
                "rule_text": "Age must be between 0 and 120",
                "rule_kind": "range",
                "parameters": {"min": 0, "max": 120}
            }"#,
        )
        .unwrap();
        assert_eq!(spec.rule_kind, RuleKind::Range);
        assert_eq!(spec.parameters.min, Some(RangeBound::Number(0.0)));
        assert!(spec.rule_id.is_none());

        let kind = serde_json::to_string(&RuleKind::NullCheck).unwrap();
        assert_eq!(kind, "\"null-check\"");
    }

    #[test]
    fn test_failed_outcome_has_no_count() {
        let outcome = RuleOutcome::failed(
            "R001",
            "age",
            RuleKind::Range,
            "Age in range",
            RuleFailure::Timeout { after_ms: 10 },
        );
        assert!(!outcome.executed());
        assert_eq!(outcome.violation_count, None);
        assert_eq!(outcome.severity, None);
    }
}
