//! Result Aggregator - folds rule outcomes into a per-column report
//!
//! Aggregation is a pure function of its inputs: the same outcomes (and
//! column metadata) always produce the same report.

use crate::catalog::{ColumnMetadata, TypeChange};
use crate::validation::completeness::{ColumnFillRate, CompletenessReport};
use crate::validation::severity::Severity;
use crate::validation::RuleOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Write;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnValidation {
    pub column_name: String,
    /// In rule submission order
    pub outcomes: Vec<RuleOutcome>,
    /// Distinct sample violations across this column's rules, first seen first
    pub violating_values: Vec<String>,
    /// Widenings the column went through while loading
    pub type_widening: Vec<TypeChange>,
}

impl ColumnValidation {
    fn new(column_name: &str) -> Self {
        Self {
            column_name: column_name.to_string(),
            outcomes: Vec::new(),
            violating_values: Vec::new(),
            type_widening: Vec::new(),
        }
    }

    pub fn highest_severity(&self) -> Option<Severity> {
        self.outcomes.iter().filter_map(|o| o.severity).max()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSummary {
    pub total_rules: usize,
    pub executed: usize,
    pub failed_to_execute: usize,
    /// `None` when no rule executed
    pub highest_severity: Option<Severity>,
    pub total_violations: u64,
    pub columns_with_violations: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub table: String,
    pub columns: Vec<ColumnValidation>,
    pub summary: ValidationSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completeness: Option<CompletenessReport>,
    /// Columns filled below the configured threshold
    #[serde(default)]
    pub completeness_issues: Vec<ColumnFillRate>,
}

impl ValidationReport {
    pub fn column(&self, column_name: &str) -> Option<&ColumnValidation> {
        self.columns.iter().find(|c| c.column_name == column_name)
    }

    /// Every outcome in report order
    pub fn outcomes(&self) -> impl Iterator<Item = &RuleOutcome> {
        self.columns.iter().flat_map(|c| c.outcomes.iter())
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Human-readable summary: issues table, rules that could not run,
    /// completeness gaps and schema widening.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let s = &self.summary;

        let _ = writeln!(out, "# Data Quality Report: {}\n", self.table);
        let _ = writeln!(out, "## Summary\n");
        let _ = writeln!(out, "- Rules: {} ({} executed, {} could not run)", s.total_rules, s.executed, s.failed_to_execute);
        let _ = writeln!(out, "- Total violations: {}", s.total_violations);
        let _ = writeln!(out, "- Columns with violations: {}", s.columns_with_violations);
        let _ = writeln!(
            out,
            "- Highest severity: {}",
            s.highest_severity.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
        );
        out.push('\n');

        let issues: Vec<_> = self
            .outcomes()
            .filter(|o| o.violation_count.unwrap_or(0) > 0)
            .collect();
        let _ = writeln!(out, "## Validation Issues\n");
        if issues.is_empty() {
            out.push_str("No violations found.\n\n");
        } else {
            out.push_str("| Column | Rule | Requirement | Violations | Severity | Samples |\n");
            out.push_str("|---|---|---|---|---|---|\n");
            for o in issues {
                let _ = writeln!(
                    out,
                    "| {} | {} | {} | {} | {} | {} |",
                    cell(&o.column_name),
                    cell(&o.rule_id),
                    cell(&o.rule_text),
                    o.violation_count.unwrap_or(0),
                    o.severity.map(|v| v.to_string()).unwrap_or_default(),
                    cell(&o.sample_violations.join(", ")),
                );
            }
            out.push('\n');
        }

        let failed: Vec<_> = self.outcomes().filter(|o| !o.executed()).collect();
        if !failed.is_empty() {
            let _ = writeln!(out, "## Rules Not Executed\n");
            for o in failed {
                let reason = o.failure.as_ref().map(|f| f.to_string()).unwrap_or_default();
                let _ = writeln!(out, "- `{}` on `{}`: {}", o.rule_id, o.column_name, reason);
            }
            out.push('\n');
        }

        if !self.completeness_issues.is_empty() {
            let _ = writeln!(out, "## Completeness Issues\n");
            out.push_str("| Column | Null Count | Fill Rate |\n|---|---|---|\n");
            for c in &self.completeness_issues {
                let _ = writeln!(out, "| {} | {} | {:.2}% |", cell(&c.column_name), c.null_count, c.fill_rate_percentage);
            }
            out.push('\n');
        }

        let widened: Vec<_> = self.columns.iter().filter(|c| !c.type_widening.is_empty()).collect();
        if !widened.is_empty() {
            let _ = writeln!(out, "## Schema Widening\n");
            for c in widened {
                let steps: Vec<String> = c
                    .type_widening
                    .iter()
                    .map(|t| format!("{} -> {} (load {})", t.from, t.to, t.load))
                    .collect();
                let _ = writeln!(out, "- `{}`: {}", c.column_name, steps.join(", "));
            }
            out.push('\n');
        }

        out
    }
}

/// Escapes pipes and newlines for a markdown table cell
fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

pub struct ResultAggregator {
    table: String,
    columns: Vec<ColumnMetadata>,
    completeness: Option<CompletenessReport>,
    fill_rate_threshold: f64,
}

impl ResultAggregator {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            columns: Vec::new(),
            completeness: None,
            fill_rate_threshold: 0.0,
        }
    }

    /// Catalog columns fix the column order and contribute type history
    pub fn with_columns(mut self, columns: &[ColumnMetadata]) -> Self {
        self.columns = columns.to_vec();
        self
    }

    pub fn with_completeness(mut self, completeness: Option<CompletenessReport>, fill_rate_threshold: f64) -> Self {
        self.completeness = completeness;
        self.fill_rate_threshold = fill_rate_threshold;
        self
    }

    /// Groups `outcomes` by column. Catalog columns come first in catalog
    /// order, then any other column in order of first appearance. A repeated
    /// rule_id keeps its first outcome.
    pub fn aggregate(&self, outcomes: &[RuleOutcome]) -> ValidationReport {
        let mut columns: Vec<ColumnValidation> = Vec::new();
        let mut seen_rules = HashSet::new();

        for meta in &self.columns {
            if meta.type_widened() {
                let mut column = ColumnValidation::new(&meta.column_name);
                column.type_widening = meta.type_history.clone();
                columns.push(column);
            }
        }

        for outcome in outcomes {
            if !seen_rules.insert(outcome.rule_id.as_str()) {
                warn!(rule_id = %outcome.rule_id, "Dropping duplicate rule outcome");
                continue;
            }
            let index = match columns.iter().position(|c| c.column_name == outcome.column_name) {
                Some(index) => index,
                None => {
                    columns.push(ColumnValidation::new(&outcome.column_name));
                    columns.len() - 1
                }
            };
            let column = &mut columns[index];
            for value in &outcome.sample_violations {
                if !column.violating_values.contains(value) {
                    column.violating_values.push(value.clone());
                }
            }
            column.outcomes.push(outcome.clone());
        }

        columns.sort_by_key(|c| {
            self.columns
                .iter()
                .position(|m| m.column_name == c.column_name)
                .unwrap_or(usize::MAX)
        });

        let summary = summarize(&columns);
        let completeness_issues = self
            .completeness
            .as_ref()
            .map(|c| c.below(self.fill_rate_threshold).cloned().collect())
            .unwrap_or_default();

        ValidationReport {
            table: self.table.clone(),
            columns,
            summary,
            completeness: self.completeness.clone(),
            completeness_issues,
        }
    }
}

fn summarize(columns: &[ColumnValidation]) -> ValidationSummary {
    let mut summary = ValidationSummary::default();
    for column in columns {
        let mut column_violations = 0;
        for outcome in &column.outcomes {
            summary.total_rules += 1;
            match outcome.violation_count {
                Some(count) if outcome.executed() => {
                    summary.executed += 1;
                    column_violations += count;
                }
                _ => summary.failed_to_execute += 1,
            }
        }
        summary.total_violations += column_violations;
        if column_violations > 0 {
            summary.columns_with_violations += 1;
        }
        summary.highest_severity = summary.highest_severity.max(column.highest_severity());
    }
    summary
}
