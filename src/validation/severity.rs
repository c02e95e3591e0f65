//! Severity assignment for rule outcomes

use crate::error::{LumosError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered LOW < MEDIUM < HIGH
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
        })
    }
}

/// Violation-proportion cut-offs. A proportion above `high` is HIGH, above
/// `medium` is MEDIUM, anything else LOW.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub medium: f64,
    pub high: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium: 0.01,
            high: 0.10,
        }
    }
}

impl SeverityThresholds {
    pub fn validate(&self) -> Result<()> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);
        if !in_unit(self.medium) || !in_unit(self.high) {
            return Err(LumosError::Configuration(format!(
                "severity thresholds must be within [0, 1], got medium={} high={}",
                self.medium, self.high
            )));
        }
        if self.medium > self.high {
            return Err(LumosError::Configuration(format!(
                "severity medium threshold {} exceeds high threshold {}",
                self.medium, self.high
            )));
        }
        Ok(())
    }

    /// `structural` marks rules on primary constraints (uniqueness, required
    /// fields); any violation of those is HIGH.
    pub fn classify(&self, violations: u64, total_rows: u64, structural: bool) -> Severity {
        if violations == 0 {
            return Severity::Low;
        }
        if structural {
            return Severity::High;
        }

        let proportion = if total_rows == 0 {
            1.0
        } else {
            (violations as f64 / total_rows as f64).min(1.0)
        };

        if proportion > self.high {
            Severity::High
        } else if proportion > self.medium {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}
