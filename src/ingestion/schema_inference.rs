//! Schema Inference - Deterministic column typing from extracted records
//!
//! Conflicting observations for the same field never fail a load: the column
//! is promoted to the most permissive common type (integer -> float ->
//! string) and the promotion is kept so the catalog can report it.

use crate::connectors::Record;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Upper bound on sample values retained per column
pub const MAX_SAMPLE_VALUES: usize = 10;

/// A string column with at most this many distinct values is categorical
const CATEGORICAL_MAX_DISTINCT: usize = 20;

/// Only ISO dates are typed as dates
const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferredType {
    Boolean,
    Integer,
    Float,
    Date,
    Categorical,
    String,
}

impl InferredType {
    /// Most permissive common type of two observations
    pub fn promote(self, other: InferredType) -> InferredType {
        use InferredType as T;
        match (self, other) {
            (a, b) if a == b => a,
            (T::Integer, T::Float) | (T::Float, T::Integer) => T::Float,
            _ => T::String,
        }
    }

    /// True when moving from `self` to `other` loses specificity
    pub fn widens_to(self, other: InferredType) -> bool {
        self != other && self.promote(other) == other
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, InferredType::Integer | InferredType::Float)
    }

    /// Text-like columns share storage; categorical is a profile of string
    pub fn storage_class(self) -> InferredType {
        match self {
            InferredType::Categorical => InferredType::String,
            other => other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InferredType::Boolean => "boolean",
            InferredType::Integer => "integer",
            InferredType::Float => "float",
            InferredType::Date => "date",
            InferredType::Categorical => "categorical",
            InferredType::String => "string",
        }
    }
}

impl fmt::Display for InferredType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type promotion observed while inferring one load
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypePromotion {
    pub from: InferredType,
    pub to: InferredType,
}

/// Inferred column information
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferredColumn {
    pub name: String,
    pub data_type: InferredType,
    pub nullable: bool,
    pub sample_values: BTreeSet<String>,
    /// Promotions that happened inside this load
    pub promotions: Vec<TypePromotion>,
}

/// Inferred schema for a table
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InferredSchema {
    pub table_name: String,
    /// Ordered by first appearance in the records
    pub columns: Vec<InferredColumn>,
    pub row_count: usize,
}

#[derive(Default)]
struct ColumnAccumulator {
    data_type: Option<InferredType>,
    nullable: bool,
    promotions: Vec<TypePromotion>,
    samples: BTreeSet<String>,
    distinct: BTreeSet<String>,
    distinct_overflow: bool,
    non_null: usize,
}

/// Schema Inference Engine
pub struct SchemaInference {
    max_samples: usize,
}

impl SchemaInference {
    pub fn new() -> Self {
        Self {
            max_samples: MAX_SAMPLE_VALUES,
        }
    }

    pub fn infer_schema<'a>(
        &self,
        table_name: &str,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> InferredSchema {
        let mut order: Vec<String> = Vec::new();
        let mut columns: HashMap<String, ColumnAccumulator> = HashMap::new();
        let mut row_count = 0;

        for (index, record) in records.into_iter().enumerate() {
            row_count += 1;
            for (name, value) in record {
                let acc = columns.entry(name.clone()).or_insert_with(|| {
                    order.push(name.clone());
                    ColumnAccumulator {
                        // Earlier records lacked this column
                        nullable: index > 0,
                        ..Default::default()
                    }
                });
                self.observe(acc, value);
            }
            // Columns absent from this record are null for it
            for (name, acc) in columns.iter_mut() {
                if !record.contains_key(name) {
                    acc.nullable = true;
                }
            }
        }

        let columns = order
            .into_iter()
            .filter_map(|name| {
                let acc = columns.remove(&name)?;
                Some(self.finish(name, acc))
            })
            .collect();

        InferredSchema {
            table_name: table_name.to_string(),
            columns,
            row_count,
        }
    }

    fn observe(&self, acc: &mut ColumnAccumulator, value: &Value) {
        let Some(observed) = Self::value_type(value) else {
            acc.nullable = true;
            return;
        };

        acc.non_null += 1;
        acc.data_type = Some(match acc.data_type {
            None => observed,
            Some(current) => {
                let merged = current.promote(observed);
                if merged != current {
                    acc.promotions.push(TypePromotion {
                        from: current,
                        to: merged,
                    });
                }
                merged
            }
        });

        let text = Self::value_text(value);
        if acc.samples.len() < self.max_samples {
            acc.samples.insert(text.clone());
        }
        if !acc.distinct_overflow {
            acc.distinct.insert(text);
            if acc.distinct.len() > CATEGORICAL_MAX_DISTINCT {
                acc.distinct_overflow = true;
                acc.distinct.clear();
            }
        }
    }

    fn finish(&self, name: String, acc: ColumnAccumulator) -> InferredColumn {
        let mut data_type = acc.data_type.unwrap_or(InferredType::String);

        // Low-cardinality text with repetition is categorical
        if data_type == InferredType::String
            && acc.promotions.is_empty()
            && !acc.distinct_overflow
            && acc.non_null >= 2 * acc.distinct.len().max(1)
        {
            data_type = InferredType::Categorical;
        }

        InferredColumn {
            name,
            data_type,
            nullable: acc.nullable,
            sample_values: acc.samples,
            promotions: acc.promotions,
        }
    }

    fn value_type(value: &Value) -> Option<InferredType> {
        match value {
            Value::Null => None,
            Value::Bool(_) => Some(InferredType::Boolean),
            Value::Number(n) => {
                if n.is_f64() {
                    Some(InferredType::Float)
                } else {
                    Some(InferredType::Integer)
                }
            }
            Value::String(s) => {
                if Self::looks_like_date(s) {
                    Some(InferredType::Date)
                } else {
                    Some(InferredType::String)
                }
            }
            Value::Array(_) | Value::Object(_) => Some(InferredType::String),
        }
    }

    fn looks_like_date(s: &str) -> bool {
        let s = s.trim();
        s.len() == 10 && NaiveDate::parse_from_str(s, DATE_FORMAT).is_ok()
    }

    /// Canonical text form of a value, as stored in sample sets
    pub fn value_text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl Default for SchemaInference {
    fn default() -> Self {
        Self::new()
    }
}
