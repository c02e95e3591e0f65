//! Rule Compiler - translates a rule specification into SQL
//!
//! Every rule becomes one violation predicate over a single column of a
//! single table, wrapped into a COUNT statement and a bounded DISTINCT sample
//! statement. Output is a pure function of `(spec, column, table, dialect)`,
//! so equal inputs always yield byte-identical SQL.

use crate::catalog::ColumnMetadata;
use crate::db::{SqlDialect, SqlParam, TableRef};
use crate::error::{LumosError, Result};
use crate::ingestion::schema_inference::InferredType;
use crate::validation::{CompiledRule, RangeBound, RuleKind, RuleSpecification, MAX_SAMPLE_VIOLATIONS};
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tracing::debug;

pub struct RuleCompiler {
    dialect: SqlDialect,
}

/// Violation predicate plus the parameters it binds, in order
struct Predicate {
    sql: String,
    params: Vec<SqlParam>,
}

/// Placeholder numbering for one predicate
struct Params {
    dialect: SqlDialect,
    values: Vec<SqlParam>,
}

impl Params {
    fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            values: Vec::new(),
        }
    }

    fn push(&mut self, value: SqlParam) -> String {
        self.values.push(value);
        self.dialect.placeholder(self.values.len())
    }
}

impl RuleCompiler {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn compile(
        &self,
        spec: &RuleSpecification,
        column: &ColumnMetadata,
        table: &TableRef,
    ) -> Result<CompiledRule> {
        let rule_id = rule_id_for(spec);
        let unsupported = |reason: String| LumosError::UnsupportedRule {
            rule_id: rule_id.clone(),
            reason,
        };

        if spec.column_name != column.column_name {
            return Err(unsupported(format!(
                "rule targets column {} but metadata is for {}",
                spec.column_name, column.column_name
            )));
        }

        let ident = self.dialect.quote_ident(&column.column_name);
        let text = self.dialect.text_value(&ident, column.inferred_type);
        let predicate = match &spec.rule_kind {
            RuleKind::NullCheck => Predicate {
                sql: format!("{} IS NULL", ident),
                params: Vec::new(),
            },
            RuleKind::Pattern => self.pattern(spec, &ident, &text).map_err(unsupported)?,
            RuleKind::Length => self.length(spec, &ident, &text).map_err(unsupported)?,
            RuleKind::Range => self.range(spec, column, &ident).map_err(unsupported)?,
            RuleKind::Enumeration => self.enumeration(spec, &ident, &text).map_err(unsupported)?,
            RuleKind::Uniqueness => self.uniqueness(&ident, table),
            RuleKind::Unsupported(kind) => {
                return Err(unsupported(format!("unknown rule kind '{}'", kind)));
            }
        };

        let qualified = self.dialect.qualify(table);
        let count_query = format!("SELECT COUNT(*) FROM {} WHERE {}", qualified, predicate.sql);
        let sample_query = format!(
            "SELECT DISTINCT {} AS violation FROM {} WHERE {} ORDER BY 1 LIMIT {}",
            text,
            qualified,
            predicate.sql,
            MAX_SAMPLE_VIOLATIONS
        );

        debug!(rule_id = %rule_id, kind = %spec.rule_kind, "Compiled rule");

        Ok(CompiledRule {
            rule_id,
            column_name: column.column_name.clone(),
            rule_kind: spec.rule_kind.clone(),
            rule_text: spec.rule_text.clone(),
            table: table.clone(),
            count_query,
            sample_query,
            params: predicate.params,
            structural: match spec.rule_kind {
                RuleKind::Uniqueness => true,
                RuleKind::NullCheck => spec.parameters.required,
                _ => false,
            },
        })
    }

    fn pattern(
        &self,
        spec: &RuleSpecification,
        ident: &str,
        text: &str,
    ) -> std::result::Result<Predicate, String> {
        let pattern = spec
            .parameters
            .pattern
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or("pattern rule has no pattern")?;
        regex::Regex::new(pattern).map_err(|e| format!("invalid pattern: {}", e))?;

        let mut params = Params::new(self.dialect);
        let placeholder = params.push(SqlParam::Text(pattern.to_string()));
        Ok(Predicate {
            sql: format!(
                "{} IS NOT NULL AND {}",
                ident,
                self.dialect.regex_mismatch(text, &placeholder)
            ),
            params: params.values,
        })
    }

    fn length(
        &self,
        spec: &RuleSpecification,
        ident: &str,
        text: &str,
    ) -> std::result::Result<Predicate, String> {
        let bound = |b: &Option<RangeBound>| -> std::result::Result<Option<i64>, String> {
            match b {
                None => Ok(None),
                Some(RangeBound::Number(n)) if n.fract() == 0.0 && *n >= 0.0 => Ok(Some(*n as i64)),
                Some(RangeBound::Text(t)) => match t.trim().parse::<i64>() {
                    Ok(n) if n >= 0 => Ok(Some(n)),
                    _ => Err(format!("length bound '{}' is not a non-negative integer", t)),
                },
                Some(other) => Err(format!("length bound {:?} is not a non-negative integer", other)),
            }
        };
        let min = bound(&spec.parameters.min)?;
        let max = bound(&spec.parameters.max)?;

        let length = format!("LENGTH({})", text);
        let mut params = Params::new(self.dialect);
        let mut checks = Vec::new();
        if let Some(min) = min {
            checks.push(format!("{} < {}", length, params.push(SqlParam::Integer(min))));
        }
        if let Some(max) = max {
            checks.push(format!("{} > {}", length, params.push(SqlParam::Integer(max))));
        }
        if checks.is_empty() {
            return Err("length rule needs min or max".to_string());
        }

        Ok(Predicate {
            sql: format!("{} IS NOT NULL AND ({})", ident, checks.join(" OR ")),
            params: params.values,
        })
    }

    fn range(
        &self,
        spec: &RuleSpecification,
        column: &ColumnMetadata,
        ident: &str,
    ) -> std::result::Result<Predicate, String> {
        let (min, max) = (&spec.parameters.min, &spec.parameters.max);
        if min.is_none() && max.is_none() {
            return Err("range rule needs min or max".to_string());
        }

        let compare_type = match column.inferred_type {
            InferredType::Integer if [min, max].iter().all(|b| integral(b)) => InferredType::Integer,
            InferredType::Integer | InferredType::Float => InferredType::Float,
            InferredType::Date => InferredType::Date,
            other => {
                return Err(format!(
                    "range rule needs a numeric or date column, {} is {}",
                    column.column_name, other
                ))
            }
        };

        let to_param = |b: &RangeBound| -> std::result::Result<SqlParam, String> {
            match (compare_type, b) {
                (InferredType::Integer, RangeBound::Number(n)) => Ok(SqlParam::Integer(*n as i64)),
                (InferredType::Integer, RangeBound::Text(t)) => t
                    .trim()
                    .parse::<i64>()
                    .map(SqlParam::Integer)
                    .map_err(|_| format!("range bound '{}' is not a number", t)),
                (InferredType::Float, RangeBound::Number(n)) => Ok(SqlParam::Float(*n)),
                (InferredType::Float, RangeBound::Text(t)) => t
                    .trim()
                    .parse::<f64>()
                    .map(SqlParam::Float)
                    .map_err(|_| format!("range bound '{}' is not a number", t)),
                (_, RangeBound::Text(t)) if NaiveDate::parse_from_str(t.trim(), "%Y-%m-%d").is_ok() => {
                    Ok(SqlParam::Text(t.trim().to_string()))
                }
                (_, other) => Err(format!("range bound {:?} is not an ISO date", other)),
            }
        };

        let value = self.dialect.cast(ident, compare_type);
        let mut params = Params::new(self.dialect);
        let mut checks = Vec::new();
        if let Some(min) = min {
            let placeholder = params.push(to_param(min)?);
            checks.push(format!("{} < {}", value, self.dialect.cast(&placeholder, compare_type)));
        }
        if let Some(max) = max {
            let placeholder = params.push(to_param(max)?);
            checks.push(format!("{} > {}", value, self.dialect.cast(&placeholder, compare_type)));
        }

        Ok(Predicate {
            sql: format!("{} IS NOT NULL AND ({})", ident, checks.join(" OR ")),
            params: params.values,
        })
    }

    fn enumeration(
        &self,
        spec: &RuleSpecification,
        ident: &str,
        text: &str,
    ) -> std::result::Result<Predicate, String> {
        if spec.parameters.allowed_values.is_empty() {
            return Err("enumeration rule has no allowed values".to_string());
        }
        let literals = spec
            .parameters
            .allowed_values
            .iter()
            .map(|v| self.dialect.quote_literal(v))
            .collect::<Vec<_>>()
            .join(", ");
        Ok(Predicate {
            sql: format!(
                "{} IS NOT NULL AND {} NOT IN ({})",
                ident,
                text,
                literals
            ),
            params: Vec::new(),
        })
    }

    /// Rows whose value occurs more than once; no join, the subquery reads
    /// the same table
    fn uniqueness(&self, ident: &str, table: &TableRef) -> Predicate {
        Predicate {
            sql: format!(
                "{ident} IN (SELECT {ident} FROM {table} WHERE {ident} IS NOT NULL GROUP BY {ident} HAVING COUNT(*) > 1)",
                ident = ident,
                table = self.dialect.qualify(table)
            ),
            params: Vec::new(),
        }
    }
}

fn integral(bound: &Option<RangeBound>) -> bool {
    match bound {
        None => true,
        Some(RangeBound::Number(n)) => n.fract() == 0.0,
        Some(RangeBound::Text(t)) => t.trim().parse::<i64>().is_ok(),
    }
}

/// Caller's id, or `{column}:{kind}:{hash}` over the full specification
pub fn rule_id_for(spec: &RuleSpecification) -> String {
    if let Some(id) = spec.rule_id.as_deref().filter(|id| !id.trim().is_empty()) {
        return id.to_string();
    }
    let mut hasher = Sha256::new();
    hasher.update(spec.column_name.as_bytes());
    hasher.update([0]);
    hasher.update(spec.rule_kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(spec.rule_text.as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_string(&spec.parameters).unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    let hash: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}:{}:{}", spec.column_name, spec.rule_kind, hash)
}
