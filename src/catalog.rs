//! Schema Catalog - per-table column history across successive loads
//!
//! One instance lives for the process (or is persisted to a JSON file between
//! CLI invocations) and is passed explicitly into every orchestrator run.
//! Columns are never removed. A column whose type conflicts with its history
//! is widened and the change is kept as a data-quality signal.

use crate::error::{LumosError, Result};
use crate::ingestion::schema_inference::{InferredColumn, InferredType, MAX_SAMPLE_VALUES};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, info};

/// A type widening seen for one column
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeChange {
    pub from: InferredType,
    pub to: InferredType,
    /// Zero-based index of the load that caused the change
    pub load: u64,
    pub observed_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub column_name: String,
    pub inferred_type: InferredType,
    pub nullable: bool,
    pub sample_values: BTreeSet<String>,
    /// Append-only widening history
    #[serde(default)]
    pub type_history: Vec<TypeChange>,
}

impl ColumnMetadata {
    pub fn new(column_name: impl Into<String>, inferred_type: InferredType) -> Self {
        Self {
            column_name: column_name.into(),
            inferred_type,
            nullable: true,
            sample_values: BTreeSet::new(),
            type_history: Vec::new(),
        }
    }

    /// Column type became less specific at some point
    pub fn type_widened(&self) -> bool {
        !self.type_history.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnMetadata>,
    /// Number of loads merged into this table
    pub loads: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SchemaCatalog {
    tables: BTreeMap<String, TableSchema>,
}

impl SchemaCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a catalog saved by [`SchemaCatalog::save`]; a missing file is an
    /// empty catalog.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            LumosError::Configuration(format!("Invalid catalog file {}: {}", path.display(), e))
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Latest column snapshot; empty for an unknown table
    pub fn get(&self, table: &str) -> &[ColumnMetadata] {
        self.tables
            .get(table)
            .map(|t| t.columns.as_slice())
            .unwrap_or(&[])
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnMetadata> {
        self.get(table).iter().find(|c| c.column_name == column)
    }

    pub fn table(&self, table: &str) -> Option<&TableSchema> {
        self.tables.get(table)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    /// Columns the table would have after merging `observed`, without
    /// touching the catalog. The orchestrator plans DDL from this and only
    /// calls [`SchemaCatalog::update`] once the write succeeded.
    pub fn merged_columns(&self, table: &str, observed: &[InferredColumn]) -> Vec<ColumnMetadata> {
        let existing = self.tables.get(table);
        let load = existing.map(|t| t.loads).unwrap_or(0);
        let now = Utc::now();

        let mut merged: Vec<ColumnMetadata> = existing
            .map(|t| t.columns.clone())
            .unwrap_or_default();
        let first_load = existing.is_none();

        for column in &mark_missing_nullable(&mut merged, observed) {
            debug!(table, column = %column, "Column absent from this load");
        }

        for obs in observed {
            match merged.iter_mut().find(|c| c.column_name == obs.name) {
                Some(current) => {
                    let widened = current.inferred_type.promote(obs.data_type);
                    // Categorical to string is a profile change, not a storage change
                    if widened.storage_class() != current.inferred_type.storage_class() {
                        current.type_history.push(TypeChange {
                            from: current.inferred_type,
                            to: widened,
                            load,
                            observed_at: now,
                        });
                    }
                    current.inferred_type = widened;
                    current.nullable |= obs.nullable;
                    merge_samples(&mut current.sample_values, &obs.sample_values);
                }
                None => {
                    merged.push(ColumnMetadata {
                        column_name: obs.name.clone(),
                        inferred_type: obs.data_type,
                        // Rows from earlier loads have no value for it
                        nullable: obs.nullable || !first_load,
                        sample_values: obs.sample_values.clone(),
                        type_history: obs
                            .promotions
                            .iter()
                            .map(|p| TypeChange {
                                from: p.from,
                                to: p.to,
                                load,
                                observed_at: now,
                            })
                            .collect(),
                    });
                }
            }
        }

        merged
    }

    /// Merges one successful load into the table history and returns the new
    /// snapshot.
    pub fn update(&mut self, table: &str, observed: &[InferredColumn]) -> Vec<ColumnMetadata> {
        let merged = self.merged_columns(table, observed);

        let previous = self.tables.get(table);
        let added: Vec<&str> = merged
            .iter()
            .filter(|c| previous.map_or(true, |t| !t.columns.iter().any(|p| p.column_name == c.column_name)))
            .map(|c| c.column_name.as_str())
            .collect();
        let widened: Vec<String> = merged
            .iter()
            .filter(|c| {
                previous
                    .and_then(|t| t.columns.iter().find(|p| p.column_name == c.column_name))
                    .is_some_and(|p| p.inferred_type.storage_class() != c.inferred_type.storage_class())
            })
            .map(|c| c.column_name.clone())
            .collect();

        if previous.is_some() && (!added.is_empty() || !widened.is_empty()) {
            info!(table, ?added, ?widened, "Schema evolved");
        }

        let loads = previous.map(|t| t.loads).unwrap_or(0) + 1;
        self.tables.insert(
            table.to_string(),
            TableSchema {
                columns: merged.clone(),
                loads,
                updated_at: Utc::now(),
            },
        );
        merged
    }
}

/// Marks columns missing from `observed` as nullable and returns their names.
fn mark_missing_nullable(merged: &mut [ColumnMetadata], observed: &[InferredColumn]) -> Vec<String> {
    let mut missing = Vec::new();
    for column in merged.iter_mut() {
        if !observed.iter().any(|o| o.name == column.column_name) {
            column.nullable = true;
            missing.push(column.column_name.clone());
        }
    }
    missing
}

fn merge_samples(into: &mut BTreeSet<String>, from: &BTreeSet<String>) {
    for value in from {
        if into.len() >= MAX_SAMPLE_VALUES {
            break;
        }
        into.insert(value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::schema_inference::TypePromotion;

    fn observed(name: &str, data_type: InferredType) -> InferredColumn {
        InferredColumn {
            name: name.to_string(),
            data_type,
            nullable: false,
            sample_values: BTreeSet::from(["x".to_string()]),
            promotions: Vec::new(),
        }
    }

    #[test]
    fn test_first_load_creates_table() {
        let mut catalog = SchemaCatalog::new();
        let cols = catalog.update(
            "ds.orders",
            &[observed("id", InferredType::Integer), observed("note", InferredType::String)],
        );
        assert_eq!(cols.len(), 2);
        assert!(!cols[0].nullable);
        assert!(!cols[0].type_widened());
        assert_eq!(catalog.table("ds.orders").unwrap().loads, 1);
        assert!(catalog.get("ds.unknown").is_empty());
    }

    #[test]
    fn test_new_column_is_appended_and_nullable() {
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("id", InferredType::Integer)]);
        let cols = catalog.update(
            "t",
            &[observed("id", InferredType::Integer), observed("email", InferredType::String)],
        );
        assert_eq!(cols[1].column_name, "email");
        assert!(cols[1].nullable);
    }

    #[test]
    fn test_conflicting_type_is_widened_and_recorded() {
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("amount", InferredType::Integer)]);
        catalog.update("t", &[observed("amount", InferredType::Float)]);
        let cols = catalog.update("t", &[observed("amount", InferredType::Integer)]);

        let amount = &cols[0];
        assert_eq!(amount.inferred_type, InferredType::Float);
        assert_eq!(amount.type_history.len(), 1);
        assert_eq!(amount.type_history[0].from, InferredType::Integer);
        assert_eq!(amount.type_history[0].load, 1);
    }

    #[test]
    fn test_categorical_to_string_is_not_a_widening() {
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("status", InferredType::Categorical)]);
        let cols = catalog.update("t", &[observed("status", InferredType::String)]);
        assert_eq!(cols[0].inferred_type, InferredType::String);
        assert!(cols[0].type_history.is_empty());

        let cols = catalog.update("t", &[observed("status", InferredType::Categorical)]);
        assert_eq!(cols[0].inferred_type, InferredType::String);
        assert!(!cols[0].type_widened());
    }

    #[test]
    fn test_missing_columns_are_kept() {
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("a", InferredType::Integer), observed("b", InferredType::Date)]);
        let cols = catalog.update("t", &[observed("a", InferredType::Integer)]);
        assert_eq!(cols.len(), 2);
        assert!(cols[1].nullable);
        assert_eq!(cols[1].inferred_type, InferredType::Date);
    }

    #[test]
    fn test_merged_columns_is_pure() {
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("a", InferredType::Integer)]);
        let planned = catalog.merged_columns("t", &[observed("a", InferredType::String)]);
        assert_eq!(planned[0].inferred_type, InferredType::String);
        assert_eq!(catalog.get("t")[0].inferred_type, InferredType::Integer);
        assert_eq!(catalog.table("t").unwrap().loads, 1);
    }

    #[test]
    fn test_in_load_promotions_seed_history() {
        let mut catalog = SchemaCatalog::new();
        let mut col = observed("v", InferredType::Float);
        col.promotions.push(TypePromotion {
            from: InferredType::Integer,
            to: InferredType::Float,
        });
        let cols = catalog.update("t", &[col]);
        assert!(cols[0].type_widened());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        let mut catalog = SchemaCatalog::new();
        catalog.update("t", &[observed("a", InferredType::Boolean)]);
        catalog.save(&path).unwrap();

        let restored = SchemaCatalog::load(&path).unwrap();
        assert_eq!(restored.get("t"), catalog.get("t"));
        assert!(SchemaCatalog::load(&dir.path().join("missing.json")).unwrap().table_names().next().is_none());
    }
}
