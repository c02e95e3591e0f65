//! Completeness profiling: per-column fill rates over a loaded table

use crate::catalog::ColumnMetadata;
use crate::db::{Destination, TableRef};
use crate::error::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ColumnFillRate {
    pub column_name: String,
    pub null_count: u64,
    /// Non-null share of rows, 0-100 rounded to two decimals. An empty
    /// table reports 0.
    pub fill_rate_percentage: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CompletenessReport {
    pub table: String,
    pub row_count: u64,
    pub columns: Vec<ColumnFillRate>,
}

impl CompletenessReport {
    /// Columns filled below `threshold` percent, in column order
    pub fn below(&self, threshold: f64) -> impl Iterator<Item = &ColumnFillRate> {
        self.columns
            .iter()
            .filter(move |c| c.fill_rate_percentage < threshold)
    }
}

/// One `COUNT(*)`/`COUNT(col)` pass over `table` for every catalog column.
#[instrument(skip_all, fields(table = %table))]
pub async fn profile(
    destination: &dyn Destination,
    table: &TableRef,
    columns: &[ColumnMetadata],
) -> Result<CompletenessReport> {
    let names: Vec<String> = columns.iter().map(|c| c.column_name.clone()).collect();
    let counts = destination.fill_counts(table, &names).await?;

    let columns = names
        .into_iter()
        .zip(counts.non_null)
        .map(|(column_name, non_null)| fill_rate(column_name, non_null, counts.row_count))
        .collect::<Vec<_>>();

    debug!(rows = counts.row_count, columns = columns.len(), "Profiled completeness");
    Ok(CompletenessReport {
        table: table.to_string(),
        row_count: counts.row_count,
        columns,
    })
}

fn fill_rate(column_name: String, non_null: u64, row_count: u64) -> ColumnFillRate {
    let non_null = non_null.min(row_count);
    let percentage = if row_count == 0 {
        0.0
    } else {
        (non_null as f64 * 10_000.0 / row_count as f64).round() / 100.0
    };
    ColumnFillRate {
        column_name,
        null_count: row_count - non_null,
        fill_rate_percentage: percentage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_sqlite_pool, SqliteDestination};
    use crate::ingestion::schema_inference::InferredType;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_fill_rate_rounding() {
        let rate = fill_rate("a".to_string(), 2, 3);
        assert_eq!(rate.null_count, 1);
        assert_eq!(rate.fill_rate_percentage, 66.67);

        let empty = fill_rate("a".to_string(), 0, 0);
        assert_eq!(empty.null_count, 0);
        assert_eq!(empty.fill_rate_percentage, 0.0);
    }

    #[tokio::test]
    async fn test_profile_sqlite_table() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("lumos.db").display());
        let pool = init_sqlite_pool(&url, 2, Duration::from_secs(5)).await.unwrap();
        let destination = SqliteDestination::new(pool);

        let table = TableRef::new("ds", "people");
        let columns = vec![
            ColumnMetadata::new("name", InferredType::String),
            ColumnMetadata::new("email", InferredType::String),
        ];
        destination.sync_table(&table, &columns).await.unwrap();

        let records: Vec<_> = [
            json!({"name": "a", "email": "a@x.io"}),
            json!({"name": "b", "email": null}),
            json!({"name": "c"}),
            json!({"name": "d", "email": "d@x.io"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect();
        destination.insert_records(&table, &columns, &records, 100).await.unwrap();

        let report = profile(&destination, &table, &columns).await.unwrap();
        assert_eq!(report.row_count, 4);
        assert_eq!(report.columns[0].fill_rate_percentage, 100.0);
        assert_eq!(report.columns[1].null_count, 2);
        assert_eq!(report.columns[1].fill_rate_percentage, 50.0);

        let incomplete: Vec<_> = report.below(95.0).map(|c| c.column_name.as_str()).collect();
        assert_eq!(incomplete, vec!["email"]);
    }
}
