//! Extraction/Load Orchestrator - Main ingestion coordinator
//!
//! One run: discover the source units, extract them concurrently (bounded by
//! `max_parallel_units`), merge the fragments in this task, then create or
//! evolve each destination table and append every unit in its own
//! transaction. A unit that fails after its retries is reported and skipped;
//! its siblings still load.

use crate::catalog::SchemaCatalog;
use crate::config::IngestionSettings;
use crate::connectors::{
    open_connector, ExtractionRequest, PipelineIdentity, PipelineIdentityResolver, Record,
    SourceConnector, SourceUnit,
};
use crate::db::{Destination, TableRef};
use crate::error::LumosError;
use crate::ingestion::retry::RetryPolicy;
use crate::ingestion::schema_inference::SchemaInference;
use crate::ingestion::{LoadResult, LoadStage, LoadStatus, UnitFailure};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

type ExtractOutcome = std::result::Result<Vec<Record>, (LumosError, usize)>;

/// Ingestion Orchestrator - Coordinates the entire ingestion process
pub struct ExtractionLoadOrchestrator {
    destination: Arc<dyn Destination>,
    retry: RetryPolicy,
    settings: IngestionSettings,
    schema_inference: SchemaInference,
}

/// Records extracted for one destination table, in unit order
struct TableBatch {
    table: TableRef,
    units: Vec<(SourceUnit, Vec<Record>)>,
}

/// Mutable state of one run; only the orchestrator task touches it
struct RunState {
    tables_loaded: Vec<String>,
    row_counts: BTreeMap<String, u64>,
    failures: Vec<UnitFailure>,
}

impl RunState {
    fn fail(&mut self, unit: &str, stage: LoadStage, err: &LumosError, attempts: usize) {
        error!(unit, ?stage, attempts, error = %err, "Unit failed");
        self.failures.push(UnitFailure {
            unit: unit.to_string(),
            stage,
            error: err.to_string(),
            attempts,
        });
    }
}

impl ExtractionLoadOrchestrator {
    pub fn new(destination: Arc<dyn Destination>, retry: RetryPolicy, settings: IngestionSettings) -> Self {
        Self {
            destination,
            retry,
            settings,
            schema_inference: SchemaInference::new(),
        }
    }

    pub async fn run(
        &self,
        catalog: &mut SchemaCatalog,
        identity: &PipelineIdentity,
        request: &ExtractionRequest,
    ) -> LoadResult {
        self.run_with_cancel(catalog, identity, request, CancellationToken::new())
            .await
    }

    /// Same as [`run`](Self::run); cancelling the token stops extraction and
    /// skips tables not yet written. Tables already written stay loaded.
    pub async fn run_with_cancel(
        &self,
        catalog: &mut SchemaCatalog,
        identity: &PipelineIdentity,
        request: &ExtractionRequest,
        cancel: CancellationToken,
    ) -> LoadResult {
        let source = PipelineIdentityResolver::redacted_location(request);
        match open_connector(request) {
            Ok(connector) => {
                self.run_connector(catalog, identity, connector, &source, cancel)
                    .await
            }
            Err(err) => {
                let started_at = Utc::now();
                let mut state = RunState::new();
                state.fail(&source, LoadStage::Discover, &err, 1);
                self.finish(identity, Uuid::new_v4().to_string(), started_at, state)
            }
        }
    }

    #[instrument(skip_all, fields(pipeline = %identity.pipeline_name, dataset = %identity.dataset_name))]
    pub async fn run_connector(
        &self,
        catalog: &mut SchemaCatalog,
        identity: &PipelineIdentity,
        connector: Arc<dyn SourceConnector>,
        source: &str,
        cancel: CancellationToken,
    ) -> LoadResult {
        let run_id = Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let mut state = RunState::new();

        info!(run_id = %run_id, kind = %connector.source_kind(), "Starting extraction run");

        let units = match self.retry.run("discover", || connector.discover()).await {
            Ok(units) => units,
            Err((err, attempts)) => {
                state.fail(source, LoadStage::Discover, &err, attempts);
                return self.finish(identity, run_id, started_at, state);
            }
        };
        if units.is_empty() {
            warn!(source, "No source units matched the selector");
        }

        let extracted = self.extract_all(Arc::clone(&connector), units, &cancel).await;
        let batches = self.group_by_table(identity, extracted, &mut state);

        if !batches.is_empty() {
            if let Err((err, attempts)) = self
                .retry
                .run("ensure dataset", || self.destination.ensure_dataset(&identity.dataset_name))
                .await
            {
                for batch in &batches {
                    for (unit, _) in &batch.units {
                        state.fail(&unit.locator, LoadStage::Load, &err, attempts);
                    }
                }
                return self.finish(identity, run_id, started_at, state);
            }
        }

        for batch in batches {
            if cancel.is_cancelled() {
                let err = LumosError::Cancelled(format!("{} not loaded", batch.table));
                for (unit, _) in &batch.units {
                    state.fail(&unit.locator, LoadStage::Load, &err, 0);
                }
                continue;
            }
            self.load_table(catalog, batch, &mut state).await;
        }

        self.finish(identity, run_id, started_at, state)
    }

    /// Extracts every unit concurrently. Results come back in unit order.
    async fn extract_all(
        &self,
        connector: Arc<dyn SourceConnector>,
        units: Vec<SourceUnit>,
        cancel: &CancellationToken,
    ) -> Vec<(SourceUnit, ExtractOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel_units.max(1)));
        let mut tasks = JoinSet::new();

        for (index, unit) in units.iter().cloned().enumerate() {
            let connector = Arc::clone(&connector);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry.clone();
            let cancel = cancel.clone();

            tasks.spawn(async move {
                let outcome: ExtractOutcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err((
                        LumosError::Cancelled(format!("{} not extracted", unit.locator)),
                        0,
                    )),
                    outcome = async {
                        match semaphore.acquire_owned().await {
                            Ok(_permit) => {
                                let operation = format!("extract {}", unit.locator);
                                retry.run(&operation, || connector.extract(&unit)).await
                            }
                            Err(e) => Err((LumosError::Extraction(e.to_string()), 0)),
                        }
                    } => outcome,
                };
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<ExtractOutcome>> = units.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => outcomes[index] = Some(outcome),
                Err(e) => error!(error = %e, "Extraction task aborted"),
            }
        }

        units
            .into_iter()
            .zip(outcomes)
            .map(|(unit, outcome)| {
                let outcome = outcome.unwrap_or_else(|| {
                    Err((
                        LumosError::Extraction(format!("{}: extraction task aborted", unit.locator)),
                        0,
                    ))
                });
                (unit, outcome)
            })
            .collect()
    }

    /// Single merge point for the extracted fragments
    fn group_by_table(
        &self,
        identity: &PipelineIdentity,
        extracted: Vec<(SourceUnit, ExtractOutcome)>,
        state: &mut RunState,
    ) -> Vec<TableBatch> {
        let mut batches: Vec<TableBatch> = Vec::new();
        let units: Vec<SourceUnit> = extracted.iter().map(|(unit, _)| unit.clone()).collect();
        let tables = identity.tables_for(&units);

        for ((unit, outcome), table_name) in extracted.into_iter().zip(tables) {
            if table_name != identity.table_for(&unit) {
                warn!(unit = %unit.locator, table = %table_name, "Unit name collides with another unit, using a suffixed table");
            }
            match outcome {
                Ok(records) if records.is_empty() => {
                    warn!(unit = %unit.locator, "Unit has no records, skipping");
                }
                Ok(records) => {
                    info!(unit = %unit.locator, rows = records.len(), "Extracted unit");
                    let table = TableRef::new(identity.dataset_name.clone(), table_name);
                    match batches.iter_mut().find(|b| b.table == table) {
                        Some(batch) => batch.units.push((unit, records)),
                        None => batches.push(TableBatch {
                            table,
                            units: vec![(unit, records)],
                        }),
                    }
                }
                Err((err, attempts)) => {
                    state.fail(&unit.locator, LoadStage::Extract, &err, attempts);
                }
            }
        }

        batches
    }

    async fn load_table(&self, catalog: &mut SchemaCatalog, batch: TableBatch, state: &mut RunState) {
        let key = batch.table.to_string();
        let schema = self
            .schema_inference
            .infer_schema(&key, batch.units.iter().flat_map(|(_, records)| records));
        let columns = catalog.merged_columns(&key, &schema.columns);

        let synced = self
            .retry
            .run("sync table", || self.destination.sync_table(&batch.table, &columns))
            .await;
        if let Err((err, attempts)) = synced {
            let err = LumosError::Load(format!("{}: {}", key, err));
            for (unit, _) in &batch.units {
                state.fail(&unit.locator, LoadStage::Load, &err, attempts);
            }
            return;
        }

        let mut rows = 0u64;
        let mut loaded: Vec<&[Record]> = Vec::new();
        for (unit, records) in &batch.units {
            let operation = format!("load {}", unit.locator);
            let inserted = self
                .retry
                .run(&operation, || {
                    self.destination.insert_records(
                        &batch.table,
                        &columns,
                        records,
                        self.settings.batch_size,
                    )
                })
                .await;
            match inserted {
                Ok(written) => {
                    rows += written;
                    loaded.push(records.as_slice());
                }
                Err((err, attempts)) => {
                    let err = LumosError::Load(format!("{}: {}", key, err));
                    state.fail(&unit.locator, LoadStage::Load, &err, attempts);
                }
            }
        }

        if !loaded.is_empty() {
            // Rolled-back units must not shape the catalog
            let loaded_schema = if loaded.len() == batch.units.len() {
                schema
            } else {
                self.schema_inference
                    .infer_schema(&key, loaded.iter().copied().flatten())
            };
            catalog.update(&key, &loaded_schema.columns);
            info!(table = %key, rows, "Loaded table");
            state.tables_loaded.push(key.clone());
            state.row_counts.insert(key, rows);
        }
    }

    fn finish(
        &self,
        identity: &PipelineIdentity,
        run_id: String,
        started_at: chrono::DateTime<Utc>,
        state: RunState,
    ) -> LoadResult {
        let status = LoadStatus::from_counts(state.tables_loaded.len(), state.failures.len());
        let error = if !state.failures.is_empty() {
            Some(format!(
                "{} unit(s) failed: {}",
                state.failures.len(),
                state
                    .failures
                    .iter()
                    .map(|f| format!("{} ({})", f.unit, f.error))
                    .collect::<Vec<_>>()
                    .join("; ")
            ))
        } else if state.tables_loaded.is_empty() {
            Some("No records were extracted from the source".to_string())
        } else {
            None
        };

        info!(
            run_id = %run_id,
            %status,
            tables = state.tables_loaded.len(),
            failed_units = state.failures.len(),
            "Extraction run finished"
        );

        LoadResult {
            run_id,
            pipeline_name: identity.pipeline_name.clone(),
            dataset_name: identity.dataset_name.clone(),
            status,
            tables_loaded: state.tables_loaded,
            row_counts: state.row_counts,
            failed_units: state.failures,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }
}

impl RunState {
    fn new() -> Self {
        Self {
            tables_loaded: Vec::new(),
            row_counts: BTreeMap::new(),
            failures: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnMetadata;
    use crate::connectors::formats::file_stem;
    use crate::connectors::SourceKind;
    use crate::db::{FillCounts, SqlDialect, SqlParam};
    use crate::error::Result;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Destination that keeps inserted rows in memory
    #[derive(Default)]
    struct MemoryDestination {
        rows: Mutex<BTreeMap<String, u64>>,
        synced: Mutex<Vec<(String, Vec<String>)>>,
        fail_inserts: AtomicUsize,
        /// Inserts whose first record has this `id` always fail
        poison_id: Option<i64>,
    }

    #[async_trait]
    impl Destination for MemoryDestination {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Sqlite
        }
        async fn ensure_dataset(&self, _dataset: &str) -> Result<()> {
            Ok(())
        }
        async fn sync_table(&self, table: &TableRef, columns: &[ColumnMetadata]) -> Result<()> {
            self.synced.lock().unwrap().push((
                table.to_string(),
                columns.iter().map(|c| c.column_name.clone()).collect(),
            ));
            Ok(())
        }
        async fn insert_records(
            &self,
            table: &TableRef,
            _columns: &[ColumnMetadata],
            records: &[Record],
            _batch_size: usize,
        ) -> Result<u64> {
            if self.poison_id.is_some()
                && records.first().and_then(|r| r.get("id")).and_then(|v| v.as_i64()) == self.poison_id
            {
                return Err(LumosError::Load("constraint violated".to_string()));
            }
            if self.fail_inserts.load(Ordering::SeqCst) > 0 {
                self.fail_inserts.fetch_sub(1, Ordering::SeqCst);
                return Err(LumosError::Database(sqlx::Error::PoolTimedOut));
            }
            *self.rows.lock().unwrap().entry(table.to_string()).or_default() += records.len() as u64;
            Ok(records.len() as u64)
        }
        async fn row_count(&self, table: &TableRef) -> Result<u64> {
            Ok(*self.rows.lock().unwrap().get(&table.to_string()).unwrap_or(&0))
        }
        async fn count(&self, _sql: &str, _params: &[SqlParam]) -> Result<u64> {
            Ok(0)
        }
        async fn sample(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<Option<String>>> {
            Ok(Vec::new())
        }
        async fn fill_counts(&self, _table: &TableRef, columns: &[String]) -> Result<FillCounts> {
            Ok(FillCounts { row_count: 0, non_null: vec![0; columns.len()] })
        }
    }

    /// Source whose units are fixed record sets; `None` fails extraction
    struct StaticSource {
        units: Vec<(&'static str, Option<Vec<Record>>)>,
    }

    #[async_trait]
    impl SourceConnector for StaticSource {
        fn source_kind(&self) -> SourceKind {
            SourceKind::Filesystem
        }
        async fn discover(&self) -> Result<Vec<SourceUnit>> {
            Ok(self
                .units
                .iter()
                .map(|(entry, _)| SourceUnit {
                    locator: locator(entry),
                    name: file_stem(entry),
                    format: None,
                })
                .collect())
        }
        async fn extract(&self, unit: &SourceUnit) -> Result<Vec<Record>> {
            let (_, records) = self
                .units
                .iter()
                .find(|(entry, _)| locator(entry) == unit.locator)
                .unwrap();
            records
                .clone()
                .ok_or_else(|| LumosError::Extraction(format!("{}: malformed", unit.locator)))
        }
    }

    /// Bare names become `/src/<name>.json`; names with an extension are kept
    fn locator(entry: &str) -> String {
        if entry.contains('.') {
            format!("/src/{}", entry)
        } else {
            format!("/src/{}.json", entry)
        }
    }

    fn rows(values: Vec<serde_json::Value>) -> Option<Vec<Record>> {
        Some(values.into_iter().map(|v| v.as_object().cloned().unwrap()).collect())
    }

    fn identity(table_override: Option<&str>) -> PipelineIdentity {
        PipelineIdentity {
            pipeline_name: "datalumos_filesystem_src_0000".to_string(),
            dataset_name: "filesystem_0000".to_string(),
            table_name: table_override.unwrap_or("src").to_string(),
            table_overridden: table_override.is_some(),
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2))
    }

    fn orchestrator(dest: Arc<MemoryDestination>) -> ExtractionLoadOrchestrator {
        ExtractionLoadOrchestrator::new(dest, fast_retry(), IngestionSettings::default())
    }

    #[tokio::test]
    async fn test_one_malformed_unit_is_partial() {
        let dest = Arc::new(MemoryDestination::default());
        let source = Arc::new(StaticSource {
            units: vec![
                ("a", rows(vec![json!({"id": 1})])),
                ("b", rows(vec![json!({"id": 2})])),
                ("bad", None),
                ("c", rows(vec![json!({"id": 3}), json!({"id": 4})])),
                ("d", rows(vec![json!({"id": 5})])),
            ],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(None), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Partial);
        assert_eq!(result.tables_loaded.len(), 4);
        assert_eq!(result.row_counts["filesystem_0000.c"], 2);
        assert_eq!(result.failed_units.len(), 1);
        assert_eq!(result.failed_units[0].stage, LoadStage::Extract);
        assert!(result.error.unwrap().contains("bad"));
        assert_eq!(catalog.table_names().count(), 4);
    }

    #[tokio::test]
    async fn test_override_appends_all_units_to_one_table() {
        let dest = Arc::new(MemoryDestination::default());
        let source = Arc::new(StaticSource {
            units: vec![
                ("jan", rows(vec![json!({"id": 1})])),
                ("feb", rows(vec![json!({"id": 2, "note": "x"})])),
            ],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(Some("all_months")), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.tables_loaded, vec!["filesystem_0000.all_months"]);
        assert_eq!(result.total_rows(), 2);
        let synced = dest.synced.lock().unwrap();
        assert_eq!(synced.len(), 1);
        assert!(synced[0].1.contains(&"note".to_string()));
    }

    #[tokio::test]
    async fn test_transient_insert_failure_is_retried() {
        let dest = Arc::new(MemoryDestination::default());
        dest.fail_inserts.store(2, Ordering::SeqCst);
        let source = Arc::new(StaticSource {
            units: vec![("a", rows(vec![json!({"id": 1})]))],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(None), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(dest.row_count(&TableRef::new("filesystem_0000", "a")).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_insert_retries_fail_the_run() {
        let dest = Arc::new(MemoryDestination::default());
        dest.fail_inserts.store(10, Ordering::SeqCst);
        let source = Arc::new(StaticSource {
            units: vec![("a", rows(vec![json!({"id": 1})]))],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(None), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Failed);
        assert_eq!(result.failed_units[0].stage, LoadStage::Load);
        assert_eq!(result.failed_units[0].attempts, 3);
        assert!(catalog.get("filesystem_0000.a").is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_loads_nothing() {
        let dest = Arc::new(MemoryDestination::default());
        let source = Arc::new(StaticSource {
            units: vec![("a", rows(vec![json!({"id": 1})]))],
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(None), source, "/src", cancel)
            .await;

        assert_eq!(result.status, LoadStatus::Failed);
        assert_eq!(result.failed_units[0].stage, LoadStage::Extract);
        assert!(result.failed_units[0].error.contains("not extracted"));
        assert!(dest.synced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_source_is_failed() {
        let dest = Arc::new(MemoryDestination::default());
        let source = Arc::new(StaticSource { units: vec![] });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(dest)
            .run_connector(&mut catalog, &identity(None), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Failed);
        assert!(result.error.is_some());
    }
    #[tokio::test]
    async fn test_colliding_unit_names_load_into_separate_tables() {
        let dest = Arc::new(MemoryDestination::default());
        let source = Arc::new(StaticSource {
            units: vec![
                ("a.csv", rows(vec![json!({"id": 1})])),
                ("a.json", rows(vec![json!({"id": 2}), json!({"id": 3})])),
            ],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(None), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Success);
        assert_eq!(result.tables_loaded.len(), 2);
        assert_eq!(result.row_counts["filesystem_0000.a"], 1);
        let other = result
            .tables_loaded
            .iter()
            .find(|t| t.as_str() != "filesystem_0000.a")
            .unwrap();
        assert!(other.starts_with("filesystem_0000.a_"));
        assert_eq!(result.row_counts[other], 2);
    }

    #[tokio::test]
    async fn test_catalog_ignores_columns_of_rolled_back_units() {
        let dest = Arc::new(MemoryDestination {
            poison_id: Some(99),
            ..Default::default()
        });
        let source = Arc::new(StaticSource {
            units: vec![
                ("jan", rows(vec![json!({"id": 1, "amount": 10})])),
                ("feb", rows(vec![json!({"id": 99, "amount": "n/a", "extra": true})])),
            ],
        });

        let mut catalog = SchemaCatalog::new();
        let result = orchestrator(Arc::clone(&dest))
            .run_connector(&mut catalog, &identity(Some("months")), source, "/src", CancellationToken::new())
            .await;

        assert_eq!(result.status, LoadStatus::Partial);
        assert_eq!(result.failed_units.len(), 1);
        assert!(result.failed_units[0].unit.ends_with("feb.json"));
        let key = "filesystem_0000.months";
        assert!(catalog.column(key, "extra").is_none());
        assert_eq!(
            catalog.column(key, "amount").unwrap().inferred_type,
            crate::ingestion::schema_inference::InferredType::Integer
        );
    }
}
