//! Rule Executor - runs compiled rules against the destination
//!
//! Rules run concurrently up to `max_parallel_rules`, each under its own
//! timeout. A failing or timed-out rule becomes a failed outcome; it never
//! aborts its siblings and never reads as zero violations. Outcomes are
//! returned in input order regardless of completion order.

use crate::config::ValidationSettings;
use crate::db::{Destination, TableRef};
use crate::error::LumosError;
use crate::validation::severity::SeverityThresholds;
use crate::validation::{CompiledRule, RuleFailure, RuleOutcome, MAX_SAMPLE_VIOLATIONS};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Shown in samples for a NULL violating value
const NULL_SAMPLE: &str = "NULL";

pub struct RuleExecutor {
    destination: Arc<dyn Destination>,
    timeout: Duration,
    max_parallel: usize,
    cancel_grace: Duration,
    thresholds: SeverityThresholds,
}

impl RuleExecutor {
    pub fn new(destination: Arc<dyn Destination>, settings: &ValidationSettings) -> Self {
        Self {
            destination,
            timeout: settings.rule_timeout,
            max_parallel: settings.max_parallel_rules.max(1),
            cancel_grace: settings.cancel_grace,
            thresholds: settings.severity.clone(),
        }
    }

    /// Runs a single rule, including the table row count it needs for
    /// severity
    pub async fn execute(&self, rule: &CompiledRule) -> RuleOutcome {
        let row_count = self.row_count(&rule.table).await;
        run_rule(
            Arc::clone(&self.destination),
            rule.clone(),
            row_count,
            self.timeout,
            self.thresholds.clone(),
        )
        .await
    }

    /// Runs `rules` concurrently. Cancelling the token stops issuing new
    /// rules; in-flight ones get `cancel_grace` to finish before they are
    /// aborted. Rules that never completed are reported as cancelled.
    pub async fn execute_batch(&self, rules: Vec<CompiledRule>, cancel: CancellationToken) -> Vec<RuleOutcome> {
        let mut outcomes: Vec<Option<RuleOutcome>> = vec![None; rules.len()];

        let mut row_counts: HashMap<TableRef, Result<u64, String>> = HashMap::new();
        for rule in &rules {
            if !row_counts.contains_key(&rule.table) {
                let count = self.row_count(&rule.table).await;
                row_counts.insert(rule.table.clone(), count);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        let mut tasks = JoinSet::new();

        for (index, rule) in rules.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                info!(issued = index, remaining = rules.len() - index, "Stopped issuing rules");
                break;
            };

            let row_count = row_counts
                .get(&rule.table)
                .cloned()
                .unwrap_or_else(|| Err("row count unavailable".to_string()));
            let destination = Arc::clone(&self.destination);
            let rule = rule.clone();
            let timeout = self.timeout;
            let thresholds = self.thresholds.clone();

            tasks.spawn(async move {
                let _permit = permit;
                (index, run_rule(destination, rule, row_count, timeout, thresholds).await)
            });
        }

        let grace = self.cancel_grace;
        let deadline = async {
            cancel.cancelled().await;
            tokio::time::sleep(grace).await;
        };
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((index, outcome))) => outcomes[index] = Some(outcome),
                    Some(Err(e)) => error!(error = %e, "Rule task failed"),
                },
                _ = &mut deadline => {
                    warn!(in_flight = tasks.len(), "Cancellation grace period elapsed, aborting rules");
                    tasks.abort_all();
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok((index, outcome)) = joined {
                            outcomes[index] = Some(outcome);
                        }
                    }
                    break;
                }
            }
        }

        rules
            .into_iter()
            .zip(outcomes)
            .map(|(rule, outcome)| {
                outcome.unwrap_or_else(|| {
                    RuleOutcome::failed(
                        rule.rule_id,
                        rule.column_name,
                        rule.rule_kind,
                        rule.rule_text,
                        RuleFailure::Cancelled,
                    )
                })
            })
            .collect()
    }

    async fn row_count(&self, table: &TableRef) -> Result<u64, String> {
        match tokio::time::timeout(self.timeout, self.destination.row_count(table)).await {
            Ok(Ok(count)) => Ok(count),
            Ok(Err(e)) => Err(format!("row count of {} failed: {}", table, e)),
            Err(_) => Err(format!(
                "row count of {} timed out after {} ms",
                table,
                self.timeout.as_millis()
            )),
        }
    }
}

#[instrument(skip_all, fields(rule_id = %rule.rule_id, column = %rule.column_name))]
async fn run_rule(
    destination: Arc<dyn Destination>,
    rule: CompiledRule,
    row_count: Result<u64, String>,
    timeout: Duration,
    thresholds: SeverityThresholds,
) -> RuleOutcome {
    let started = Instant::now();

    let row_count = match row_count {
        Ok(count) => count,
        Err(message) => {
            warn!(error = %message, "Skipping rule, table unavailable");
            return RuleOutcome::failed(
                rule.rule_id,
                rule.column_name,
                rule.rule_kind,
                rule.rule_text,
                RuleFailure::Error { message },
            );
        }
    };

    let work = async {
        let violations = destination.count(&rule.count_query, &rule.params).await?;
        let samples = if violations == 0 {
            Vec::new()
        } else {
            destination.sample(&rule.sample_query, &rule.params).await?
        };
        Ok::<_, LumosError>((violations, samples))
    };

    let result = tokio::time::timeout(timeout, work).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let failure = match result {
        Ok(Ok((violations, samples))) => {
            let severity = thresholds.classify(violations, row_count, rule.structural);
            debug!(violations, %severity, duration_ms, "Rule executed");
            return RuleOutcome {
                rule_id: rule.rule_id,
                column_name: rule.column_name,
                rule_kind: rule.rule_kind,
                rule_text: rule.rule_text,
                violation_count: Some(violations),
                row_count: Some(row_count),
                severity: Some(severity),
                sample_violations: samples
                    .into_iter()
                    .take(MAX_SAMPLE_VIOLATIONS)
                    .map(|v| v.unwrap_or_else(|| NULL_SAMPLE.to_string()))
                    .collect(),
                failure: None,
                duration_ms,
            };
        }
        Ok(Err(e)) => {
            let err = LumosError::RuleExecution(e.to_string());
            warn!(error = %err, "Rule failed");
            RuleFailure::Error {
                message: err.to_string(),
            }
        }
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Rule timed out");
            RuleFailure::Timeout {
                after_ms: timeout.as_millis() as u64,
            }
        }
    };

    let mut outcome = RuleOutcome::failed(
        rule.rule_id,
        rule.column_name,
        rule.rule_kind,
        rule.rule_text,
        failure,
    );
    outcome.duration_ms = duration_ms;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ColumnMetadata;
    use crate::connectors::Record;
    use crate::db::{FillCounts, SqlDialect, SqlParam};
    use crate::error::Result;
    use crate::validation::severity::Severity;
    use crate::validation::RuleKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers COUNT queries from a table of canned replies keyed by SQL.
    /// A query containing `slow` sleeps first; one containing `broken` errors.
    struct ScriptedDestination {
        counts: HashMap<String, u64>,
        samples: Vec<Option<String>>,
        rows: u64,
        sleep: Duration,
        started: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedDestination {
        fn new(rows: u64) -> Self {
            Self {
                counts: HashMap::new(),
                samples: Vec::new(),
                rows,
                sleep: Duration::from_millis(200),
                started: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Destination for ScriptedDestination {
        fn dialect(&self) -> SqlDialect {
            SqlDialect::Postgres
        }
        async fn ensure_dataset(&self, _dataset: &str) -> Result<()> {
            Ok(())
        }
        async fn sync_table(&self, _table: &TableRef, _columns: &[ColumnMetadata]) -> Result<()> {
            Ok(())
        }
        async fn insert_records(&self, _: &TableRef, _: &[ColumnMetadata], _: &[Record], _: usize) -> Result<u64> {
            Ok(0)
        }
        async fn row_count(&self, _table: &TableRef) -> Result<u64> {
            Ok(self.rows)
        }
        async fn count(&self, sql: &str, _params: &[SqlParam]) -> Result<u64> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if sql.contains("slow") {
                tokio::time::sleep(self.sleep).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if sql.contains("broken") {
                return Err(LumosError::Database(sqlx::Error::Protocol("syntax error".to_string())));
            }
            Ok(*self.counts.get(sql).unwrap_or(&0))
        }
        async fn sample(&self, _sql: &str, _params: &[SqlParam]) -> Result<Vec<Option<String>>> {
            Ok(self.samples.clone())
        }
        async fn fill_counts(&self, _table: &TableRef, columns: &[String]) -> Result<FillCounts> {
            Ok(FillCounts { row_count: self.rows, non_null: vec![self.rows; columns.len()] })
        }
    }

    fn rule(id: &str, count_query: &str) -> CompiledRule {
        CompiledRule {
            rule_id: id.to_string(),
            column_name: "c".to_string(),
            rule_kind: RuleKind::Enumeration,
            rule_text: "c in set".to_string(),
            table: TableRef::new("ds", "t"),
            count_query: count_query.to_string(),
            sample_query: "sample".to_string(),
            params: Vec::new(),
            structural: false,
        }
    }

    fn settings(timeout_ms: u64, parallel: usize) -> ValidationSettings {
        ValidationSettings {
            rule_timeout: Duration::from_millis(timeout_ms),
            max_parallel_rules: parallel,
            cancel_grace: Duration::from_millis(20),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_timeout_is_reported_not_zero() {
        let dest = Arc::new(ScriptedDestination::new(10));
        let executor = RuleExecutor::new(dest, &settings(20, 2));

        let outcome = executor.execute(&rule("R001", "slow count")).await;
        assert_eq!(outcome.violation_count, None);
        assert_eq!(outcome.severity, None);
        assert!(matches!(outcome.failure, Some(RuleFailure::Timeout { after_ms: 20 })));
    }

    #[tokio::test]
    async fn test_error_does_not_abort_batch() {
        let mut dest = ScriptedDestination::new(100);
        dest.counts.insert("bad values".to_string(), 30);
        dest.samples = vec![Some("x".to_string()), None];
        let executor = RuleExecutor::new(Arc::new(dest), &settings(1000, 2));

        let outcomes = executor
            .execute_batch(
                vec![rule("R001", "broken count"), rule("R002", "bad values"), rule("R003", "clean")],
                CancellationToken::new(),
            )
            .await;

        let ids: Vec<_> = outcomes.iter().map(|o| o.rule_id.as_str()).collect();
        assert_eq!(ids, vec!["R001", "R002", "R003"]);
        assert!(matches!(outcomes[0].failure, Some(RuleFailure::Error { .. })));
        assert_eq!(outcomes[1].violation_count, Some(30));
        assert_eq!(outcomes[1].severity, Some(Severity::High));
        assert_eq!(outcomes[1].sample_violations, vec!["x", "NULL"]);
        assert_eq!(outcomes[2].violation_count, Some(0));
        assert_eq!(outcomes[2].severity, Some(Severity::Low));
        assert!(outcomes[2].sample_violations.is_empty());
    }

    #[tokio::test]
    async fn test_sample_bound_holds() {
        for violations in [0u64, 3, 1000] {
            let mut dest = ScriptedDestination::new(2000);
            dest.counts.insert("q".to_string(), violations);
            dest.samples = (0..violations.min(50)).map(|i| Some(i.to_string())).collect();
            let executor = RuleExecutor::new(Arc::new(dest), &settings(1000, 1));

            let outcome = executor.execute(&rule("R001", "q")).await;
            assert_eq!(outcome.violation_count, Some(violations));
            assert!(outcome.sample_violations.len() <= MAX_SAMPLE_VIOLATIONS);
        }
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let dest = Arc::new(ScriptedDestination::new(10));
        let executor = RuleExecutor::new(Arc::clone(&dest) as Arc<dyn Destination>, &settings(1000, 2));

        let rules: Vec<_> = (0..6).map(|i| rule(&format!("R{:03}", i), "slow")).collect();
        let outcomes = executor.execute_batch(rules, CancellationToken::new()).await;

        assert!(outcomes.iter().all(|o| o.executed()));
        assert!(dest.max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancel_keeps_completed_outcomes() {
        let mut dest = ScriptedDestination::new(10);
        dest.sleep = Duration::from_secs(30);
        let dest = Arc::new(dest);
        let executor = RuleExecutor::new(Arc::clone(&dest) as Arc<dyn Destination>, &settings(60_000, 1));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let outcomes = executor
            .execute_batch(
                vec![rule("R001", "fast"), rule("R002", "slow"), rule("R003", "fast")],
                cancel,
            )
            .await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].executed());
        assert_eq!(outcomes[1].failure, Some(RuleFailure::Cancelled));
        assert_eq!(outcomes[2].failure, Some(RuleFailure::Cancelled));
        // The third rule was never issued
        assert_eq!(dest.started.load(Ordering::SeqCst), 2);
    }
}
