//! Run lifecycle: `running -> prepared -> promoted`, with `failed` and
//! `cancelled` reachable from any active state.

use chrono::{Duration as ChronoDuration, Utc};
use reelgate_core::{
    CatalogEvaluationRun, ErrorSampleEntry, EvaluationStatus, MediaCatalogEvaluation, MediaSignals,
    ReasonCode, RunCounters, RunStatus,
};
use reelgate_eval::PreparedPolicy;
use reelgate_storage::{CatalogQuery, RunTransition, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{EngineError, EngineResult, EngineStores, RunAggregator};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BatchOutcome {
    Processed {
        evaluated: usize,
        skipped: usize,
        failed: usize,
        cursor: Option<Uuid>,
        cursor_moved: bool,
        counters: RunCounters,
    },
    /// No evaluable items remain after the cursor.
    Exhausted { counters: RunCounters },
    /// The run is no longer `running`.
    Inactive { status: RunStatus },
}

/// Processed count exceeded the snapshot total. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunAnomaly {
    pub run_id: Uuid,
    pub processed: i64,
    pub total_ready_snapshot: i64,
}

impl RunAnomaly {
    pub fn message(&self) -> String {
        format!(
            "processed {} items but the ready snapshot was {}; \
             possible run-id leak, snapshot mismatch or duplicate evaluation",
            self.processed, self.total_ready_snapshot
        )
    }

    fn to_entry(&self) -> ErrorSampleEntry {
        ErrorSampleEntry {
            media_item_id: None,
            message: self.message(),
            stack: None,
            recorded_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FinalizeOutcome {
    StillProcessing { counters: RunCounters, remaining: i64 },
    Prepared {
        counters: RunCounters,
        anomaly: Option<RunAnomaly>,
    },
    /// Benign: someone else already moved the run out of `running`.
    AlreadyTransitioned { status: RunStatus },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub prepared: Vec<Uuid>,
    pub failed: Vec<Uuid>,
    pub still_running: Vec<Uuid>,
    pub already_transitioned: Vec<Uuid>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.prepared.is_empty()
            && self.failed.is_empty()
            && self.still_running.is_empty()
            && self.already_transitioned.is_empty()
    }
}

#[derive(Clone)]
pub struct RunOrchestrator {
    stores: EngineStores,
    aggregator: RunAggregator,
    batch_size: usize,
    error_sample_limit: usize,
}

impl RunOrchestrator {
    pub fn new(stores: EngineStores, aggregator: RunAggregator) -> Self {
        Self {
            stores,
            aggregator,
            batch_size: 500,
            error_sample_limit: 50,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_error_sample_limit(mut self, limit: usize) -> Self {
        self.error_sample_limit = limit;
        self
    }

    pub async fn get(&self, run_id: Uuid) -> EngineResult<CatalogEvaluationRun> {
        self.stores
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    async fn running_for(&self, policy_version: i32) -> EngineResult<Option<Uuid>> {
        Ok(self
            .stores
            .runs
            .list_running(None)
            .await?
            .into_iter()
            .find(|run| run.target_policy_version == policy_version)
            .map(|run| run.id))
    }

    /// Snapshots the evaluable catalog size and opens a `running` run.
    pub async fn start(&self, policy_id: Uuid) -> EngineResult<CatalogEvaluationRun> {
        let policy = self
            .stores
            .policies
            .find_by_id(policy_id)
            .await?
            .ok_or_else(|| EngineError::not_found("policy", policy_id))?;

        if let Some(existing) = self.running_for(policy.version).await? {
            return Err(EngineError::RunAlreadyActive {
                run_id: existing,
                policy_version: policy.version,
            });
        }

        let cutoff = Utc::now();
        let total = self.stores.catalog.count_evaluable(cutoff).await?;
        let run = CatalogEvaluationRun::start(&policy, total, cutoff);
        match self.stores.runs.create(&run).await {
            Ok(()) => {}
            // Lost the race to a concurrent start for the same version.
            Err(StoreError::RunningRunExists { policy_version }) => {
                let run_id = self.running_for(policy_version).await?.unwrap_or_else(Uuid::nil);
                return Err(EngineError::RunAlreadyActive { run_id, policy_version });
            }
            Err(err) => return Err(err.into()),
        }
        info!(
            run_id = %run.id,
            policy_version = policy.version,
            total_ready_snapshot = total,
            "started catalog evaluation run"
        );
        Ok(run)
    }

    /// Evaluates the next page after the run's cursor.
    ///
    /// Items this run already wrote are skipped, so a retried batch does not
    /// re-evaluate work that landed before a crash.
    pub async fn process_batch(&self, run_id: Uuid) -> EngineResult<BatchOutcome> {
        let run = self.get(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(BatchOutcome::Inactive { status: run.status });
        }
        let span = info_span!("run_batch", %run_id, policy_version = run.target_policy_version);
        self.process_batch_inner(run).instrument(span).await
    }

    async fn process_batch_inner(&self, run: CatalogEvaluationRun) -> EngineResult<BatchOutcome> {
        let policy = self
            .stores
            .policies
            .find_by_id(run.target_policy_id)
            .await?
            .ok_or_else(|| EngineError::not_found("policy", run.target_policy_id))?;
        let prepared = PreparedPolicy::new(&policy.config);

        let query = CatalogQuery::evaluable(run.cursor, self.batch_size, Some(run.snapshot_cutoff));
        let page = self.stores.catalog.fetch_page(&query).await?;
        if page.is_empty() {
            let counters = self.aggregator.sync_run_counters(run.id).await?;
            return Ok(BatchOutcome::Exhausted { counters });
        }

        let ids: Vec<Uuid> = page.iter().map(|item| item.media_item_id).collect();
        let done = self.stores.evaluations.evaluated_by_run(run.id, &ids).await?;

        let now = Utc::now();
        let mut records = Vec::with_capacity(page.len());
        let mut failures = Vec::new();
        for item in page.iter().filter(|item| !done.contains(&item.media_item_id)) {
            match prepared.evaluate(item) {
                Ok(result) => records.push(result.into_record(
                    item.media_item_id,
                    run.target_policy_version,
                    prepared.relevance(item),
                    Some(run.id),
                    now,
                )),
                Err(err) => {
                    warn!(media_item_id = %item.media_item_id, error = %err, "item evaluation failed");
                    records.push(error_record(item, run.target_policy_version, run.id, now));
                    failures.push(ErrorSampleEntry {
                        media_item_id: Some(item.media_item_id),
                        message: err.to_string(),
                        stack: Some(format!("{err:?}")),
                        recorded_at: now,
                    });
                }
            }
        }

        self.stores.evaluations.upsert_many(&records).await?;
        for entry in failures.iter().cloned() {
            self.stores
                .runs
                .append_error(run.id, entry, self.error_sample_limit)
                .await?;
        }

        let next = ids.last().copied();
        let cursor_moved = self.stores.runs.advance_cursor(run.id, run.cursor, next).await?;
        if !cursor_moved {
            warn!("cursor moved concurrently; batch writes were idempotent upserts");
        }
        let counters = self.aggregator.sync_run_counters(run.id).await?;

        Ok(BatchOutcome::Processed {
            evaluated: records.len(),
            skipped: done.len(),
            failed: failures.len(),
            cursor: next,
            cursor_moved,
            counters,
        })
    }

    /// Moves a complete run to `prepared` with a guarded update.
    pub async fn finalize(&self, run_id: Uuid) -> EngineResult<FinalizeOutcome> {
        let run = self.get(run_id).await?;
        if run.status != RunStatus::Running {
            return Ok(FinalizeOutcome::AlreadyTransitioned { status: run.status });
        }

        let mut counters = self.aggregator.aggregate_counters(run_id).await?;
        if counters.processed < run.total_ready_snapshot {
            self.stores.runs.write_counters(run_id, &counters).await?;
            return Ok(FinalizeOutcome::StillProcessing {
                counters,
                remaining: run.total_ready_snapshot - counters.processed,
            });
        }

        let anomaly = if counters.processed > run.total_ready_snapshot {
            let anomaly = RunAnomaly {
                run_id,
                processed: counters.processed,
                total_ready_snapshot: run.total_ready_snapshot,
            };
            warn!(%run_id, processed = anomaly.processed, total = anomaly.total_ready_snapshot, "{}", anomaly.message());
            self.stores
                .runs
                .append_error(run_id, anomaly.to_entry(), self.error_sample_limit)
                .await?;
            counters = self.aggregator.aggregate_counters(run_id).await?;
            Some(anomaly)
        } else {
            None
        };

        let transition = RunTransition::to(RunStatus::Prepared, Utc::now()).with_counters(counters);
        let moved = self
            .stores
            .runs
            .transition(run_id, &[RunStatus::Running], transition)
            .await?;
        if !moved {
            let current = self.get(run_id).await?;
            info!(%run_id, status = %current.status, "run already finalized elsewhere");
            return Ok(FinalizeOutcome::AlreadyTransitioned { status: current.status });
        }

        info!(%run_id, processed = counters.processed, eligible = counters.eligible, "run prepared");
        Ok(FinalizeOutcome::Prepared { counters, anomaly })
    }

    /// Finalizes runs started more than `max_age_minutes` ago. Runs that
    /// cannot reach their snapshot total because the catalog is exhausted
    /// are marked `failed`.
    pub async fn finalize_stale_runs(&self, max_age_minutes: i64) -> EngineResult<SweepReport> {
        let cutoff = Utc::now() - ChronoDuration::minutes(max_age_minutes);
        let stale = self.stores.runs.list_running(Some(cutoff)).await?;
        let mut report = SweepReport::default();

        for run in stale {
            match self.finalize(run.id).await? {
                FinalizeOutcome::Prepared { .. } => report.prepared.push(run.id),
                FinalizeOutcome::AlreadyTransitioned { .. } => report.already_transitioned.push(run.id),
                FinalizeOutcome::StillProcessing { counters, .. } => {
                    let current = self.get(run.id).await?;
                    let probe = CatalogQuery::evaluable(current.cursor, 1, Some(current.snapshot_cutoff));
                    if self.stores.catalog.fetch_page(&probe).await?.is_empty() {
                        let reason = format!(
                            "stale run exhausted the catalog at {} of {} items",
                            counters.processed, current.total_ready_snapshot
                        );
                        warn!(run_id = %run.id, "{reason}");
                        match self.fail(run.id, &reason).await {
                            Ok(_) => report.failed.push(run.id),
                            Err(EngineError::InvalidTransition { .. }) => {
                                report.already_transitioned.push(run.id)
                            }
                            Err(err) => return Err(err),
                        }
                    } else {
                        warn!(run_id = %run.id, processed = counters.processed, "stale run still has work");
                        report.still_running.push(run.id);
                    }
                }
            }
        }
        Ok(report)
    }

    /// Activates the run's policy, then moves the run `prepared -> promoted`.
    pub async fn promote(&self, run_id: Uuid, promoted_by: &str) -> EngineResult<CatalogEvaluationRun> {
        let run = self.get(run_id).await?;
        if run.status != RunStatus::Prepared {
            return Err(EngineError::InvalidTransition {
                run_id,
                status: run.status,
                action: "promote",
            });
        }

        self.stores.policies.activate(run.target_policy_id).await?;
        let transition = RunTransition::to(RunStatus::Promoted, Utc::now()).promoted_by(promoted_by);
        let moved = self
            .stores
            .runs
            .transition(run_id, &[RunStatus::Prepared], transition)
            .await?;
        let current = self.get(run_id).await?;
        if !moved && current.status != RunStatus::Promoted {
            return Err(EngineError::InvalidTransition {
                run_id,
                status: current.status,
                action: "promote",
            });
        }
        info!(%run_id, policy_version = run.target_policy_version, promoted_by, "run promoted");
        Ok(current)
    }

    pub async fn cancel(&self, run_id: Uuid, reason: &str) -> EngineResult<CatalogEvaluationRun> {
        self.close(run_id, RunStatus::Cancelled, "cancel", reason).await
    }

    pub async fn fail(&self, run_id: Uuid, reason: &str) -> EngineResult<CatalogEvaluationRun> {
        self.close(run_id, RunStatus::Failed, "fail", reason).await
    }

    async fn close(
        &self,
        run_id: Uuid,
        to: RunStatus,
        action: &'static str,
        reason: &str,
    ) -> EngineResult<CatalogEvaluationRun> {
        let run = self.get(run_id).await?;
        if !run.status.is_active() {
            return Err(EngineError::InvalidTransition {
                run_id,
                status: run.status,
                action,
            });
        }
        if !reason.trim().is_empty() {
            let entry = ErrorSampleEntry {
                media_item_id: None,
                message: format!("{action}: {reason}"),
                stack: None,
                recorded_at: Utc::now(),
            };
            self.stores
                .runs
                .append_error(run_id, entry, self.error_sample_limit)
                .await?;
        }
        let counters = self.aggregator.aggregate_counters(run_id).await?;
        let transition = RunTransition::to(to, Utc::now()).with_counters(counters);
        let moved = self
            .stores
            .runs
            .transition(run_id, &[RunStatus::Running, RunStatus::Prepared], transition)
            .await?;
        let current = self.get(run_id).await?;
        if !moved {
            return Err(EngineError::InvalidTransition {
                run_id,
                status: current.status,
                action,
            });
        }
        info!(%run_id, status = %to, reason, "run closed");
        Ok(current)
    }
}

fn error_record(
    item: &MediaSignals,
    policy_version: i32,
    run_id: Uuid,
    evaluated_at: chrono::DateTime<Utc>,
) -> MediaCatalogEvaluation {
    MediaCatalogEvaluation {
        media_item_id: item.media_item_id,
        policy_version,
        status: EvaluationStatus::Pending,
        reasons: vec![ReasonCode::EvaluationError],
        relevance_score: 0.0,
        breakout_rule_id: None,
        evaluated_at: Some(evaluated_at),
        run_id: Some(run_id),
    }
}
