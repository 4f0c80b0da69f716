//! Authoritative run counters, always re-derived from evaluation rows.

use std::sync::Arc;

use reelgate_core::RunCounters;
use reelgate_storage::{EvaluationScope, EvaluationStore, RunStore};
use tracing::debug;
use uuid::Uuid;

use crate::{EngineError, EngineResult};

#[derive(Clone)]
pub struct RunAggregator {
    evaluations: Arc<dyn EvaluationStore>,
    runs: Arc<dyn RunStore>,
}

impl RunAggregator {
    pub fn new(evaluations: Arc<dyn EvaluationStore>, runs: Arc<dyn RunStore>) -> Self {
        Self { evaluations, runs }
    }

    /// Groups the run's evaluation rows by status; `errors` is the error sample length.
    pub async fn aggregate_counters(&self, run_id: Uuid) -> EngineResult<RunCounters> {
        let run = self
            .runs
            .get(run_id)
            .await?
            .ok_or_else(|| EngineError::not_found("run", run_id))?;
        let counts = self.evaluations.count_by_status(EvaluationScope::Run(run_id)).await?;
        Ok(RunCounters::from_status_counts(&counts, run.error_sample.len()))
    }

    /// Status breakdown across every row of a policy version, regardless of run.
    pub async fn aggregate_for_version(&self, policy_version: i32) -> EngineResult<RunCounters> {
        let counts = self
            .evaluations
            .count_by_status(EvaluationScope::PolicyVersion(policy_version))
            .await?;
        Ok(RunCounters::from_status_counts(&counts, 0))
    }

    /// The only writer of the cached counter columns on the run row.
    pub async fn sync_run_counters(&self, run_id: Uuid) -> EngineResult<RunCounters> {
        let counters = self.aggregate_counters(run_id).await?;
        self.runs.write_counters(run_id, &counters).await?;
        debug!(%run_id, processed = counters.processed, errors = counters.errors, "synced run counters");
        Ok(counters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use reelgate_core::{
        CatalogEvaluationRun, CatalogPolicy, ErrorSampleEntry, EvaluationStatus, MediaCatalogEvaluation,
        PolicyConfig,
    };
    use reelgate_storage::{InMemoryEvaluationStore, InMemoryRunStore};

    fn policy(version: i32) -> CatalogPolicy {
        CatalogPolicy {
            id: Uuid::new_v4(),
            version,
            is_active: false,
            config: PolicyConfig::default(),
            created_at: Utc::now(),
            activated_at: None,
        }
    }

    fn row(n: u128, status: EvaluationStatus, run_id: Uuid) -> MediaCatalogEvaluation {
        MediaCatalogEvaluation {
            media_item_id: Uuid::from_u128(n),
            policy_version: 2,
            status,
            reasons: Vec::new(),
            relevance_score: 0.0,
            breakout_rule_id: None,
            evaluated_at: Some(Utc::now()),
            run_id: Some(run_id),
        }
    }

    #[tokio::test]
    async fn counters_match_a_fresh_group_by_not_the_cache() {
        let evaluations = Arc::new(InMemoryEvaluationStore::new());
        let runs = Arc::new(InMemoryRunStore::new());
        let aggregator = RunAggregator::new(evaluations.clone(), runs.clone());

        let mut run = CatalogEvaluationRun::start(&policy(2), 10, Utc::now());
        run.counters.processed = 999;
        runs.create(&run).await.unwrap();

        let statuses = [
            EvaluationStatus::Eligible,
            EvaluationStatus::Eligible,
            EvaluationStatus::Ineligible,
            EvaluationStatus::Review,
            EvaluationStatus::Pending,
        ];
        for (n, status) in statuses.into_iter().enumerate() {
            evaluations.upsert(&row(n as u128, status, run.id)).await.unwrap();
        }
        // Same key written again by a retry.
        evaluations.upsert(&row(0, EvaluationStatus::Eligible, run.id)).await.unwrap();
        // A different run's row must not leak in.
        evaluations.upsert(&row(50, EvaluationStatus::Eligible, Uuid::new_v4())).await.unwrap();
        runs.append_error(
            run.id,
            ErrorSampleEntry {
                media_item_id: None,
                message: "bad signals".into(),
                stack: None,
                recorded_at: Utc::now(),
            },
            10,
        )
        .await
        .unwrap();

        let counters = aggregator.sync_run_counters(run.id).await.unwrap();
        let grouped = evaluations.count_by_status(EvaluationScope::Run(run.id)).await.unwrap();
        assert_eq!(counters, RunCounters::from_status_counts(&grouped, 1));
        assert_eq!(counters.processed, 5);
        assert_eq!(counters.eligible, 2);
        assert_eq!(counters.errors, 1);
        assert_eq!(runs.get(run.id).await.unwrap().unwrap().counters, counters);

        let by_version = aggregator.aggregate_for_version(2).await.unwrap();
        assert_eq!(by_version.processed, 6);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let aggregator = RunAggregator::new(
            Arc::new(InMemoryEvaluationStore::new()),
            Arc::new(InMemoryRunStore::new()),
        );
        let err = aggregator.aggregate_counters(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "run", .. }));
    }
}
