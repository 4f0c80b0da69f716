//! Background driving of runs: retrying batch loops, cron ticks and stale sweeps.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{BatchOutcome, CatalogEngine, EngineError, EngineResult, FinalizeOutcome};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveSummary {
    pub run_id: Uuid,
    pub batches: usize,
    pub retries: usize,
    pub outcome: FinalizeOutcome,
}

/// Processes batches until the catalog is exhausted, then finalizes.
/// Storage failures are retried with backoff; anything else stops the drive.
pub async fn drive_run(engine: &CatalogEngine, run_id: Uuid, backoff: BackoffPolicy) -> EngineResult<DriveSummary> {
    let mut batches = 0;
    let mut retries = 0;
    let mut attempt = 0;

    loop {
        match engine.process_batch(run_id).await {
            Ok(BatchOutcome::Processed { evaluated, failed, .. }) => {
                batches += 1;
                attempt = 0;
                if failed > 0 {
                    warn!(%run_id, batch = batches, evaluated, failed, "batch had evaluation failures");
                }
            }
            Ok(BatchOutcome::Exhausted { .. }) => break,
            Ok(BatchOutcome::Inactive { status }) => {
                return Ok(DriveSummary {
                    run_id,
                    batches,
                    retries,
                    outcome: FinalizeOutcome::AlreadyTransitioned { status },
                });
            }
            Err(EngineError::Store(err)) if attempt < backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempt);
                warn!(%run_id, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "batch failed; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
                retries += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let outcome = engine.finalize_run(run_id).await?;
    info!(%run_id, batches, retries, "run drive finished");
    Ok(DriveSummary {
        run_id,
        batches,
        retries,
        outcome,
    })
}

/// One scheduler pass: a single batch for every running run, finalizing the
/// runs whose catalog scan is exhausted. Returns the number of runs touched.
pub async fn tick(engine: &CatalogEngine) -> EngineResult<usize> {
    let running = engine.stores().runs.list_running(None).await?;
    let mut touched = 0;
    for run in running {
        match engine.process_batch(run.id).await {
            Ok(BatchOutcome::Processed { .. }) => touched += 1,
            Ok(BatchOutcome::Exhausted { .. }) => {
                touched += 1;
                match engine.finalize_run(run.id).await? {
                    FinalizeOutcome::StillProcessing { remaining, .. } => {
                        warn!(run_id = %run.id, remaining, "catalog exhausted before snapshot total; left for sweep")
                    }
                    outcome => info!(run_id = %run.id, ?outcome, "finalized run from tick"),
                }
            }
            Ok(BatchOutcome::Inactive { .. }) => {}
            Err(err) => error!(run_id = %run.id, error = %err, "tick batch failed"),
        }
    }
    Ok(touched)
}

pub async fn maybe_build_scheduler(engine: CatalogEngine) -> Result<Option<JobScheduler>> {
    if !engine.config().scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let tick_cron = engine.config().tick_cron.clone();
    let tick_engine = engine.clone();
    let tick_job = Job::new_async(tick_cron.as_str(), move |_uuid, _l| {
        let engine = tick_engine.clone();
        Box::pin(async move {
            if let Err(err) = tick(&engine).await {
                error!(error = %err, "scheduled tick failed");
            }
        })
    })
    .with_context(|| format!("creating tick job for cron {tick_cron}"))?;
    sched.add(tick_job).await.context("adding tick job")?;

    let sweep_cron = engine.config().sweep_cron.clone();
    let sweep_engine = engine;
    let sweep_job = Job::new_async(sweep_cron.as_str(), move |_uuid, _l| {
        let engine = sweep_engine.clone();
        Box::pin(async move {
            if let Err(err) = engine.sweep().await {
                error!(error = %err, "scheduled sweep failed");
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {sweep_cron}"))?;
    sched.add(sweep_job).await.context("adding sweep job")?;

    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use reelgate_core::{PolicyConfig, RunStatus};
    use reelgate_storage::InMemoryCatalog;

    use crate::testkit::item;
    use crate::{EngineConfig, EngineStores};

    async fn engine_with(items: u128, batch_size: usize) -> CatalogEngine {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.extend((1..=items).map(|n| item(n, "US", "en"))).await;
        let config = EngineConfig {
            batch_size,
            ..EngineConfig::default()
        };
        CatalogEngine::new(EngineStores::in_memory(catalog), config)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn drive_run_processes_everything_and_prepares() {
        let engine = engine_with(23, 5).await;
        let policy = engine.create_policy(PolicyConfig::default()).await.unwrap();
        let run = engine.start_run(policy.id).await.unwrap();

        let summary = drive_run(&engine, run.id, BackoffPolicy::default()).await.unwrap();
        assert_eq!(summary.batches, 5);
        assert_eq!(summary.retries, 0);
        match summary.outcome {
            FinalizeOutcome::Prepared { counters, anomaly } => {
                assert_eq!(counters.processed, 23);
                assert!(anomaly.is_none());
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(engine.get_run(run.id).await.unwrap().status, RunStatus::Prepared);
    }

    #[tokio::test]
    async fn drive_run_on_cancelled_run_reports_transition() {
        let engine = engine_with(3, 5).await;
        let policy = engine.create_policy(PolicyConfig::default()).await.unwrap();
        let run = engine.start_run(policy.id).await.unwrap();
        engine.cancel_run(run.id, "operator").await.unwrap();

        let summary = drive_run(&engine, run.id, BackoffPolicy::default()).await.unwrap();
        assert_eq!(summary.batches, 0);
        assert_eq!(
            summary.outcome,
            FinalizeOutcome::AlreadyTransitioned {
                status: RunStatus::Cancelled
            }
        );
    }

    #[tokio::test]
    async fn tick_advances_running_runs_until_prepared() {
        let engine = engine_with(4, 3).await;
        let policy = engine.create_policy(PolicyConfig::default()).await.unwrap();
        let run = engine.start_run(policy.id).await.unwrap();

        assert_eq!(tick(&engine).await.unwrap(), 1);
        assert_eq!(engine.get_run(run.id).await.unwrap().status, RunStatus::Running);
        assert_eq!(tick(&engine).await.unwrap(), 1);
        assert_eq!(tick(&engine).await.unwrap(), 1);
        assert_eq!(engine.get_run(run.id).await.unwrap().status, RunStatus::Prepared);
        assert_eq!(tick(&engine).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scheduler_is_off_by_default() {
        let engine = engine_with(0, 5).await;
        assert!(maybe_build_scheduler(engine).await.unwrap().is_none());
    }
}
