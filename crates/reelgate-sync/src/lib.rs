//! Run orchestration, counter aggregation and dry-run previews over the
//! catalog policy stores.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use reelgate_core::{CatalogEvaluationRun, CatalogPolicy, PolicyConfig, RunCounters, RunStatus};
use reelgate_eval::{validate_policy_config, PolicyConfigError};
use reelgate_storage::{
    EvaluationStore, InMemoryCatalog, InMemoryEvaluationStore, InMemoryPolicyStore, InMemoryRunStore,
    MediaCatalog, PgEvaluationStore, PgMediaCatalog, PgPolicyStore, PgRunStore, PolicyStore, RunStore,
    StoreError,
};
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub mod aggregate;
pub mod orchestrator;
pub mod preview;
pub mod report;
pub mod review;
pub mod scheduler;

pub use aggregate::RunAggregator;
pub use orchestrator::{BatchOutcome, FinalizeOutcome, RunAnomaly, RunOrchestrator, SweepReport};
pub use preview::{
    DryRunPreview, DryRunRequest, ItemChange, PreviewItem, PreviewMode, PreviewReport, PreviewSummary,
    PREVIEW_ITEM_CAP,
};
pub use report::{export_run_snapshot, policy_fingerprint, write_preview_report, SnapshotManifest};
pub use review::{ItemPage, ItemReviewQuery, ReviewedItem};
pub use scheduler::{drive_run, maybe_build_scheduler, tick, BackoffPolicy, DriveSummary};

pub const CRATE_NAME: &str = "reelgate-sync";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub batch_size: usize,
    pub error_sample_limit: usize,
    pub stale_run_minutes: i64,
    pub scheduler_enabled: bool,
    pub tick_cron: String,
    pub sweep_cron: String,
    pub reports_dir: PathBuf,
    pub preview_max_items: usize,
    pub preview_budget: Duration,
    pub web_port: u16,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            db_max_connections: 10,
            batch_size: 500,
            error_sample_limit: 50,
            stale_run_minutes: 60,
            scheduler_enabled: false,
            tick_cron: "* * * * *".to_string(),
            sweep_cron: "*/15 * * * *".to_string(),
            reports_dir: PathBuf::from("./reports"),
            preview_max_items: PREVIEW_ITEM_CAP,
            preview_budget: Duration::from_secs(60),
            web_port: 8000,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            db_max_connections: parse_var::<u32>(&lookup, "REELGATE_DB_MAX_CONNECTIONS")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.db_max_connections),
            batch_size: parse_var::<usize>(&lookup, "REELGATE_BATCH_SIZE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.batch_size),
            error_sample_limit: parse_var::<usize>(&lookup, "REELGATE_ERROR_SAMPLE_LIMIT").unwrap_or(defaults.error_sample_limit),
            stale_run_minutes: parse_var::<i64>(&lookup, "REELGATE_STALE_RUN_MINUTES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.stale_run_minutes),
            scheduler_enabled: lookup("REELGATE_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            tick_cron: lookup("REELGATE_TICK_CRON").unwrap_or(defaults.tick_cron),
            sweep_cron: lookup("REELGATE_SWEEP_CRON").unwrap_or(defaults.sweep_cron),
            reports_dir: lookup("REELGATE_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.reports_dir),
            preview_max_items: parse_var::<usize>(&lookup, "REELGATE_PREVIEW_MAX_ITEMS")
                .filter(|n| *n > 0)
                .map(|n| n.min(PREVIEW_ITEM_CAP))
                .unwrap_or(defaults.preview_max_items),
            preview_budget: parse_var::<u64>(&lookup, "REELGATE_PREVIEW_BUDGET_SECS")
                .filter(|n| *n > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.preview_budget),
            web_port: parse_var::<u16>(&lookup, "REELGATE_WEB_PORT").unwrap_or(defaults.web_port),
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("run {run_id} is {status}; cannot {action}")]
    InvalidTransition {
        run_id: Uuid,
        status: RunStatus,
        action: &'static str,
    },
    #[error("run {run_id} is already running for policy version {policy_version}")]
    RunAlreadyActive { run_id: Uuid, policy_version: i32 },
    #[error(transparent)]
    Store(StoreError),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            other => Self::Store(other),
        }
    }
}

impl From<PolicyConfigError> for EngineError {
    fn from(err: PolicyConfigError) -> Self {
        Self::Validation(err.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

/// The four store ports the engine runs against.
#[derive(Clone)]
pub struct EngineStores {
    pub policies: Arc<dyn PolicyStore>,
    pub evaluations: Arc<dyn EvaluationStore>,
    pub runs: Arc<dyn RunStore>,
    pub catalog: Arc<dyn MediaCatalog>,
}

impl EngineStores {
    pub fn in_memory(catalog: Arc<InMemoryCatalog>) -> Self {
        Self {
            policies: Arc::new(InMemoryPolicyStore::new()),
            evaluations: Arc::new(InMemoryEvaluationStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            catalog,
        }
    }

    pub fn postgres(pool: PgPool) -> Self {
        Self {
            policies: Arc::new(PgPolicyStore::new(pool.clone())),
            evaluations: Arc::new(PgEvaluationStore::new(pool.clone())),
            runs: Arc::new(PgRunStore::new(pool.clone())),
            catalog: Arc::new(PgMediaCatalog::new(pool)),
        }
    }
}

/// Entry point used by the CLI, the web layer and the scheduler.
#[derive(Clone)]
pub struct CatalogEngine {
    config: Arc<EngineConfig>,
    stores: EngineStores,
    orchestrator: RunOrchestrator,
    aggregator: RunAggregator,
    preview: DryRunPreview,
}

impl CatalogEngine {
    pub fn new(stores: EngineStores, config: EngineConfig) -> Self {
        let aggregator = RunAggregator::new(stores.evaluations.clone(), stores.runs.clone());
        let orchestrator = RunOrchestrator::new(stores.clone(), aggregator.clone())
            .with_batch_size(config.batch_size)
            .with_error_sample_limit(config.error_sample_limit);
        let preview = DryRunPreview::new(stores.clone())
            .with_max_items(config.preview_max_items)
            .with_budget(config.preview_budget);
        Self {
            config: Arc::new(config),
            stores,
            orchestrator,
            aggregator,
            preview,
        }
    }

    /// Connects, migrates and wires the Postgres stores.
    pub async fn connect(config: EngineConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let url = config
            .database_url
            .clone()
            .context("DATABASE_URL is not set")?;
        let pool = reelgate_storage::connect_pool(&url, config.db_max_connections).await?;
        reelgate_storage::MIGRATOR
            .run(&pool)
            .await
            .context("running catalog policy migrations")?;
        Ok(Self::new(EngineStores::postgres(pool), config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stores(&self) -> &EngineStores {
        &self.stores
    }

    pub fn orchestrator(&self) -> &RunOrchestrator {
        &self.orchestrator
    }

    pub fn aggregator(&self) -> &RunAggregator {
        &self.aggregator
    }

    pub async fn create_policy(&self, config: PolicyConfig) -> EngineResult<CatalogPolicy> {
        validate_policy_config(&config)?;
        Ok(self.stores.policies.create(config).await?)
    }

    pub async fn activate_policy(&self, id: Uuid) -> EngineResult<CatalogPolicy> {
        Ok(self.stores.policies.activate(id).await?)
    }

    pub async fn active_policy(&self) -> EngineResult<Option<CatalogPolicy>> {
        Ok(self.stores.policies.get_active().await?)
    }

    pub async fn get_policy(&self, id: Uuid) -> EngineResult<CatalogPolicy> {
        self.stores
            .policies
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("policy", id))
    }

    pub async fn policy_by_version(&self, version: i32) -> EngineResult<CatalogPolicy> {
        self.stores
            .policies
            .find_by_version(version)
            .await?
            .ok_or_else(|| EngineError::not_found("policy version", version))
    }

    pub async fn list_policies(&self) -> EngineResult<Vec<CatalogPolicy>> {
        Ok(self.stores.policies.list_all().await?)
    }

    pub async fn start_run(&self, policy_id: Uuid) -> EngineResult<CatalogEvaluationRun> {
        self.orchestrator.start(policy_id).await
    }

    pub async fn get_run(&self, run_id: Uuid) -> EngineResult<CatalogEvaluationRun> {
        self.orchestrator.get(run_id).await
    }

    pub async fn list_runs(&self, limit: usize) -> EngineResult<Vec<CatalogEvaluationRun>> {
        Ok(self.stores.runs.list_recent(limit).await?)
    }

    pub async fn process_batch(&self, run_id: Uuid) -> EngineResult<BatchOutcome> {
        self.orchestrator.process_batch(run_id).await
    }

    pub async fn finalize_run(&self, run_id: Uuid) -> EngineResult<FinalizeOutcome> {
        self.orchestrator.finalize(run_id).await
    }

    pub async fn promote_run(&self, run_id: Uuid, promoted_by: &str) -> EngineResult<CatalogEvaluationRun> {
        self.orchestrator.promote(run_id, promoted_by).await
    }

    pub async fn cancel_run(&self, run_id: Uuid, reason: &str) -> EngineResult<CatalogEvaluationRun> {
        self.orchestrator.cancel(run_id, reason).await
    }

    pub async fn fail_run(&self, run_id: Uuid, reason: &str) -> EngineResult<CatalogEvaluationRun> {
        self.orchestrator.fail(run_id, reason).await
    }

    pub async fn aggregate_run(&self, run_id: Uuid) -> EngineResult<RunCounters> {
        self.aggregator.aggregate_counters(run_id).await
    }

    /// Finalizes or fails runs older than the configured staleness threshold.
    pub async fn sweep(&self) -> EngineResult<SweepReport> {
        let report = self
            .orchestrator
            .finalize_stale_runs(self.config.stale_run_minutes)
            .await?;
        if !report.is_empty() {
            info!(
                prepared = report.prepared.len(),
                failed = report.failed.len(),
                still_running = report.still_running.len(),
                "stale run sweep finished"
            );
        }
        Ok(report)
    }

    pub async fn dry_run(&self, request: DryRunRequest) -> EngineResult<PreviewReport> {
        self.preview.preview(request).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn config_defaults_apply_when_env_is_empty() {
        let config = EngineConfig::from_lookup(|_| None);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.error_sample_limit, 50);
        assert_eq!(config.preview_max_items, 10_000);
        assert_eq!(config.preview_budget, Duration::from_secs(60));
        assert!(!config.scheduler_enabled);
        assert!(config.database_url.is_none());
    }

    #[test]
    fn config_reads_overrides_and_caps_preview() {
        let env = HashMap::from([
            ("DATABASE_URL", "postgres://localhost/reelgate"),
            ("REELGATE_BATCH_SIZE", "25"),
            ("REELGATE_PREVIEW_MAX_ITEMS", "50000"),
            ("REELGATE_SCHEDULER_ENABLED", "true"),
            ("REELGATE_WEB_PORT", "not-a-port"),
        ]);
        let config = EngineConfig::from_lookup(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/reelgate"));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.preview_max_items, PREVIEW_ITEM_CAP);
        assert!(config.scheduler_enabled);
        assert_eq!(config.web_port, 8000);
    }

    #[tokio::test]
    async fn create_policy_rejects_invalid_config() {
        let engine = CatalogEngine::new(
            EngineStores::in_memory(Arc::new(InMemoryCatalog::new())),
            EngineConfig::default(),
        );
        let config = PolicyConfig {
            allowed_countries: vec!["US".into()],
            blocked_countries: vec!["us".into()],
            ..PolicyConfig::default()
        };
        let err = engine.create_policy(config).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(engine.list_policies().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_not_found_surfaces_as_engine_not_found() {
        let engine = CatalogEngine::new(
            EngineStores::in_memory(Arc::new(InMemoryCatalog::new())),
            EngineConfig::default(),
        );
        let err = engine.activate_policy(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound { entity: "policy", .. }));
    }
}
