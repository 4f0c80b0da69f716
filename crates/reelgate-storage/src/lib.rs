//! Durable stores for policies, evaluations and runs, plus the read-only
//! catalog port the engine pulls media signals from.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelgate_core::{
    CatalogEvaluationRun, CatalogPolicy, ErrorSampleEntry, EvaluationStatus, MediaCatalogEvaluation,
    MediaSignals, MediaType, PolicyConfig, ReadMode, ReasonCode, RunCounters, RunStatus,
};
use thiserror::Error;
use uuid::Uuid;

pub mod memory;
pub mod postgres;

pub use memory::{InMemoryCatalog, InMemoryEvaluationStore, InMemoryPolicyStore, InMemoryRunStore};
pub use postgres::{
    connect_pool, PgEvaluationStore, PgMediaCatalog, PgPolicyStore, PgRunStore,
};

pub const CRATE_NAME: &str = "reelgate-storage";

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{operation} failed for {target}: {source}")]
    Persistence {
        operation: &'static str,
        target: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
    /// Another `running` run already targets this policy version.
    #[error("a run is already running for policy version {policy_version}")]
    RunningRunExists { policy_version: i32 },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn persistence(operation: &'static str, target: impl ToString, source: sqlx::Error) -> Self {
        Self::Persistence {
            operation,
            target: target.to_string(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

pub type StatusCounts = BTreeMap<EvaluationStatus, i64>;

#[async_trait]
pub trait PolicyStore: Send + Sync {
    /// `None` only before the first policy has been seeded and activated.
    async fn get_active(&self) -> StoreResult<Option<CatalogPolicy>>;

    /// Stores a new inactive policy at `max(version) + 1`.
    async fn create(&self, config: PolicyConfig) -> StoreResult<CatalogPolicy>;

    /// Deactivates every policy and activates `id` in one atomic step.
    async fn activate(&self, id: Uuid) -> StoreResult<CatalogPolicy>;

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogPolicy>>;

    async fn find_by_version(&self, version: i32) -> StoreResult<Option<CatalogPolicy>>;

    /// Newest version first.
    async fn list_all(&self) -> StoreResult<Vec<CatalogPolicy>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationScope {
    Run(Uuid),
    PolicyVersion(i32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationQuery {
    pub policy_version: i32,
    pub read_mode: Option<ReadMode>,
    pub homepage_min_score: f64,
    pub status: Option<EvaluationStatus>,
    pub reason: Option<ReasonCode>,
    pub run_id: Option<Uuid>,
    pub after: Option<Uuid>,
    pub limit: usize,
}

impl EvaluationQuery {
    pub fn for_version(policy_version: i32, limit: usize) -> Self {
        Self {
            policy_version,
            read_mode: None,
            homepage_min_score: 0.0,
            status: None,
            reason: None,
            run_id: None,
            after: None,
            limit,
        }
    }

    pub fn matches(&self, evaluation: &MediaCatalogEvaluation) -> bool {
        evaluation.policy_version == self.policy_version
            && self
                .read_mode
                .map_or(true, |mode| mode.admits(evaluation, self.homepage_min_score))
            && self.status.map_or(true, |status| evaluation.status == status)
            && self.reason.map_or(true, |reason| evaluation.reasons.contains(&reason))
            && self.run_id.map_or(true, |run_id| evaluation.run_id == Some(run_id))
            && self.after.map_or(true, |after| evaluation.media_item_id > after)
    }
}

#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Full overwrite keyed by `(media_item_id, policy_version)`.
    async fn upsert(&self, evaluation: &MediaCatalogEvaluation) -> StoreResult<()>;

    async fn upsert_many(&self, evaluations: &[MediaCatalogEvaluation]) -> StoreResult<()> {
        for evaluation in evaluations {
            self.upsert(evaluation).await?;
        }
        Ok(())
    }

    async fn get(&self, media_item_id: Uuid, policy_version: i32) -> StoreResult<Option<MediaCatalogEvaluation>>;

    async fn get_many(
        &self,
        media_item_ids: &[Uuid],
        policy_version: i32,
    ) -> StoreResult<HashMap<Uuid, MediaCatalogEvaluation>>;

    /// Subset of `media_item_ids` already written by `run_id`.
    async fn evaluated_by_run(&self, run_id: Uuid, media_item_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>>;

    /// `GROUP BY status COUNT(*)` over the scope.
    async fn count_by_status(&self, scope: EvaluationScope) -> StoreResult<StatusCounts>;

    /// Ordered by `media_item_id`.
    async fn list(&self, query: &EvaluationQuery) -> StoreResult<Vec<MediaCatalogEvaluation>>;
}

/// Field changes applied together with a guarded status transition.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTransition {
    pub to: RunStatus,
    pub at: DateTime<Utc>,
    pub counters: Option<RunCounters>,
    pub promoted_by: Option<String>,
}

impl RunTransition {
    pub fn to(to: RunStatus, at: DateTime<Utc>) -> Self {
        Self {
            to,
            at,
            counters: None,
            promoted_by: None,
        }
    }

    pub fn with_counters(mut self, counters: RunCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn promoted_by(mut self, who: impl Into<String>) -> Self {
        self.promoted_by = Some(who.into());
        self
    }

    pub(crate) fn apply(&self, run: &mut CatalogEvaluationRun) {
        run.status = self.to;
        match self.to {
            RunStatus::Promoted => {
                run.promoted_at = Some(self.at);
                run.promoted_by = self.promoted_by.clone();
            }
            RunStatus::Running => {}
            _ => run.finished_at = Some(self.at),
        }
        if let Some(counters) = self.counters {
            run.counters = counters;
        }
    }
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, run: &CatalogEvaluationRun) -> StoreResult<()>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<CatalogEvaluationRun>>;

    /// Most recently started first.
    async fn list_recent(&self, limit: usize) -> StoreResult<Vec<CatalogEvaluationRun>>;

    /// Running runs, optionally only those started before `started_before`.
    async fn list_running(&self, started_before: Option<DateTime<Utc>>) -> StoreResult<Vec<CatalogEvaluationRun>>;

    /// Compare-and-set on the batch cursor. Returns whether the row moved.
    async fn advance_cursor(&self, id: Uuid, expected: Option<Uuid>, next: Option<Uuid>) -> StoreResult<bool>;

    /// Overwrites the cached counters. Only the aggregator calls this.
    async fn write_counters(&self, id: Uuid, counters: &RunCounters) -> StoreResult<()>;

    /// Appends to the error sample, keeping at most `limit` entries.
    async fn append_error(&self, id: Uuid, entry: ErrorSampleEntry, limit: usize) -> StoreResult<()>;

    /// Guarded update: applies `transition` only when the current status is in `from`.
    async fn transition(&self, id: Uuid, from: &[RunStatus], transition: RunTransition) -> StoreResult<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CatalogOrder {
    #[default]
    IdAsc,
    PopularityDesc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogQuery {
    pub after: Option<Uuid>,
    pub limit: usize,
    pub cutoff: Option<DateTime<Utc>>,
    pub media_type: Option<MediaType>,
    pub origin_country: Option<String>,
    pub include_unready: bool,
    pub order: CatalogOrder,
}

impl CatalogQuery {
    /// Evaluable items after `after`, created no later than `cutoff`.
    pub fn evaluable(after: Option<Uuid>, limit: usize, cutoff: Option<DateTime<Utc>>) -> Self {
        Self {
            after,
            limit,
            cutoff,
            media_type: None,
            origin_country: None,
            include_unready: false,
            order: CatalogOrder::IdAsc,
        }
    }

    pub fn matches(&self, item: &MediaSignals) -> bool {
        let visible = if self.include_unready {
            true
        } else {
            item.is_ready && !item.is_deleted
        };
        visible
            && self.cutoff.map_or(true, |cutoff| item.created_at <= cutoff)
            && self.media_type.map_or(true, |t| item.media_type == t)
            && self.origin_country.as_deref().map_or(true, |country| {
                item.origin_countries
                    .iter()
                    .any(|c| c.trim().eq_ignore_ascii_case(country))
            })
            && match self.order {
                CatalogOrder::IdAsc => self.after.map_or(true, |after| item.media_item_id > after),
                CatalogOrder::PopularityDesc => true,
            }
    }
}

/// Read-only access to ingestion-owned media signals.
#[async_trait]
pub trait MediaCatalog: Send + Sync {
    /// Ready, non-deleted items created no later than `cutoff`.
    async fn count_evaluable(&self, cutoff: DateTime<Utc>) -> StoreResult<i64>;

    async fn fetch_page(&self, query: &CatalogQuery) -> StoreResult<Vec<MediaSignals>>;
}
