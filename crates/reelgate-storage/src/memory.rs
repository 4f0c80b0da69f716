//! In-process store implementations for tests, previews and local tooling.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelgate_core::{
    CatalogEvaluationRun, CatalogPolicy, ErrorSampleEntry, MediaCatalogEvaluation, MediaSignals,
    PolicyConfig, RunCounters, RunStatus,
};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    CatalogOrder, CatalogQuery, EvaluationQuery, EvaluationScope, EvaluationStore, MediaCatalog,
    PolicyStore, RunStore, RunTransition, StatusCounts, StoreError, StoreResult,
};

#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<CatalogPolicy>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn get_active(&self) -> StoreResult<Option<CatalogPolicy>> {
        let policies = self.policies.read().await;
        Ok(policies.iter().find(|p| p.is_active).cloned())
    }

    async fn create(&self, config: PolicyConfig) -> StoreResult<CatalogPolicy> {
        let mut policies = self.policies.write().await;
        let version = policies.iter().map(|p| p.version).max().unwrap_or(0) + 1;
        let policy = CatalogPolicy {
            id: Uuid::new_v4(),
            version,
            is_active: false,
            config,
            created_at: Utc::now(),
            activated_at: None,
        };
        policies.push(policy.clone());
        Ok(policy)
    }

    async fn activate(&self, id: Uuid) -> StoreResult<CatalogPolicy> {
        // A single write guard makes deactivate-then-activate invisible to readers.
        let mut policies = self.policies.write().await;
        if !policies.iter().any(|p| p.id == id) {
            return Err(StoreError::not_found("policy", id));
        }
        let now = Utc::now();
        let mut activated = None;
        for policy in policies.iter_mut() {
            policy.is_active = policy.id == id;
            policy.activated_at = None;
            if policy.is_active {
                policy.activated_at = Some(now);
                activated = Some(policy.clone());
            }
        }
        activated.ok_or_else(|| StoreError::not_found("policy", id))
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogPolicy>> {
        let policies = self.policies.read().await;
        Ok(policies.iter().find(|p| p.id == id).cloned())
    }

    async fn find_by_version(&self, version: i32) -> StoreResult<Option<CatalogPolicy>> {
        let policies = self.policies.read().await;
        Ok(policies.iter().find(|p| p.version == version).cloned())
    }

    async fn list_all(&self) -> StoreResult<Vec<CatalogPolicy>> {
        let mut policies = self.policies.read().await.clone();
        policies.sort_by(|a, b| b.version.cmp(&a.version));
        Ok(policies)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEvaluationStore {
    rows: RwLock<BTreeMap<(i32, Uuid), MediaCatalogEvaluation>>,
    writes: AtomicUsize,
}

impl InMemoryEvaluationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of upserted rows since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }
}

#[async_trait]
impl EvaluationStore for InMemoryEvaluationStore {
    async fn upsert(&self, evaluation: &MediaCatalogEvaluation) -> StoreResult<()> {
        let mut rows = self.rows.write().await;
        rows.insert(
            (evaluation.policy_version, evaluation.media_item_id),
            evaluation.clone(),
        );
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get(&self, media_item_id: Uuid, policy_version: i32) -> StoreResult<Option<MediaCatalogEvaluation>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(policy_version, media_item_id)).cloned())
    }

    async fn get_many(
        &self,
        media_item_ids: &[Uuid],
        policy_version: i32,
    ) -> StoreResult<HashMap<Uuid, MediaCatalogEvaluation>> {
        let rows = self.rows.read().await;
        Ok(media_item_ids
            .iter()
            .filter_map(|id| rows.get(&(policy_version, *id)).map(|row| (*id, row.clone())))
            .collect())
    }

    async fn evaluated_by_run(&self, run_id: Uuid, media_item_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>> {
        let wanted: HashSet<Uuid> = media_item_ids.iter().copied().collect();
        let rows = self.rows.read().await;
        Ok(rows
            .values()
            .filter(|row| row.run_id == Some(run_id) && wanted.contains(&row.media_item_id))
            .map(|row| row.media_item_id)
            .collect())
    }

    async fn count_by_status(&self, scope: EvaluationScope) -> StoreResult<StatusCounts> {
        let rows = self.rows.read().await;
        let mut counts = StatusCounts::new();
        for row in rows.values().filter(|row| match scope {
            EvaluationScope::Run(run_id) => row.run_id == Some(run_id),
            EvaluationScope::PolicyVersion(version) => row.policy_version == version,
        }) {
            *counts.entry(row.status).or_default() += 1;
        }
        Ok(counts)
    }

    async fn list(&self, query: &EvaluationQuery) -> StoreResult<Vec<MediaCatalogEvaluation>> {
        let rows = self.rows.read().await;
        Ok(rows
            .range((query.policy_version, Uuid::nil())..=(query.policy_version, Uuid::from_u128(u128::MAX)))
            .map(|(_, row)| row)
            .filter(|row| query.matches(row))
            .take(query.limit)
            .cloned()
            .collect())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRunStore {
    runs: RwLock<HashMap<Uuid, CatalogEvaluationRun>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, run: &CatalogEvaluationRun) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        if run.status == RunStatus::Running
            && runs.values().any(|existing| {
                existing.status == RunStatus::Running && existing.target_policy_version == run.target_policy_version
            })
        {
            return Err(StoreError::RunningRunExists {
                policy_version: run.target_policy_version,
            });
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<CatalogEvaluationRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list_recent(&self, limit: usize) -> StoreResult<Vec<CatalogEvaluationRun>> {
        let mut runs: Vec<_> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn list_running(&self, started_before: Option<DateTime<Utc>>) -> StoreResult<Vec<CatalogEvaluationRun>> {
        let mut runs: Vec<_> = self
            .runs
            .read()
            .await
            .values()
            .filter(|run| run.status == RunStatus::Running)
            .filter(|run| started_before.map_or(true, |cutoff| run.started_at < cutoff))
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(runs)
    }

    async fn advance_cursor(&self, id: Uuid, expected: Option<Uuid>, next: Option<Uuid>) -> StoreResult<bool> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::not_found("run", id))?;
        if run.cursor != expected {
            return Ok(false);
        }
        run.cursor = next;
        Ok(true)
    }

    async fn write_counters(&self, id: Uuid, counters: &RunCounters) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::not_found("run", id))?;
        run.counters = *counters;
        Ok(())
    }

    async fn append_error(&self, id: Uuid, entry: ErrorSampleEntry, limit: usize) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::not_found("run", id))?;
        if run.error_sample.len() < limit {
            run.error_sample.push(entry);
        }
        Ok(())
    }

    async fn transition(&self, id: Uuid, from: &[RunStatus], transition: RunTransition) -> StoreResult<bool> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| StoreError::not_found("run", id))?;
        if !from.contains(&run.status) {
            return Ok(false);
        }
        transition.apply(run);
        Ok(true)
    }
}

/// Stand-in for the ingestion-owned catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    items: RwLock<BTreeMap<Uuid, MediaSignals>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, item: MediaSignals) {
        self.items.write().await.insert(item.media_item_id, item);
    }

    pub async fn extend(&self, items: impl IntoIterator<Item = MediaSignals>) {
        let mut guard = self.items.write().await;
        for item in items {
            guard.insert(item.media_item_id, item);
        }
    }

    pub async fn mark_deleted(&self, id: Uuid) {
        if let Some(item) = self.items.write().await.get_mut(&id) {
            item.is_deleted = true;
        }
    }
}

#[async_trait]
impl MediaCatalog for InMemoryCatalog {
    async fn count_evaluable(&self, cutoff: DateTime<Utc>) -> StoreResult<i64> {
        let items = self.items.read().await;
        Ok(items.values().filter(|item| item.is_evaluable_at(cutoff)).count() as i64)
    }

    async fn fetch_page(&self, query: &CatalogQuery) -> StoreResult<Vec<MediaSignals>> {
        let items = self.items.read().await;
        let mut page: Vec<MediaSignals> = items.values().filter(|item| query.matches(item)).cloned().collect();
        if query.order == CatalogOrder::PopularityDesc {
            let popularity = |item: &MediaSignals| {
                item.stats
                    .and_then(|s| s.popularity_score)
                    .unwrap_or(f64::NEG_INFINITY)
            };
            page.sort_by(|a, b| popularity(b).total_cmp(&popularity(a)));
        }
        page.truncate(query.limit);
        Ok(page)
    }
}
