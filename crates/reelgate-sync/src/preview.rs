//! Side-effect-free evaluation of a candidate policy over part of the catalog.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::{Duration, Instant};

use reelgate_core::{
    EvaluationStatus, LabelError, MediaSignals, MediaType, PolicyConfig, ReasonCode,
};
use reelgate_eval::{normalize_country, validate_policy_config, EvaluationResult, PreparedPolicy};
use reelgate_storage::{CatalogOrder, CatalogQuery};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{EngineError, EngineResult, EngineStores};

/// Hard ceiling on items a single preview may evaluate.
pub const PREVIEW_ITEM_CAP: usize = 10_000;

const SAMPLE_BUCKETS: u64 = 10_000;
const SCAN_PAGE: usize = 500;
const DEFAULT_SEED: &str = "reelgate";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewMode {
    Sample,
    Top,
    #[serde(alias = "byType")]
    ByType,
    #[serde(alias = "byCountry")]
    ByCountry,
}

impl FromStr for PreviewMode {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "sample" => Ok(Self::Sample),
            "top" => Ok(Self::Top),
            "bytype" => Ok(Self::ByType),
            "bycountry" => Ok(Self::ByCountry),
            _ => Err(LabelError::new("preview mode", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunRequest {
    pub config: PolicyConfig,
    pub mode: PreviewMode,
    #[serde(default)]
    pub sample_percent: Option<f64>,
    #[serde(default)]
    pub media_type: Option<MediaType>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub seed: Option<String>,
}

impl DryRunRequest {
    pub fn new(config: PolicyConfig, mode: PreviewMode) -> Self {
        Self {
            config,
            mode,
            sample_percent: None,
            media_type: None,
            country: None,
            limit: None,
            seed: None,
        }
    }
}

/// A request that passed validation; only these reach the stores.
#[derive(Debug, Clone)]
struct Selection {
    mode: PreviewMode,
    sample_basis_points: u64,
    media_type: Option<MediaType>,
    country: Option<String>,
    limit: usize,
    seed: String,
}

fn validate(request: &DryRunRequest, max_items: usize) -> EngineResult<Selection> {
    validate_policy_config(&request.config)?;

    let limit = match request.limit {
        None => max_items,
        Some(0) => return Err(EngineError::Validation("limit must be at least 1".into())),
        Some(limit) if limit > max_items => {
            return Err(EngineError::Validation(format!("limit {limit} exceeds the cap of {max_items}")))
        }
        Some(limit) => limit,
    };

    let mut selection = Selection {
        mode: request.mode,
        sample_basis_points: SAMPLE_BUCKETS,
        media_type: None,
        country: None,
        limit,
        seed: request.seed.clone().unwrap_or_else(|| DEFAULT_SEED.to_string()),
    };
    match request.mode {
        PreviewMode::Sample => {
            let percent = request
                .sample_percent
                .ok_or_else(|| EngineError::Validation("sample mode requires sample_percent".into()))?;
            if !percent.is_finite() || percent <= 0.0 || percent > 100.0 {
                return Err(EngineError::Validation(format!(
                    "sample_percent {percent} must be within (0, 100]"
                )));
            }
            selection.sample_basis_points = (percent * 100.0).round().max(1.0) as u64;
        }
        PreviewMode::Top => {}
        PreviewMode::ByType => {
            selection.media_type = Some(
                request
                    .media_type
                    .ok_or_else(|| EngineError::Validation("byType mode requires media_type".into()))?,
            );
        }
        PreviewMode::ByCountry => {
            let country = request
                .country
                .as_deref()
                .map(normalize_country)
                .filter(|c| !c.is_empty())
                .ok_or_else(|| EngineError::Validation("byCountry mode requires country".into()))?;
            if country.len() != 2 || !country.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(EngineError::Validation(format!("country {country:?} is not a two-letter code")));
            }
            selection.country = Some(country);
        }
    }
    Ok(selection)
}

/// Deterministic bucket in `0..10_000` for sample membership.
pub fn sample_bucket(seed: &str, media_item_id: Uuid) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(b":");
    hasher.update(media_item_id.as_bytes());
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % SAMPLE_BUCKETS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemChange {
    NewlyEligible,
    NewlyIneligible,
    Unchanged,
    Changed,
}

impl ItemChange {
    fn classify(current: Option<EvaluationStatus>, proposed: EvaluationStatus) -> Self {
        match (current, proposed) {
            (Some(current), proposed) if current == proposed => Self::Unchanged,
            (current, EvaluationStatus::Eligible) if current != Some(EvaluationStatus::Eligible) => {
                Self::NewlyEligible
            }
            (Some(EvaluationStatus::Eligible), _) => Self::NewlyIneligible,
            _ => Self::Changed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewItem {
    pub media_item_id: Uuid,
    pub title: String,
    pub media_type: MediaType,
    pub current_status: Option<EvaluationStatus>,
    pub proposed_status: EvaluationStatus,
    pub reasons: Vec<ReasonCode>,
    pub breakout_rule_id: Option<String>,
    pub relevance_score: f64,
    pub change: ItemChange,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreviewSummary {
    pub evaluated: usize,
    pub baseline_version: Option<i32>,
    pub by_status: BTreeMap<EvaluationStatus, usize>,
    pub newly_eligible: usize,
    pub newly_ineligible: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub reason_histogram: BTreeMap<ReasonCode, usize>,
    pub evaluation_errors: usize,
    pub truncated: bool,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewReport {
    pub mode: PreviewMode,
    pub summary: PreviewSummary,
    pub items: Vec<PreviewItem>,
}

#[derive(Clone)]
pub struct DryRunPreview {
    stores: EngineStores,
    max_items: usize,
    budget: Duration,
}

impl DryRunPreview {
    pub fn new(stores: EngineStores) -> Self {
        Self {
            stores,
            max_items: PREVIEW_ITEM_CAP,
            budget: Duration::from_secs(60),
        }
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items.clamp(1, PREVIEW_ITEM_CAP);
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Evaluates the candidate against the selected items and compares with
    /// the active version. Never writes to any store.
    pub async fn preview(&self, request: DryRunRequest) -> EngineResult<PreviewReport> {
        let selection = validate(&request, self.max_items)?;
        let started = Instant::now();
        let candidate = PreparedPolicy::new(&request.config);
        let baseline = self.stores.policies.get_active().await?;

        let mut summary = PreviewSummary {
            baseline_version: baseline.as_ref().map(|p| p.version),
            ..PreviewSummary::default()
        };
        let mut items = Vec::new();
        let mut after: Option<Uuid> = None;

        'scan: loop {
            if items.len() >= selection.limit {
                break;
            }
            if started.elapsed() >= self.budget {
                summary.truncated = true;
                warn!(evaluated = items.len(), "dry run stopped at its time budget");
                break;
            }
            let mut query = CatalogQuery::evaluable(after, SCAN_PAGE, None);
            query.media_type = selection.media_type;
            query.origin_country = selection.country.clone();
            if selection.mode == PreviewMode::Top {
                query.order = CatalogOrder::PopularityDesc;
                query.limit = selection.limit;
            }

            let page = self.stores.catalog.fetch_page(&query).await?;
            let Some(last) = page.last() else { break };
            after = Some(last.media_item_id);

            let chosen: Vec<&MediaSignals> = page
                .iter()
                .filter(|item| {
                    selection.mode != PreviewMode::Sample
                        || sample_bucket(&selection.seed, item.media_item_id) < selection.sample_basis_points
                })
                .collect();
            let ids: Vec<Uuid> = chosen.iter().map(|item| item.media_item_id).collect();
            let current = match &baseline {
                Some(policy) => self.stores.evaluations.get_many(&ids, policy.version).await?,
                None => Default::default(),
            };

            for item in chosen {
                if items.len() >= selection.limit {
                    break 'scan;
                }
                if started.elapsed() >= self.budget {
                    summary.truncated = true;
                    warn!(evaluated = items.len(), "dry run stopped at its time budget");
                    break 'scan;
                }
                let result = match candidate.evaluate(item) {
                    Ok(result) => result,
                    Err(err) => {
                        summary.evaluation_errors += 1;
                        warn!(media_item_id = %item.media_item_id, error = %err, "dry run item failed");
                        EvaluationResult {
                            status: EvaluationStatus::Pending,
                            reasons: vec![ReasonCode::EvaluationError],
                            breakout_rule_id: None,
                        }
                    }
                };
                let current_status = current.get(&item.media_item_id).map(|row| row.status);
                items.push(PreviewItem {
                    media_item_id: item.media_item_id,
                    title: item.title.clone(),
                    media_type: item.media_type,
                    current_status,
                    proposed_status: result.status,
                    change: ItemChange::classify(current_status, result.status),
                    reasons: result.reasons,
                    breakout_rule_id: result.breakout_rule_id,
                    relevance_score: candidate.relevance(item),
                });
            }

            if selection.mode == PreviewMode::Top || page.len() < query.limit {
                break;
            }
        }

        if selection.mode == PreviewMode::Top {
            items.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        }
        for item in &items {
            *summary.by_status.entry(item.proposed_status).or_default() += 1;
            for reason in &item.reasons {
                *summary.reason_histogram.entry(*reason).or_default() += 1;
            }
            match item.change {
                ItemChange::NewlyEligible => summary.newly_eligible += 1,
                ItemChange::NewlyIneligible => summary.newly_ineligible += 1,
                ItemChange::Unchanged => summary.unchanged += 1,
                ItemChange::Changed => summary.changed += 1,
            }
        }
        summary.evaluated = items.len();
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            mode = ?selection.mode,
            evaluated = summary.evaluated,
            newly_eligible = summary.newly_eligible,
            newly_ineligible = summary.newly_ineligible,
            truncated = summary.truncated,
            "dry run finished"
        );

        Ok(PreviewReport {
            mode: selection.mode,
            summary,
            items,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use reelgate_core::CatalogPolicy;
    use reelgate_storage::{
        InMemoryCatalog, InMemoryEvaluationStore, InMemoryRunStore, MediaCatalog, PolicyStore, StoreResult,
    };

    use crate::testkit::item;
    use crate::{CatalogEngine, EngineConfig};

    /// Any access means validation let a bad request through.
    struct Untouchable;

    #[async_trait]
    impl PolicyStore for Untouchable {
        async fn get_active(&self) -> StoreResult<Option<CatalogPolicy>> {
            panic!("policy store accessed")
        }
        async fn create(&self, _: PolicyConfig) -> StoreResult<CatalogPolicy> {
            panic!("policy store accessed")
        }
        async fn activate(&self, _: Uuid) -> StoreResult<CatalogPolicy> {
            panic!("policy store accessed")
        }
        async fn find_by_id(&self, _: Uuid) -> StoreResult<Option<CatalogPolicy>> {
            panic!("policy store accessed")
        }
        async fn find_by_version(&self, _: i32) -> StoreResult<Option<CatalogPolicy>> {
            panic!("policy store accessed")
        }
        async fn list_all(&self) -> StoreResult<Vec<CatalogPolicy>> {
            panic!("policy store accessed")
        }
    }

    #[async_trait]
    impl MediaCatalog for Untouchable {
        async fn count_evaluable(&self, _: DateTime<Utc>) -> StoreResult<i64> {
            panic!("catalog accessed")
        }
        async fn fetch_page(&self, _: &CatalogQuery) -> StoreResult<Vec<MediaSignals>> {
            panic!("catalog accessed")
        }
    }

    fn untouchable_preview() -> DryRunPreview {
        DryRunPreview::new(EngineStores {
            policies: Arc::new(Untouchable),
            evaluations: Arc::new(InMemoryEvaluationStore::new()),
            runs: Arc::new(InMemoryRunStore::new()),
            catalog: Arc::new(Untouchable),
        })
    }

    #[tokio::test]
    async fn by_type_without_media_type_is_rejected_before_store_access() {
        let request = DryRunRequest::new(PolicyConfig::default(), PreviewMode::ByType);
        let err = untouchable_preview().preview(request).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(msg) if msg.contains("media_type")));
    }

    #[tokio::test]
    async fn out_of_range_parameters_are_rejected_before_store_access() {
        let preview = untouchable_preview();

        let mut request = DryRunRequest::new(PolicyConfig::default(), PreviewMode::Sample);
        assert!(matches!(preview.preview(request.clone()).await, Err(EngineError::Validation(_))));
        request.sample_percent = Some(150.0);
        assert!(matches!(preview.preview(request.clone()).await, Err(EngineError::Validation(_))));

        let mut request = DryRunRequest::new(PolicyConfig::default(), PreviewMode::Top);
        request.limit = Some(PREVIEW_ITEM_CAP + 1);
        assert!(matches!(preview.preview(request.clone()).await, Err(EngineError::Validation(_))));
        request.limit = Some(0);
        assert!(matches!(preview.preview(request).await, Err(EngineError::Validation(_))));

        let request = DryRunRequest::new(PolicyConfig::default(), PreviewMode::ByCountry);
        assert!(matches!(preview.preview(request).await, Err(EngineError::Validation(_))));

        let bad_config = PolicyConfig {
            homepage_min_score: 3.0,
            ..PolicyConfig::default()
        };
        let request = DryRunRequest::new(bad_config, PreviewMode::Top);
        assert!(matches!(preview.preview(request).await, Err(EngineError::Validation(_))));
    }

    #[test]
    fn mode_labels_accept_both_spellings() {
        assert_eq!("byType".parse::<PreviewMode>().unwrap(), PreviewMode::ByType);
        assert_eq!("by_country".parse::<PreviewMode>().unwrap(), PreviewMode::ByCountry);
        let request: DryRunRequest =
            serde_json::from_str(r#"{"config":{},"mode":"byType","media_type":"tv"}"#).unwrap();
        assert_eq!(request.mode, PreviewMode::ByType);
        assert_eq!(request.media_type, Some(MediaType::Tv));
    }

    #[test]
    fn sample_buckets_are_deterministic_and_spread() {
        let id = Uuid::from_u128(42);
        assert_eq!(sample_bucket("s", id), sample_bucket("s", id));
        let in_half = (0..2_000u128)
            .filter(|n| sample_bucket("s", Uuid::from_u128(*n)) < 5_000)
            .count();
        assert!((800..1_200).contains(&in_half), "got {in_half}");
    }

    #[test]
    fn change_classification() {
        use EvaluationStatus::*;
        assert_eq!(ItemChange::classify(None, Eligible), ItemChange::NewlyEligible);
        assert_eq!(ItemChange::classify(Some(Review), Eligible), ItemChange::NewlyEligible);
        assert_eq!(ItemChange::classify(Some(Eligible), Ineligible), ItemChange::NewlyIneligible);
        assert_eq!(ItemChange::classify(Some(Eligible), Review), ItemChange::NewlyIneligible);
        assert_eq!(ItemChange::classify(Some(Ineligible), Ineligible), ItemChange::Unchanged);
        assert_eq!(ItemChange::classify(Some(Review), Ineligible), ItemChange::Changed);
        assert_eq!(ItemChange::classify(None, Ineligible), ItemChange::Changed);
    }

    async fn engine_with_baseline() -> (CatalogEngine, Arc<InMemoryEvaluationStore>) {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.extend((1..=20u128).map(|n| item(n, if n <= 5 { "RU" } else { "US" }, "en"))).await;
        let evaluations = Arc::new(InMemoryEvaluationStore::new());
        let stores = EngineStores {
            evaluations: evaluations.clone(),
            ..EngineStores::in_memory(catalog)
        };
        let engine = CatalogEngine::new(stores, EngineConfig::default());

        let baseline = engine.create_policy(PolicyConfig::default()).await.unwrap();
        let run = engine.start_run(baseline.id).await.unwrap();
        while let crate::BatchOutcome::Processed { .. } = engine.process_batch(run.id).await.unwrap() {}
        engine.finalize_run(run.id).await.unwrap();
        engine.promote_run(run.id, "test").await.unwrap();
        (engine, evaluations)
    }

    #[tokio::test]
    async fn preview_compares_with_active_version_and_writes_nothing() {
        let (engine, evaluations) = engine_with_baseline().await;
        let writes_before = evaluations.write_count();

        let candidate = PolicyConfig {
            blocked_countries: vec!["RU".into()],
            ..PolicyConfig::default()
        };
        let report = engine
            .dry_run(DryRunRequest::new(candidate, PreviewMode::Top))
            .await
            .unwrap();

        assert_eq!(evaluations.write_count(), writes_before);
        assert_eq!(report.summary.evaluated, 20);
        assert_eq!(report.summary.baseline_version, Some(1));
        assert_eq!(report.summary.newly_ineligible, 5);
        assert_eq!(report.summary.unchanged, 15);
        assert_eq!(report.summary.by_status.get(&EvaluationStatus::Ineligible), Some(&5));
        assert_eq!(report.summary.reason_histogram.get(&ReasonCode::BlockedCountry), Some(&5));
        assert!(!report.summary.truncated);
        assert!(report
            .items
            .windows(2)
            .all(|w| w[0].relevance_score >= w[1].relevance_score));
    }

    #[tokio::test]
    async fn filters_and_limits_apply() {
        let (engine, _) = engine_with_baseline().await;

        let mut by_type = DryRunRequest::new(PolicyConfig::default(), PreviewMode::ByType);
        by_type.media_type = Some(MediaType::Movie);
        let report = engine.dry_run(by_type).await.unwrap();
        assert_eq!(report.summary.evaluated, 10);
        assert!(report.items.iter().all(|i| i.media_type == MediaType::Movie));

        let mut by_country = DryRunRequest::new(PolicyConfig::default(), PreviewMode::ByCountry);
        by_country.country = Some("ru".into());
        by_country.limit = Some(3);
        let report = engine.dry_run(by_country).await.unwrap();
        assert_eq!(report.summary.evaluated, 3);

        let mut sample = DryRunRequest::new(PolicyConfig::default(), PreviewMode::Sample);
        sample.sample_percent = Some(100.0);
        assert_eq!(engine.dry_run(sample.clone()).await.unwrap().summary.evaluated, 20);
        sample.sample_percent = Some(50.0);
        let first = engine.dry_run(sample.clone()).await.unwrap();
        let second = engine.dry_run(sample).await.unwrap();
        assert_eq!(first.items, second.items);
    }

    #[tokio::test]
    async fn zero_budget_truncates() {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.extend((1..=5u128).map(|n| item(n, "US", "en"))).await;
        let preview = DryRunPreview::new(EngineStores::in_memory(catalog)).with_budget(Duration::ZERO);
        let report = preview
            .preview(DryRunRequest::new(PolicyConfig::default(), PreviewMode::Top))
            .await
            .unwrap();
        assert!(report.summary.truncated);
        assert_eq!(report.summary.evaluated, 0);
    }

    struct CountingCatalog {
        inner: InMemoryCatalog,
        pages: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl MediaCatalog for CountingCatalog {
        async fn count_evaluable(&self, cutoff: DateTime<Utc>) -> StoreResult<i64> {
            self.inner.count_evaluable(cutoff).await
        }
        async fn fetch_page(&self, query: &CatalogQuery) -> StoreResult<Vec<MediaSignals>> {
            self.pages.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.fetch_page(query).await
        }
    }

    #[tokio::test]
    async fn budget_bounds_sparse_sample_scans() {
        let inner = InMemoryCatalog::new();
        inner.extend((1..=3_000u128).map(|n| item(n, "US", "en"))).await;
        let catalog = Arc::new(CountingCatalog {
            inner,
            pages: std::sync::atomic::AtomicUsize::new(0),
        });
        let mut stores = EngineStores::in_memory(Arc::new(InMemoryCatalog::new()));
        stores.catalog = catalog.clone();

        let mut request = DryRunRequest::new(PolicyConfig::default(), PreviewMode::Sample);
        request.sample_percent = Some(0.01);
        let report = DryRunPreview::new(stores.clone())
            .with_budget(Duration::ZERO)
            .preview(request.clone())
            .await
            .unwrap();
        assert!(report.summary.truncated);
        assert_eq!(report.summary.evaluated, 0);
        assert_eq!(catalog.pages.load(std::sync::atomic::Ordering::SeqCst), 0);

        let full = DryRunPreview::new(stores).preview(request).await.unwrap();
        assert!(!full.summary.truncated);
        assert!(catalog.pages.load(std::sync::atomic::Ordering::SeqCst) >= 6);
    }
}
