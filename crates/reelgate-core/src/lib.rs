//! Core domain model for the catalog policy engine.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reelgate-core";

/// Raised when a persisted label does not map onto a known variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind} label: {label:?}")]
pub struct LabelError {
    pub kind: &'static str,
    pub label: String,
}

impl LabelError {
    pub fn new(kind: &'static str, label: &str) -> Self {
        Self {
            kind,
            label: label.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Movie,
    Tv,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Movie => "movie",
            Self::Tv => "tv",
        }
    }
}

impl FromStr for MediaType {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "movie" => Ok(Self::Movie),
            "tv" | "series" | "show" => Ok(Self::Tv),
            _ => Err(LabelError::new("media type", s)),
        }
    }
}

/// External rating providers the ingestion side attaches to media items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RatingSource {
    Imdb,
    Tmdb,
    Trakt,
}

impl RatingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Imdb => "imdb",
            Self::Tmdb => "tmdb",
            Self::Trakt => "trakt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalRating {
    pub source: RatingSource,
    #[serde(default)]
    pub rating: Option<f64>,
    #[serde(default)]
    pub votes: Option<i64>,
}

/// Precomputed normalized scores, each expected within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaStats {
    #[serde(default)]
    pub quality_score: Option<f64>,
    #[serde(default)]
    pub popularity_score: Option<f64>,
    #[serde(default)]
    pub freshness_score: Option<f64>,
}

impl MediaStats {
    pub fn is_empty(&self) -> bool {
        self.quality_score.is_none()
            && self.popularity_score.is_none()
            && self.freshness_score.is_none()
    }
}

/// Read-only projection of a catalog item as produced by ingestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaSignals {
    pub media_item_id: Uuid,
    pub media_type: MediaType,
    pub title: String,
    #[serde(default)]
    pub origin_countries: Vec<String>,
    #[serde(default)]
    pub original_language: Option<String>,
    /// Provider ids available per region code.
    #[serde(default)]
    pub watch_providers: BTreeMap<String, Vec<i32>>,
    #[serde(default)]
    pub ratings: Vec<ExternalRating>,
    #[serde(default)]
    pub stats: Option<MediaStats>,
    pub is_ready: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl MediaSignals {
    pub fn rating(&self, source: RatingSource) -> Option<&ExternalRating> {
        self.ratings.iter().find(|r| r.source == source)
    }

    pub fn votes(&self, source: RatingSource) -> Option<i64> {
        self.rating(source).and_then(|r| r.votes)
    }

    pub fn is_available_on_any(&self, providers: &[i32]) -> bool {
        self.watch_providers
            .values()
            .flatten()
            .any(|provider| providers.contains(provider))
    }

    /// Ready, not deleted, and known before the cutoff.
    pub fn is_evaluable_at(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_ready && !self.is_deleted && self.created_at <= cutoff
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockedCountryMode {
    #[default]
    Any,
    Majority,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EligibilityMode {
    Strict,
    #[default]
    Relaxed,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BreakoutRequirements {
    #[serde(default)]
    pub min_imdb_votes: Option<i64>,
    #[serde(default)]
    pub min_tmdb_votes: Option<i64>,
    #[serde(default)]
    pub min_quality_score: Option<f64>,
    #[serde(default)]
    pub any_of_providers: Vec<i32>,
    #[serde(default)]
    pub any_rating_from: Vec<RatingSource>,
}

impl BreakoutRequirements {
    pub fn is_empty(&self) -> bool {
        self.min_imdb_votes.is_none()
            && self.min_tmdb_votes.is_none()
            && self.min_quality_score.is_none()
            && self.any_of_providers.is_empty()
            && self.any_rating_from.is_empty()
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakoutRule {
    pub id: String,
    pub name: String,
    pub priority: i32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub requirements: BreakoutRequirements,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelevanceWeights {
    pub quality: f64,
    pub popularity: f64,
    pub freshness: f64,
}

impl Default for RelevanceWeights {
    fn default() -> Self {
        Self {
            quality: 0.5,
            popularity: 0.3,
            freshness: 0.2,
        }
    }
}

/// Editable policy body. Immutable once stored in a [`CatalogPolicy`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub allowed_countries: Vec<String>,
    #[serde(default)]
    pub blocked_countries: Vec<String>,
    #[serde(default)]
    pub blocked_country_mode: BlockedCountryMode,
    #[serde(default)]
    pub allowed_languages: Vec<String>,
    #[serde(default)]
    pub blocked_languages: Vec<String>,
    #[serde(default)]
    pub global_providers: Vec<i32>,
    #[serde(default)]
    pub breakout_rules: Vec<BreakoutRule>,
    #[serde(default)]
    pub eligibility_mode: EligibilityMode,
    #[serde(default)]
    pub homepage_min_score: f64,
    #[serde(default)]
    pub relevance_weights: RelevanceWeights,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogPolicy {
    pub id: Uuid,
    pub version: i32,
    pub is_active: bool,
    pub config: PolicyConfig,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationStatus {
    Pending,
    Eligible,
    Ineligible,
    Review,
}

impl EvaluationStatus {
    pub const ALL: [EvaluationStatus; 4] = [
        Self::Pending,
        Self::Eligible,
        Self::Ineligible,
        Self::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Eligible => "eligible",
            Self::Ineligible => "ineligible",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| LabelError::new("evaluation status", s))
    }
}

/// Evaluation codes recorded on a [`MediaCatalogEvaluation`], in encounter order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReasonCode {
    MissingOriginCountry,
    MissingOriginalLanguage,
    AllowedCountry,
    BlockedCountry,
    NeutralCountry,
    AllowedLanguage,
    BlockedLanguage,
    NeutralLanguage,
    MissingGlobalSignals,
    BreakoutAllowed,
    EvaluationError,
}

impl ReasonCode {
    pub const ALL: [ReasonCode; 11] = [
        Self::MissingOriginCountry,
        Self::MissingOriginalLanguage,
        Self::AllowedCountry,
        Self::BlockedCountry,
        Self::NeutralCountry,
        Self::AllowedLanguage,
        Self::BlockedLanguage,
        Self::NeutralLanguage,
        Self::MissingGlobalSignals,
        Self::BreakoutAllowed,
        Self::EvaluationError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingOriginCountry => "MISSING_ORIGIN_COUNTRY",
            Self::MissingOriginalLanguage => "MISSING_ORIGINAL_LANGUAGE",
            Self::AllowedCountry => "ALLOWED_COUNTRY",
            Self::BlockedCountry => "BLOCKED_COUNTRY",
            Self::NeutralCountry => "NEUTRAL_COUNTRY",
            Self::AllowedLanguage => "ALLOWED_LANGUAGE",
            Self::BlockedLanguage => "BLOCKED_LANGUAGE",
            Self::NeutralLanguage => "NEUTRAL_LANGUAGE",
            Self::MissingGlobalSignals => "MISSING_GLOBAL_SIGNALS",
            Self::BreakoutAllowed => "BREAKOUT_ALLOWED",
            Self::EvaluationError => "EVALUATION_ERROR",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| LabelError::new("reason code", s))
    }
}

/// One row per `(media_item_id, policy_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaCatalogEvaluation {
    pub media_item_id: Uuid,
    pub policy_version: i32,
    pub status: EvaluationStatus,
    pub reasons: Vec<ReasonCode>,
    pub relevance_score: f64,
    pub breakout_rule_id: Option<String>,
    pub evaluated_at: Option<DateTime<Utc>>,
    pub run_id: Option<Uuid>,
}

/// Public read modes over the evaluations of the active policy version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadMode {
    #[default]
    Catalog,
    Freshness,
    Homepage,
}

impl ReadMode {
    /// Admission filter for user-facing listings.
    ///
    /// `Freshness` additionally admits items held back solely by missing
    /// global signals; any other reason, alone or combined, excludes them.
    pub fn admits(&self, evaluation: &MediaCatalogEvaluation, homepage_min_score: f64) -> bool {
        match (self, evaluation.status) {
            (_, EvaluationStatus::Pending | EvaluationStatus::Review) => false,
            (Self::Catalog, status) => status == EvaluationStatus::Eligible,
            (Self::Freshness, EvaluationStatus::Eligible) => true,
            (Self::Freshness, _) => {
                evaluation.reasons.as_slice() == [ReasonCode::MissingGlobalSignals]
            }
            (Self::Homepage, status) => {
                status == EvaluationStatus::Eligible
                    && evaluation.relevance_score >= homepage_min_score
            }
        }
    }
}

impl FromStr for ReadMode {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "catalog" => Ok(Self::Catalog),
            "freshness" => Ok(Self::Freshness),
            "homepage" => Ok(Self::Homepage),
            _ => Err(LabelError::new("read mode", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Prepared,
    Failed,
    Cancelled,
    Promoted,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Prepared => "prepared",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Promoted => "promoted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled | Self::Promoted)
    }

    /// Running or prepared: may still be cancelled or failed.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps persisted run labels, including the legacy scheme, onto [`RunStatus`].
///
/// This is the only place legacy labels are understood.
pub fn normalize_run_status(label: &str) -> Result<RunStatus, LabelError> {
    match label.trim().to_ascii_lowercase().as_str() {
        "running" | "pending" => Ok(RunStatus::Running),
        "prepared" | "completed" | "success" => Ok(RunStatus::Prepared),
        "failed" => Ok(RunStatus::Failed),
        "cancelled" => Ok(RunStatus::Cancelled),
        "promoted" => Ok(RunStatus::Promoted),
        _ => Err(LabelError::new("run status", label)),
    }
}

impl FromStr for RunStatus {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        normalize_run_status(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSampleEntry {
    pub media_item_id: Option<Uuid>,
    pub message: String,
    #[serde(default)]
    pub stack: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// Derived progress counters. Never incremented in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunCounters {
    pub processed: i64,
    pub eligible: i64,
    pub ineligible: i64,
    pub pending: i64,
    pub review: i64,
    pub errors: i64,
}

impl RunCounters {
    pub fn from_status_counts(counts: &BTreeMap<EvaluationStatus, i64>, errors: usize) -> Self {
        let get = |status| counts.get(&status).copied().unwrap_or(0);
        Self {
            processed: counts.values().sum(),
            eligible: get(EvaluationStatus::Eligible),
            ineligible: get(EvaluationStatus::Ineligible),
            pending: get(EvaluationStatus::Pending),
            review: get(EvaluationStatus::Review),
            errors: errors as i64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEvaluationRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cursor: Option<Uuid>,
    pub target_policy_id: Uuid,
    pub target_policy_version: i32,
    pub total_ready_snapshot: i64,
    pub snapshot_cutoff: DateTime<Utc>,
    #[serde(flatten)]
    pub counters: RunCounters,
    pub error_sample: Vec<ErrorSampleEntry>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub promoted_by: Option<String>,
}

impl CatalogEvaluationRun {
    pub fn start(policy: &CatalogPolicy, total_ready_snapshot: i64, cutoff: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            started_at: cutoff,
            finished_at: None,
            cursor: None,
            target_policy_id: policy.id,
            target_policy_version: policy.version,
            total_ready_snapshot,
            snapshot_cutoff: cutoff,
            counters: RunCounters::default(),
            error_sample: Vec::new(),
            promoted_at: None,
            promoted_by: None,
        }
    }
}
