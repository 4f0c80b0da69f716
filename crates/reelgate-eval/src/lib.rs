//! Pure eligibility evaluation and relevance scoring against a policy.
//!
//! Nothing in this crate performs I/O apart from [`load_policy_config`];
//! evaluation is deterministic and safe to call from any number of workers.

use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reelgate_core::{
    BlockedCountryMode, BreakoutRule, EligibilityMode, EvaluationStatus, MediaCatalogEvaluation,
    MediaSignals, PolicyConfig, RatingSource, ReasonCode, RelevanceWeights,
};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "reelgate-eval";

const UNKNOWN_LANGUAGES: [&str; 2] = ["xx", "und"];

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvaluationError {
    #[error("malformed signals for {media_item_id}: {detail}")]
    MalformedSignals { media_item_id: Uuid, detail: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid policy config: {}", issues.join("; "))]
pub struct PolicyConfigError {
    pub issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationResult {
    pub status: EvaluationStatus,
    pub reasons: Vec<ReasonCode>,
    pub breakout_rule_id: Option<String>,
}

impl EvaluationResult {
    fn pending(reasons: Vec<ReasonCode>) -> Self {
        Self {
            status: EvaluationStatus::Pending,
            reasons,
            breakout_rule_id: None,
        }
    }

    pub fn into_record(
        self,
        media_item_id: Uuid,
        policy_version: i32,
        relevance_score: f64,
        run_id: Option<Uuid>,
        evaluated_at: DateTime<Utc>,
    ) -> MediaCatalogEvaluation {
        MediaCatalogEvaluation {
            media_item_id,
            policy_version,
            status: self.status,
            reasons: self.reasons,
            relevance_score,
            breakout_rule_id: self.breakout_rule_id,
            evaluated_at: Some(evaluated_at),
            run_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Allowed,
    Neutral,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Weight {
    Positive,
    Neutral,
    Blocking,
    Tolerated,
}

#[derive(Debug, Default)]
struct ReasonTrail {
    entries: Vec<(ReasonCode, Weight)>,
}

impl ReasonTrail {
    fn push(&mut self, code: ReasonCode, weight: Weight) {
        self.entries.push((code, weight));
    }

    /// Eligible rows keep every code; others keep what held them back.
    /// Ineligible rows keep neutral verdicts too, so a neutral item missing
    /// global signals never reads as a pure `MISSING_GLOBAL_SIGNALS` row.
    fn reasons_for(&self, status: EvaluationStatus) -> Vec<ReasonCode> {
        self.entries
            .iter()
            .filter(|(_, weight)| match status {
                EvaluationStatus::Eligible => true,
                EvaluationStatus::Review => matches!(weight, Weight::Neutral | Weight::Tolerated),
                EvaluationStatus::Ineligible => matches!(weight, Weight::Blocking | Weight::Neutral),
                EvaluationStatus::Pending => false,
            })
            .map(|(code, _)| *code)
            .collect()
    }
}

/// Policy normalized once so per-item evaluation is a lookup plus one rule scan.
#[derive(Debug, Clone)]
pub struct PreparedPolicy {
    allowed_countries: BTreeSet<String>,
    blocked_countries: BTreeSet<String>,
    country_mode: BlockedCountryMode,
    allowed_languages: BTreeSet<String>,
    blocked_languages: BTreeSet<String>,
    global_providers: Vec<i32>,
    rules: Vec<BreakoutRule>,
    mode: EligibilityMode,
    weights: RelevanceWeights,
}

impl PreparedPolicy {
    pub fn new(config: &PolicyConfig) -> Self {
        let mut rules: Vec<BreakoutRule> = config
            .breakout_rules
            .iter()
            .filter(|rule| rule.enabled && !rule.requirements.is_empty())
            .cloned()
            .collect();
        // Stable: equal priorities keep configuration order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        Self {
            allowed_countries: config.allowed_countries.iter().map(|c| normalize_country(c)).collect(),
            blocked_countries: config.blocked_countries.iter().map(|c| normalize_country(c)).collect(),
            country_mode: config.blocked_country_mode,
            allowed_languages: config.allowed_languages.iter().map(|l| normalize_language(l)).collect(),
            blocked_languages: config.blocked_languages.iter().map(|l| normalize_language(l)).collect(),
            global_providers: config.global_providers.clone(),
            rules,
            mode: config.eligibility_mode,
            weights: config.relevance_weights,
        }
    }

    pub fn evaluate(&self, signals: &MediaSignals) -> Result<EvaluationResult, EvaluationError> {
        check_signals(signals)?;

        let countries: Vec<String> = signals
            .origin_countries
            .iter()
            .map(|c| normalize_country(c))
            .filter(|c| !c.is_empty())
            .collect();
        let language = signals
            .original_language
            .as_deref()
            .map(normalize_language)
            .filter(|l| !l.is_empty() && !UNKNOWN_LANGUAGES.contains(&l.as_str()));

        let mut missing = Vec::new();
        if countries.is_empty() {
            missing.push(ReasonCode::MissingOriginCountry);
        }
        if language.is_none() {
            missing.push(ReasonCode::MissingOriginalLanguage);
        }
        let Some(language) = language.filter(|_| missing.is_empty()) else {
            return Ok(EvaluationResult::pending(missing));
        };

        let mut trail = ReasonTrail::default();
        let country = self.classify_countries(&countries);
        trail.push(
            match country {
                Verdict::Allowed => ReasonCode::AllowedCountry,
                Verdict::Neutral => ReasonCode::NeutralCountry,
                Verdict::Blocked => ReasonCode::BlockedCountry,
            },
            weight_of(country),
        );
        let lang = self.classify(&language, &self.allowed_languages, &self.blocked_languages);
        trail.push(
            match lang {
                Verdict::Allowed => ReasonCode::AllowedLanguage,
                Verdict::Neutral => ReasonCode::NeutralLanguage,
                Verdict::Blocked => ReasonCode::BlockedLanguage,
            },
            weight_of(lang),
        );

        let mut blocked = country == Verdict::Blocked || lang == Verdict::Blocked;
        if !blocked && !self.has_global_signals(signals) {
            match self.mode {
                EligibilityMode::Strict => {
                    trail.push(ReasonCode::MissingGlobalSignals, Weight::Blocking);
                    blocked = true;
                }
                EligibilityMode::Relaxed => {
                    trail.push(ReasonCode::MissingGlobalSignals, Weight::Tolerated);
                }
            }
        }

        let has_neutral = country == Verdict::Neutral || lang == Verdict::Neutral;
        let base = if blocked {
            EvaluationStatus::Ineligible
        } else if self.mode == EligibilityMode::Strict && has_neutral {
            EvaluationStatus::Review
        } else {
            EvaluationStatus::Eligible
        };

        let mut reasons = trail.reasons_for(base);
        if base != EvaluationStatus::Eligible {
            if let Some(rule) = self.first_satisfied_rule(signals) {
                reasons.push(ReasonCode::BreakoutAllowed);
                return Ok(EvaluationResult {
                    status: EvaluationStatus::Eligible,
                    reasons,
                    breakout_rule_id: Some(rule.id.clone()),
                });
            }
        }

        Ok(EvaluationResult {
            status: base,
            reasons,
            breakout_rule_id: None,
        })
    }

    /// Weighted blend of the stats triple, bounded to `[0, 1]`.
    pub fn relevance(&self, signals: &MediaSignals) -> f64 {
        let Some(stats) = signals.stats else {
            return 0.0;
        };
        let w = self.weights;
        let total = w.quality + w.popularity + w.freshness;
        if !total.is_finite() || total <= 0.0 {
            return 0.0;
        }
        let blended = [
            (w.quality, stats.quality_score),
            (w.popularity, stats.popularity_score),
            (w.freshness, stats.freshness_score),
        ]
        .into_iter()
        .filter_map(|(weight, value)| value.filter(|v| v.is_finite()).map(|v| weight * v.clamp(0.0, 1.0)))
        .sum::<f64>();
        (blended / total).clamp(0.0, 1.0)
    }

    fn classify_countries(&self, countries: &[String]) -> Verdict {
        let verdicts: Vec<Verdict> = countries
            .iter()
            .map(|c| self.classify(c, &self.allowed_countries, &self.blocked_countries))
            .collect();
        let blocked = verdicts.iter().filter(|v| **v == Verdict::Blocked).count();
        let is_blocked = match self.country_mode {
            BlockedCountryMode::Any => blocked > 0,
            BlockedCountryMode::Majority => blocked * 2 > verdicts.len(),
        };
        if is_blocked {
            Verdict::Blocked
        } else if verdicts.contains(&Verdict::Allowed) {
            Verdict::Allowed
        } else {
            Verdict::Neutral
        }
    }

    fn classify(&self, code: &str, allowed: &BTreeSet<String>, blocked: &BTreeSet<String>) -> Verdict {
        if blocked.contains(code) {
            Verdict::Blocked
        } else if allowed.contains(code) {
            Verdict::Allowed
        } else {
            Verdict::Neutral
        }
    }

    fn has_global_signals(&self, signals: &MediaSignals) -> bool {
        signals.is_available_on_any(&self.global_providers)
            || signals
                .ratings
                .iter()
                .any(|rating| rating.votes.is_some_and(|votes| votes > 0))
    }

    fn first_satisfied_rule(&self, signals: &MediaSignals) -> Option<&BreakoutRule> {
        self.rules.iter().find(|rule| {
            let req = &rule.requirements;
            let votes_ok = |min: Option<i64>, source| match min {
                Some(min) => signals.votes(source).is_some_and(|votes| votes >= min),
                None => true,
            };
            let quality_ok = match req.min_quality_score {
                Some(min) => signals
                    .stats
                    .and_then(|s| s.quality_score)
                    .is_some_and(|quality| quality >= min),
                None => true,
            };
            let providers_ok =
                req.any_of_providers.is_empty() || signals.is_available_on_any(&req.any_of_providers);
            let ratings_ok = req.any_rating_from.is_empty()
                || req.any_rating_from.iter().any(|source| {
                    signals
                        .rating(*source)
                        .is_some_and(|rating| rating.rating.is_some())
                });
            votes_ok(req.min_imdb_votes, RatingSource::Imdb)
                && votes_ok(req.min_tmdb_votes, RatingSource::Tmdb)
                && quality_ok
                && providers_ok
                && ratings_ok
        })
    }
}

fn weight_of(verdict: Verdict) -> Weight {
    match verdict {
        Verdict::Allowed => Weight::Positive,
        Verdict::Neutral => Weight::Neutral,
        Verdict::Blocked => Weight::Blocking,
    }
}

/// `(MediaSignals, PolicyConfig) -> EvaluationResult`.
pub fn evaluate_eligibility(
    signals: &MediaSignals,
    config: &PolicyConfig,
) -> Result<EvaluationResult, EvaluationError> {
    PreparedPolicy::new(config).evaluate(signals)
}

/// `(MediaSignals, PolicyConfig) -> score`.
pub fn relevance_score(signals: &MediaSignals, config: &PolicyConfig) -> f64 {
    PreparedPolicy::new(config).relevance(signals)
}

pub fn normalize_country(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

pub fn normalize_language(code: &str) -> String {
    code.trim().to_ascii_lowercase()
}

fn is_country_code(code: &str) -> bool {
    code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic())
}

fn is_language_code(code: &str) -> bool {
    (2..=3).contains(&code.len()) && code.chars().all(|c| c.is_ascii_alphabetic())
}

fn check_signals(signals: &MediaSignals) -> Result<(), EvaluationError> {
    let malformed = |detail: String| EvaluationError::MalformedSignals {
        media_item_id: signals.media_item_id,
        detail,
    };

    for country in &signals.origin_countries {
        let code = country.trim();
        if !code.is_empty() && !is_country_code(code) {
            return Err(malformed(format!("origin country {country:?} is not a two-letter code")));
        }
    }
    if let Some(language) = signals.original_language.as_deref() {
        let code = language.trim();
        if !code.is_empty() && !is_language_code(code) {
            return Err(malformed(format!("original language {language:?} is not a language code")));
        }
    }
    for rating in &signals.ratings {
        if rating.votes.is_some_and(|votes| votes < 0) {
            return Err(malformed(format!("negative vote count from {}", rating.source.as_str())));
        }
        if rating.rating.is_some_and(|value| !value.is_finite()) {
            return Err(malformed(format!("non-finite rating from {}", rating.source.as_str())));
        }
    }
    if let Some(stats) = signals.stats {
        for (name, value) in [
            ("quality", stats.quality_score),
            ("popularity", stats.popularity_score),
            ("freshness", stats.freshness_score),
        ] {
            if let Some(value) = value {
                if !value.is_finite() {
                    return Err(malformed(format!("{name} score {value} is not finite")));
                }
            }
        }
    }
    Ok(())
}

pub fn validate_policy_config(config: &PolicyConfig) -> Result<(), PolicyConfigError> {
    let mut issues = Vec::new();

    for code in config.allowed_countries.iter().chain(&config.blocked_countries) {
        if !is_country_code(code.trim()) {
            issues.push(format!("country code {code:?} must be two ASCII letters"));
        }
    }
    for code in config.allowed_languages.iter().chain(&config.blocked_languages) {
        if !is_language_code(code.trim()) {
            issues.push(format!("language code {code:?} must be two or three ASCII letters"));
        }
    }

    let blocked: HashSet<String> = config.blocked_countries.iter().map(|c| normalize_country(c)).collect();
    for code in &config.allowed_countries {
        if blocked.contains(&normalize_country(code)) {
            issues.push(format!("country {code} is both allowed and blocked"));
        }
    }
    let blocked: HashSet<String> = config.blocked_languages.iter().map(|l| normalize_language(l)).collect();
    for code in &config.allowed_languages {
        if blocked.contains(&normalize_language(code)) {
            issues.push(format!("language {code} is both allowed and blocked"));
        }
    }

    let mut rule_ids = HashSet::new();
    for rule in &config.breakout_rules {
        if rule.id.trim().is_empty() {
            issues.push(format!("breakout rule {:?} has an empty id", rule.name));
        } else if !rule_ids.insert(rule.id.as_str()) {
            issues.push(format!("duplicate breakout rule id {}", rule.id));
        }
        let req = &rule.requirements;
        if req.min_imdb_votes.is_some_and(|v| v < 0) || req.min_tmdb_votes.is_some_and(|v| v < 0) {
            issues.push(format!("breakout rule {} has a negative vote threshold", rule.id));
        }
        if req
            .min_quality_score
            .is_some_and(|q| !q.is_finite() || !(0.0..=1.0).contains(&q))
        {
            issues.push(format!("breakout rule {} quality threshold must be within [0, 1]", rule.id));
        }
    }

    let w = config.relevance_weights;
    let weights = [w.quality, w.popularity, w.freshness];
    if weights.iter().any(|v| !v.is_finite() || *v < 0.0) {
        issues.push("relevance weights must be finite and non-negative".to_string());
    } else if weights.iter().sum::<f64>() <= 0.0 {
        issues.push("relevance weights must not all be zero".to_string());
    }
    if !config.homepage_min_score.is_finite() || !(0.0..=1.0).contains(&config.homepage_min_score) {
        issues.push("homepage_min_score must be within [0, 1]".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(PolicyConfigError { issues })
    }
}

/// Load a policy file; `.json` is parsed as JSON, anything else as YAML.
pub fn load_policy_config(path: impl AsRef<Path>) -> Result<PolicyConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let config: PolicyConfig = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?,
        _ => serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?,
    };
    validate_policy_config(&config).with_context(|| format!("validating {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use reelgate_core::{BreakoutRequirements, ExternalRating, MediaStats, MediaType, ReadMode};
    use std::collections::BTreeMap;

    fn mk_item(countries: &[&str], language: Option<&str>) -> MediaSignals {
        MediaSignals {
            media_item_id: Uuid::new_v4(),
            media_type: MediaType::Movie,
            title: "Test Feature".into(),
            origin_countries: countries.iter().map(|c| c.to_string()).collect(),
            original_language: language.map(str::to_string),
            watch_providers: BTreeMap::from([("US".to_string(), vec![8])]),
            ratings: vec![ExternalRating {
                source: RatingSource::Imdb,
                rating: Some(7.1),
                votes: Some(5_000),
            }],
            stats: None,
            is_ready: true,
            is_deleted: false,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap(),
        }
    }

    fn ru_policy() -> PolicyConfig {
        PolicyConfig {
            allowed_countries: vec!["US".into(), "GB".into()],
            blocked_countries: vec!["RU".into()],
            allowed_languages: vec!["en".into()],
            global_providers: vec![8, 337],
            ..PolicyConfig::default()
        }
    }

    fn imdb_rule(id: &str, priority: i32, min_votes: i64) -> BreakoutRule {
        BreakoutRule {
            id: id.into(),
            name: format!("{id} rule"),
            priority,
            enabled: true,
            requirements: BreakoutRequirements {
                min_imdb_votes: Some(min_votes),
                ..BreakoutRequirements::default()
            },
        }
    }

    #[test]
    fn blocked_country_without_breakout_is_ineligible() {
        let result = evaluate_eligibility(&mk_item(&["RU"], Some("en")), &ru_policy()).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
        assert_eq!(result.reasons, vec![ReasonCode::BlockedCountry]);
        assert_eq!(result.breakout_rule_id, None);
    }

    #[test]
    fn satisfied_breakout_overrides_block() {
        let mut policy = ru_policy();
        policy.breakout_rules = vec![imdb_rule("imdb-1k", 10, 1_000)];
        let result = evaluate_eligibility(&mk_item(&["RU"], Some("en")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Eligible);
        assert!(result.reasons.contains(&ReasonCode::BlockedCountry));
        assert!(result.reasons.contains(&ReasonCode::BreakoutAllowed));
        assert_eq!(result.breakout_rule_id.as_deref(), Some("imdb-1k"));
    }

    #[test]
    fn highest_priority_satisfied_rule_wins() {
        let mut policy = ru_policy();
        policy.breakout_rules = vec![
            imdb_rule("low", 1, 10),
            imdb_rule("unmet", 50, 1_000_000),
            imdb_rule("high", 20, 100),
            imdb_rule("high-tie", 20, 100),
        ];
        let result = evaluate_eligibility(&mk_item(&["RU"], Some("en")), &policy).unwrap();
        assert_eq!(result.breakout_rule_id.as_deref(), Some("high"));
    }

    #[test]
    fn disabled_and_empty_rules_never_match() {
        let mut policy = ru_policy();
        let mut disabled = imdb_rule("disabled", 5, 1);
        disabled.enabled = false;
        let empty = BreakoutRule {
            id: "empty".into(),
            name: "Empty".into(),
            priority: 9,
            enabled: true,
            requirements: BreakoutRequirements::default(),
        };
        policy.breakout_rules = vec![disabled, empty];
        let result = evaluate_eligibility(&mk_item(&["RU"], Some("en")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
    }

    #[test]
    fn missing_origin_short_circuits_even_with_breakout() {
        let mut policy = ru_policy();
        policy.breakout_rules = vec![imdb_rule("imdb-1k", 10, 1_000)];
        let result = evaluate_eligibility(&mk_item(&[], Some("xx")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Pending);
        assert_eq!(
            result.reasons,
            vec![ReasonCode::MissingOriginCountry, ReasonCode::MissingOriginalLanguage]
        );
        assert!(result.breakout_rule_id.is_none());

        let result = evaluate_eligibility(&mk_item(&["US"], None), &policy).unwrap();
        assert_eq!(result.reasons, vec![ReasonCode::MissingOriginalLanguage]);
    }

    #[test]
    fn majority_mode_requires_strict_majority() {
        let mut policy = ru_policy();
        policy.blocked_country_mode = BlockedCountryMode::Majority;
        policy.blocked_countries = vec!["RU".into(), "BY".into()];

        let single = evaluate_eligibility(&mk_item(&["RU"], Some("en")), &policy).unwrap();
        assert_eq!(single.status, EvaluationStatus::Ineligible);

        let half = evaluate_eligibility(&mk_item(&["RU", "US"], Some("en")), &policy).unwrap();
        assert_eq!(half.status, EvaluationStatus::Eligible);
        assert_eq!(half.reasons, vec![ReasonCode::AllowedCountry, ReasonCode::AllowedLanguage]);

        let two_of_three = evaluate_eligibility(&mk_item(&["RU", "BY", "US"], Some("en")), &policy).unwrap();
        assert_eq!(two_of_three.reasons, vec![ReasonCode::BlockedCountry]);

        let neutral = evaluate_eligibility(&mk_item(&["RU", "FR"], Some("en")), &policy).unwrap();
        assert_eq!(neutral.reasons[0], ReasonCode::NeutralCountry);
    }

    #[test]
    fn any_mode_blocks_on_single_blocked_country() {
        let result = evaluate_eligibility(&mk_item(&["US", "RU", "GB"], Some("en")), &ru_policy()).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
    }

    #[test]
    fn blocked_language_is_reported() {
        let mut policy = ru_policy();
        policy.blocked_languages = vec!["ru".into()];
        let result = evaluate_eligibility(&mk_item(&["us"], Some("RU")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
        assert_eq!(result.reasons, vec![ReasonCode::BlockedLanguage]);
    }

    #[test]
    fn missing_global_signals_depends_on_mode() {
        let mut item = mk_item(&["US"], Some("en"));
        item.watch_providers.clear();
        item.ratings.clear();

        let relaxed = evaluate_eligibility(&item, &ru_policy()).unwrap();
        assert_eq!(relaxed.status, EvaluationStatus::Eligible);
        assert!(relaxed.reasons.contains(&ReasonCode::MissingGlobalSignals));

        let mut strict = ru_policy();
        strict.eligibility_mode = EligibilityMode::Strict;
        let result = evaluate_eligibility(&item, &strict).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
        assert_eq!(result.reasons, vec![ReasonCode::MissingGlobalSignals]);
    }

    #[test]
    fn strict_mode_sends_neutral_items_to_review() {
        let mut policy = ru_policy();
        policy.eligibility_mode = EligibilityMode::Strict;
        let result = evaluate_eligibility(&mk_item(&["FR"], Some("fr")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Review);
        assert_eq!(result.reasons, vec![ReasonCode::NeutralCountry, ReasonCode::NeutralLanguage]);

        policy.eligibility_mode = EligibilityMode::Relaxed;
        let result = evaluate_eligibility(&mk_item(&["FR"], Some("fr")), &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Eligible);
    }

    #[test]
    fn strict_neutral_item_without_signals_stays_out_of_freshness() {
        let mut policy = ru_policy();
        policy.eligibility_mode = EligibilityMode::Strict;
        let mut item = mk_item(&["FR"], Some("fr"));
        item.watch_providers.clear();
        item.ratings.clear();

        let result = evaluate_eligibility(&item, &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Ineligible);
        assert_eq!(
            result.reasons,
            vec![
                ReasonCode::NeutralCountry,
                ReasonCode::NeutralLanguage,
                ReasonCode::MissingGlobalSignals
            ]
        );
        let record = result.into_record(item.media_item_id, 1, 0.0, None, Utc::now());
        assert!(!ReadMode::Freshness.admits(&record, 0.0));
        assert!(!ReadMode::Catalog.admits(&record, 0.0));
    }

    #[test]
    fn out_of_range_stats_are_clamped_not_rejected() {
        let mut item = mk_item(&["US"], Some("en"));
        item.stats = Some(MediaStats {
            quality_score: Some(1.0),
            popularity_score: Some(3.5),
            freshness_score: Some(-0.2),
        });
        let result = evaluate_eligibility(&item, &ru_policy()).unwrap();
        assert_eq!(result.status, EvaluationStatus::Eligible);
        let score = relevance_score(&item, &ru_policy());
        assert!((score - 0.8).abs() < 1e-9);

        item.stats = Some(MediaStats {
            popularity_score: Some(f64::INFINITY),
            ..MediaStats::default()
        });
        assert!(evaluate_eligibility(&item, &ru_policy()).is_err());
    }

    #[test]
    fn provider_and_rating_source_requirements() {
        let mut policy = ru_policy();
        policy.breakout_rules = vec![BreakoutRule {
            id: "streaming".into(),
            name: "On a major streamer with TMDB rating".into(),
            priority: 1,
            enabled: true,
            requirements: BreakoutRequirements {
                any_of_providers: vec![337],
                any_rating_from: vec![RatingSource::Tmdb],
                ..BreakoutRequirements::default()
            },
        }];
        let mut item = mk_item(&["RU"], Some("ru"));
        assert_eq!(evaluate_eligibility(&item, &policy).unwrap().status, EvaluationStatus::Ineligible);

        item.watch_providers.insert("DE".into(), vec![337]);
        item.ratings.push(ExternalRating {
            source: RatingSource::Tmdb,
            rating: Some(6.4),
            votes: Some(12),
        });
        let result = evaluate_eligibility(&item, &policy).unwrap();
        assert_eq!(result.status, EvaluationStatus::Eligible);
        assert_eq!(result.breakout_rule_id.as_deref(), Some("streaming"));
    }

    #[test]
    fn malformed_signals_are_errors() {
        let mut item = mk_item(&["USA"], Some("en"));
        assert!(matches!(
            evaluate_eligibility(&item, &ru_policy()),
            Err(EvaluationError::MalformedSignals { .. })
        ));
        item.origin_countries = vec!["US".into()];
        item.stats = Some(MediaStats {
            quality_score: Some(f64::NAN),
            ..MediaStats::default()
        });
        assert!(evaluate_eligibility(&item, &ru_policy()).is_err());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let item = mk_item(&["RU", "US"], Some("en"));
        let policy = ru_policy();
        assert_eq!(
            evaluate_eligibility(&item, &policy).unwrap(),
            evaluate_eligibility(&item, &policy).unwrap()
        );
    }

    #[test]
    fn relevance_blends_present_components() {
        let policy = ru_policy();
        let mut item = mk_item(&["US"], Some("en"));
        assert_eq!(relevance_score(&item, &policy), 0.0);

        item.stats = Some(MediaStats {
            quality_score: Some(1.0),
            popularity_score: Some(0.5),
            freshness_score: None,
        });
        let score = relevance_score(&item, &policy);
        assert!((score - 0.65).abs() < 1e-9);

        item.stats = Some(MediaStats {
            quality_score: Some(1.0),
            popularity_score: Some(1.0),
            freshness_score: Some(1.0),
        });
        assert!((relevance_score(&item, &policy) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn validation_collects_every_issue() {
        let config = PolicyConfig {
            allowed_countries: vec!["RU".into(), "USA".into()],
            blocked_countries: vec!["ru".into()],
            homepage_min_score: 1.5,
            breakout_rules: vec![imdb_rule("dup", 1, 10), imdb_rule("dup", 2, -1)],
            ..PolicyConfig::default()
        };
        let err = validate_policy_config(&config).unwrap_err();
        assert_eq!(err.issues.len(), 5, "{:?}", err.issues);
        assert!(validate_policy_config(&ru_policy()).is_ok());
    }

    #[test]
    fn policy_files_load_from_yaml_and_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let yaml_path = dir.path().join("policy.yaml");
        fs::write(
            &yaml_path,
            "blocked_countries: [RU]\nblocked_country_mode: MAJORITY\nbreakout_rules:\n  - id: popular\n    name: Popular\n    priority: 10\n    requirements:\n      min_imdb_votes: 1000\n",
        )
        .unwrap();
        let config = load_policy_config(&yaml_path).expect("yaml policy");
        assert_eq!(config.blocked_country_mode, BlockedCountryMode::Majority);
        assert_eq!(config.breakout_rules[0].requirements.min_imdb_votes, Some(1000));

        let json_path = dir.path().join("policy.json");
        fs::write(&json_path, r#"{"allowed_countries": ["US", "XYZ"]}"#).unwrap();
        assert!(load_policy_config(&json_path).is_err());
    }
}
