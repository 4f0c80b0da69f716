//! Postgres-backed stores. Queries are built at runtime so the crate builds
//! without a live database.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reelgate_core::{
    normalize_run_status, CatalogEvaluationRun, CatalogPolicy, ErrorSampleEntry, EvaluationStatus,
    ExternalRating, MediaCatalogEvaluation, MediaSignals, MediaStats, MediaType, PolicyConfig,
    ReadMode, ReasonCode, RunCounters, RunStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    CatalogOrder, CatalogQuery, EvaluationQuery, EvaluationScope, EvaluationStore, MediaCatalog,
    PolicyStore, RunStore, RunTransition, StatusCounts, StoreError, StoreResult,
};

pub async fn connect_pool(database_url: &str, max_connections: u32) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .map_err(|err| StoreError::persistence("connect", "postgres", err))?;
    debug!(max_connections, "connected postgres pool");
    Ok(pool)
}

const POLICY_COLUMNS: &str = "id, version, is_active, policy_config, created_at, activated_at";

fn policy_from_row(row: &PgRow) -> Result<CatalogPolicy, sqlx::Error> {
    let Json(config): Json<PolicyConfig> = row.try_get("policy_config")?;
    Ok(CatalogPolicy {
        id: row.try_get("id")?,
        version: row.try_get("version")?,
        is_active: row.try_get("is_active")?,
        config,
        created_at: row.try_get("created_at")?,
        activated_at: row.try_get("activated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_one_where(&self, clause: &str, bind: PolicyKey) -> StoreResult<Option<CatalogPolicy>> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM catalog_policies WHERE {clause}");
        let query = sqlx::query(&sql);
        let query = match bind {
            PolicyKey::Id(id) => query.bind(id),
            PolicyKey::Version(version) => query.bind(version),
            PolicyKey::None => query,
        };
        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "catalog_policies", err))?;
        row.as_ref()
            .map(policy_from_row)
            .transpose()
            .map_err(|err| StoreError::persistence("decode", "catalog_policies", err))
    }
}

enum PolicyKey {
    Id(Uuid),
    Version(i32),
    None,
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn get_active(&self) -> StoreResult<Option<CatalogPolicy>> {
        self.fetch_one_where("is_active", PolicyKey::None).await
    }

    async fn create(&self, config: PolicyConfig) -> StoreResult<CatalogPolicy> {
        let sql = format!(
            "INSERT INTO catalog_policies (id, version, is_active, policy_config, created_at)
             SELECT $1, COALESCE(MAX(version), 0) + 1, FALSE, $2, NOW() FROM catalog_policies
             RETURNING {POLICY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(Uuid::new_v4())
            .bind(Json(&config))
            .fetch_one(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("insert", "catalog_policies", err))?;
        let policy = policy_from_row(&row)
            .map_err(|err| StoreError::persistence("decode", "catalog_policies", err))?;
        info!(policy_id = %policy.id, version = policy.version, "created catalog policy");
        Ok(policy)
    }

    async fn activate(&self, id: Uuid) -> StoreResult<CatalogPolicy> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::persistence("begin", "catalog_policies", err))?;

        sqlx::query("UPDATE catalog_policies SET is_active = FALSE, activated_at = NULL WHERE is_active AND id <> $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|err| StoreError::persistence("deactivate", "catalog_policies", err))?;

        let sql = format!(
            "UPDATE catalog_policies SET is_active = TRUE, activated_at = NOW() WHERE id = $1
             RETURNING {POLICY_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|err| StoreError::persistence("activate", "catalog_policies", err))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|err| StoreError::persistence("rollback", "catalog_policies", err))?;
            return Err(StoreError::not_found("policy", id));
        };
        let policy = policy_from_row(&row)
            .map_err(|err| StoreError::persistence("decode", "catalog_policies", err))?;
        tx.commit()
            .await
            .map_err(|err| StoreError::persistence("commit", "catalog_policies", err))?;
        info!(policy_id = %policy.id, version = policy.version, "activated catalog policy");
        Ok(policy)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<CatalogPolicy>> {
        self.fetch_one_where("id = $1", PolicyKey::Id(id)).await
    }

    async fn find_by_version(&self, version: i32) -> StoreResult<Option<CatalogPolicy>> {
        self.fetch_one_where("version = $1", PolicyKey::Version(version)).await
    }

    async fn list_all(&self) -> StoreResult<Vec<CatalogPolicy>> {
        let sql = format!("SELECT {POLICY_COLUMNS} FROM catalog_policies ORDER BY version DESC");
        let rows = sqlx::query(&sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "catalog_policies", err))?;
        rows.iter()
            .map(policy_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| StoreError::persistence("decode", "catalog_policies", err))
    }
}

const EVALUATION_COLUMNS: &str =
    "media_item_id, policy_version, status, reasons, relevance_score, breakout_rule_id, evaluated_at, run_id";

fn evaluation_from_row(row: &PgRow) -> StoreResult<MediaCatalogEvaluation> {
    let decode = |err| StoreError::persistence("decode", "media_catalog_evaluations", err);
    let status: String = row.try_get("status").map_err(decode)?;
    let reasons: Vec<String> = row.try_get("reasons").map_err(decode)?;
    let corrupt = |detail: String| StoreError::Corrupt {
        table: "media_catalog_evaluations",
        detail,
    };
    Ok(MediaCatalogEvaluation {
        media_item_id: row.try_get("media_item_id").map_err(decode)?,
        policy_version: row.try_get("policy_version").map_err(decode)?,
        status: status.parse().map_err(|err: reelgate_core::LabelError| corrupt(err.to_string()))?,
        reasons: reasons
            .iter()
            .map(|label| label.parse::<ReasonCode>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| corrupt(err.to_string()))?,
        relevance_score: row.try_get("relevance_score").map_err(decode)?,
        breakout_rule_id: row.try_get("breakout_rule_id").map_err(decode)?,
        evaluated_at: row.try_get("evaluated_at").map_err(decode)?,
        run_id: row.try_get("run_id").map_err(decode)?,
    })
}

fn reason_labels(reasons: &[ReasonCode]) -> Vec<String> {
    reasons.iter().map(|r| r.as_str().to_string()).collect()
}

#[derive(Debug, Clone)]
pub struct PgEvaluationStore {
    pool: PgPool,
}

impl PgEvaluationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const UPSERT_EVALUATION: &str = "INSERT INTO media_catalog_evaluations
    (media_item_id, policy_version, status, reasons, relevance_score, breakout_rule_id, evaluated_at, run_id)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    ON CONFLICT (media_item_id, policy_version) DO UPDATE SET
        status = EXCLUDED.status,
        reasons = EXCLUDED.reasons,
        relevance_score = EXCLUDED.relevance_score,
        breakout_rule_id = EXCLUDED.breakout_rule_id,
        evaluated_at = EXCLUDED.evaluated_at,
        run_id = EXCLUDED.run_id";

fn bind_evaluation<'q>(
    evaluation: &'q MediaCatalogEvaluation,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    sqlx::query(UPSERT_EVALUATION)
        .bind(evaluation.media_item_id)
        .bind(evaluation.policy_version)
        .bind(evaluation.status.as_str())
        .bind(reason_labels(&evaluation.reasons))
        .bind(evaluation.relevance_score)
        .bind(evaluation.breakout_rule_id.as_deref())
        .bind(evaluation.evaluated_at)
        .bind(evaluation.run_id)
}

#[async_trait]
impl EvaluationStore for PgEvaluationStore {
    async fn upsert(&self, evaluation: &MediaCatalogEvaluation) -> StoreResult<()> {
        bind_evaluation(evaluation)
            .execute(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("upsert", evaluation.media_item_id, err))?;
        Ok(())
    }

    async fn upsert_many(&self, evaluations: &[MediaCatalogEvaluation]) -> StoreResult<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| StoreError::persistence("begin", "media_catalog_evaluations", err))?;
        for evaluation in evaluations {
            bind_evaluation(evaluation)
                .execute(&mut *tx)
                .await
                .map_err(|err| StoreError::persistence("upsert", evaluation.media_item_id, err))?;
        }
        tx.commit()
            .await
            .map_err(|err| StoreError::persistence("commit", "media_catalog_evaluations", err))?;
        Ok(())
    }

    async fn get(&self, media_item_id: Uuid, policy_version: i32) -> StoreResult<Option<MediaCatalogEvaluation>> {
        let sql = format!(
            "SELECT {EVALUATION_COLUMNS} FROM media_catalog_evaluations
             WHERE media_item_id = $1 AND policy_version = $2"
        );
        let row = sqlx::query(&sql)
            .bind(media_item_id)
            .bind(policy_version)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", media_item_id, err))?;
        row.as_ref().map(evaluation_from_row).transpose()
    }

    async fn get_many(
        &self,
        media_item_ids: &[Uuid],
        policy_version: i32,
    ) -> StoreResult<HashMap<Uuid, MediaCatalogEvaluation>> {
        if media_item_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT {EVALUATION_COLUMNS} FROM media_catalog_evaluations
             WHERE policy_version = $1 AND media_item_id = ANY($2)"
        );
        let rows = sqlx::query(&sql)
            .bind(policy_version)
            .bind(media_item_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "media_catalog_evaluations", err))?;
        rows.iter()
            .map(|row| evaluation_from_row(row).map(|eval| (eval.media_item_id, eval)))
            .collect()
    }

    async fn evaluated_by_run(&self, run_id: Uuid, media_item_ids: &[Uuid]) -> StoreResult<HashSet<Uuid>> {
        if media_item_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            "SELECT media_item_id FROM media_catalog_evaluations
             WHERE run_id = $1 AND media_item_id = ANY($2)",
        )
        .bind(run_id)
        .bind(media_item_ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("select", run_id, err))?;
        rows.iter()
            .map(|row| row.try_get::<Uuid, _>("media_item_id"))
            .collect::<Result<HashSet<_>, _>>()
            .map_err(|err| StoreError::persistence("decode", "media_catalog_evaluations", err))
    }

    async fn count_by_status(&self, scope: EvaluationScope) -> StoreResult<StatusCounts> {
        let query = match scope {
            EvaluationScope::Run(run_id) => sqlx::query(
                "SELECT status, COUNT(*) AS n FROM media_catalog_evaluations WHERE run_id = $1 GROUP BY status",
            )
            .bind(run_id),
            EvaluationScope::PolicyVersion(version) => sqlx::query(
                "SELECT status, COUNT(*) AS n FROM media_catalog_evaluations WHERE policy_version = $1 GROUP BY status",
            )
            .bind(version),
        };
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("count", "media_catalog_evaluations", err))?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|err| StoreError::persistence("decode", "media_catalog_evaluations", err))?;
            let n: i64 = row
                .try_get("n")
                .map_err(|err| StoreError::persistence("decode", "media_catalog_evaluations", err))?;
            let status: EvaluationStatus = status.parse().map_err(|err: reelgate_core::LabelError| {
                StoreError::Corrupt {
                    table: "media_catalog_evaluations",
                    detail: err.to_string(),
                }
            })?;
            counts.insert(status, n);
        }
        Ok(counts)
    }

    async fn list(&self, query: &EvaluationQuery) -> StoreResult<Vec<MediaCatalogEvaluation>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "SELECT {EVALUATION_COLUMNS} FROM media_catalog_evaluations WHERE policy_version = "
        ));
        qb.push_bind(query.policy_version);

        match query.read_mode {
            Some(ReadMode::Catalog) => {
                qb.push(" AND status = 'eligible'");
            }
            Some(ReadMode::Freshness) => {
                qb.push(
                    " AND (status = 'eligible' OR (status = 'ineligible' \
                     AND reasons = ARRAY['MISSING_GLOBAL_SIGNALS']::text[]))",
                );
            }
            Some(ReadMode::Homepage) => {
                qb.push(" AND status = 'eligible' AND relevance_score >= ");
                qb.push_bind(query.homepage_min_score);
            }
            None => {}
        }
        if let Some(status) = query.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(reason) = query.reason {
            qb.push(" AND ").push_bind(reason.as_str()).push(" = ANY(reasons)");
        }
        if let Some(run_id) = query.run_id {
            qb.push(" AND run_id = ").push_bind(run_id);
        }
        if let Some(after) = query.after {
            qb.push(" AND media_item_id > ").push_bind(after);
        }
        qb.push(" ORDER BY media_item_id LIMIT ")
            .push_bind(query.limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("list", "media_catalog_evaluations", err))?;
        rows.iter().map(evaluation_from_row).collect()
    }
}

const ONE_RUNNING_INDEX: &str = "catalog_evaluation_runs_one_running_idx";

const RUN_COLUMNS: &str = "id, status, started_at, finished_at, batch_cursor, target_policy_id,
    target_policy_version, total_ready_snapshot, snapshot_cutoff, processed, eligible, ineligible,
    pending, review, errors, error_sample, promoted_at, promoted_by";

fn run_from_row(row: &PgRow) -> StoreResult<CatalogEvaluationRun> {
    let decode = |err| StoreError::persistence("decode", "catalog_evaluation_runs", err);
    let status: String = row.try_get("status").map_err(decode)?;
    // Older writers used other labels; they are folded here and nowhere else.
    let status = normalize_run_status(&status).map_err(|err| StoreError::Corrupt {
        table: "catalog_evaluation_runs",
        detail: err.to_string(),
    })?;
    let Json(error_sample): Json<Vec<ErrorSampleEntry>> = row.try_get("error_sample").map_err(decode)?;
    Ok(CatalogEvaluationRun {
        id: row.try_get("id").map_err(decode)?,
        status,
        started_at: row.try_get("started_at").map_err(decode)?,
        finished_at: row.try_get("finished_at").map_err(decode)?,
        cursor: row.try_get("batch_cursor").map_err(decode)?,
        target_policy_id: row.try_get("target_policy_id").map_err(decode)?,
        target_policy_version: row.try_get("target_policy_version").map_err(decode)?,
        total_ready_snapshot: row.try_get("total_ready_snapshot").map_err(decode)?,
        snapshot_cutoff: row.try_get("snapshot_cutoff").map_err(decode)?,
        counters: RunCounters {
            processed: row.try_get("processed").map_err(decode)?,
            eligible: row.try_get("eligible").map_err(decode)?,
            ineligible: row.try_get("ineligible").map_err(decode)?,
            pending: row.try_get("pending").map_err(decode)?,
            review: row.try_get("review").map_err(decode)?,
            errors: row.try_get("errors").map_err(decode)?,
        },
        error_sample,
        promoted_at: row.try_get("promoted_at").map_err(decode)?,
        promoted_by: row.try_get("promoted_by").map_err(decode)?,
    })
}

/// Every stored label that normalizes to one of `statuses`.
fn stored_labels(statuses: &[RunStatus]) -> Vec<String> {
    let mut labels = Vec::new();
    for status in statuses {
        labels.push(status.as_str().to_string());
        match status {
            RunStatus::Running => labels.push("pending".to_string()),
            RunStatus::Prepared => {
                labels.push("completed".to_string());
                labels.push("success".to_string());
            }
            _ => {}
        }
    }
    labels
}

#[derive(Debug, Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn create(&self, run: &CatalogEvaluationRun) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO catalog_evaluation_runs
             (id, status, started_at, batch_cursor, target_policy_id, target_policy_version,
              total_ready_snapshot, snapshot_cutoff, error_sample)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(run.id)
        .bind(run.status.as_str())
        .bind(run.started_at)
        .bind(run.cursor)
        .bind(run.target_policy_id)
        .bind(run.target_policy_version)
        .bind(run.total_ready_snapshot)
        .bind(run.snapshot_cutoff)
        .bind(Json(&run.error_sample))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            let one_running = err
                .as_database_error()
                .is_some_and(|db| db.is_unique_violation() && db.constraint() == Some(ONE_RUNNING_INDEX));
            if one_running {
                StoreError::RunningRunExists {
                    policy_version: run.target_policy_version,
                }
            } else {
                StoreError::persistence("insert", run.id, err)
            }
        })?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<CatalogEvaluationRun>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM catalog_evaluation_runs WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", id, err))?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_recent(&self, limit: usize) -> StoreResult<Vec<CatalogEvaluationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM catalog_evaluation_runs ORDER BY started_at DESC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "catalog_evaluation_runs", err))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_running(&self, started_before: Option<DateTime<Utc>>) -> StoreResult<Vec<CatalogEvaluationRun>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM catalog_evaluation_runs
             WHERE status = ANY($1) AND ($2::timestamptz IS NULL OR started_at < $2)
             ORDER BY started_at"
        );
        let rows = sqlx::query(&sql)
            .bind(stored_labels(&[RunStatus::Running]))
            .bind(started_before)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "catalog_evaluation_runs", err))?;
        rows.iter().map(run_from_row).collect()
    }

    async fn advance_cursor(&self, id: Uuid, expected: Option<Uuid>, next: Option<Uuid>) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE catalog_evaluation_runs SET batch_cursor = $3
             WHERE id = $1 AND batch_cursor IS NOT DISTINCT FROM $2",
        )
        .bind(id)
        .bind(expected)
        .bind(next)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("advance_cursor", id, err))?;
        Ok(result.rows_affected() == 1)
    }

    async fn write_counters(&self, id: Uuid, counters: &RunCounters) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE catalog_evaluation_runs
             SET processed = $2, eligible = $3, ineligible = $4, pending = $5, review = $6, errors = $7
             WHERE id = $1",
        )
        .bind(id)
        .bind(counters.processed)
        .bind(counters.eligible)
        .bind(counters.ineligible)
        .bind(counters.pending)
        .bind(counters.review)
        .bind(counters.errors)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("write_counters", id, err))?;
        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("run", id));
        }
        Ok(())
    }

    async fn append_error(&self, id: Uuid, entry: ErrorSampleEntry, limit: usize) -> StoreResult<()> {
        sqlx::query(
            "UPDATE catalog_evaluation_runs
             SET error_sample = CASE
                 WHEN jsonb_array_length(error_sample) < $3 THEN error_sample || jsonb_build_array($2::jsonb)
                 ELSE error_sample
             END
             WHERE id = $1",
        )
        .bind(id)
        .bind(Json(&entry))
        .bind(limit as i64)
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("append_error", id, err))?;
        Ok(())
    }

    async fn transition(&self, id: Uuid, from: &[RunStatus], transition: RunTransition) -> StoreResult<bool> {
        let counters = transition.counters;
        let result = sqlx::query(
            "UPDATE catalog_evaluation_runs SET
                 status = $2,
                 finished_at = CASE WHEN $2 IN ('running', 'promoted') THEN finished_at ELSE $3 END,
                 promoted_at = CASE WHEN $2 = 'promoted' THEN $3 ELSE promoted_at END,
                 promoted_by = CASE WHEN $2 = 'promoted' THEN $4 ELSE promoted_by END,
                 processed = COALESCE($5, processed),
                 eligible = COALESCE($6, eligible),
                 ineligible = COALESCE($7, ineligible),
                 pending = COALESCE($8, pending),
                 review = COALESCE($9, review),
                 errors = COALESCE($10, errors)
             WHERE id = $1 AND status = ANY($11)",
        )
        .bind(id)
        .bind(transition.to.as_str())
        .bind(transition.at)
        .bind(transition.promoted_by.as_deref())
        .bind(counters.map(|c| c.processed))
        .bind(counters.map(|c| c.eligible))
        .bind(counters.map(|c| c.ineligible))
        .bind(counters.map(|c| c.pending))
        .bind(counters.map(|c| c.review))
        .bind(counters.map(|c| c.errors))
        .bind(stored_labels(from))
        .execute(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("transition", id, err))?;
        let moved = result.rows_affected() == 1;
        debug!(run_id = %id, to = %transition.to, moved, "guarded run transition");
        Ok(moved)
    }
}

const SIGNAL_COLUMNS: &str = "media_item_id, media_type, title, origin_countries, original_language,
    watch_providers, ratings, quality_score, popularity_score, freshness_score, is_ready, is_deleted, created_at";

fn signals_from_row(row: &PgRow) -> StoreResult<MediaSignals> {
    let decode = |err| StoreError::persistence("decode", "catalog_media_signals", err);
    let media_type: String = row.try_get("media_type").map_err(decode)?;
    let media_type: MediaType = media_type.parse().map_err(|err: reelgate_core::LabelError| {
        StoreError::Corrupt {
            table: "catalog_media_signals",
            detail: err.to_string(),
        }
    })?;
    let Json(watch_providers): Json<BTreeMap<String, Vec<i32>>> =
        row.try_get("watch_providers").map_err(decode)?;
    let Json(ratings): Json<Vec<ExternalRating>> = row.try_get("ratings").map_err(decode)?;
    let stats = MediaStats {
        quality_score: row.try_get("quality_score").map_err(decode)?,
        popularity_score: row.try_get("popularity_score").map_err(decode)?,
        freshness_score: row.try_get("freshness_score").map_err(decode)?,
    };
    Ok(MediaSignals {
        media_item_id: row.try_get("media_item_id").map_err(decode)?,
        media_type,
        title: row.try_get("title").map_err(decode)?,
        origin_countries: row.try_get("origin_countries").map_err(decode)?,
        original_language: row.try_get("original_language").map_err(decode)?,
        watch_providers,
        ratings,
        stats: (!stats.is_empty()).then_some(stats),
        is_ready: row.try_get("is_ready").map_err(decode)?,
        is_deleted: row.try_get("is_deleted").map_err(decode)?,
        created_at: row.try_get("created_at").map_err(decode)?,
    })
}

/// Read-only view over the ingestion-owned `catalog_media_signals` table.
#[derive(Debug, Clone)]
pub struct PgMediaCatalog {
    pool: PgPool,
}

impl PgMediaCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MediaCatalog for PgMediaCatalog {
    async fn count_evaluable(&self, cutoff: DateTime<Utc>) -> StoreResult<i64> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM catalog_media_signals
             WHERE is_ready AND NOT is_deleted AND created_at <= $1",
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| StoreError::persistence("count", "catalog_media_signals", err))
    }

    async fn fetch_page(&self, query: &CatalogQuery) -> StoreResult<Vec<MediaSignals>> {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {SIGNAL_COLUMNS} FROM catalog_media_signals WHERE TRUE"));
        if !query.include_unready {
            qb.push(" AND is_ready AND NOT is_deleted");
        }
        if let Some(cutoff) = query.cutoff {
            qb.push(" AND created_at <= ").push_bind(cutoff);
        }
        if let Some(media_type) = query.media_type {
            qb.push(" AND media_type = ").push_bind(media_type.as_str());
        }
        if let Some(country) = &query.origin_country {
            qb.push(" AND EXISTS (SELECT 1 FROM unnest(origin_countries) AS c WHERE upper(trim(c)) = upper(")
                .push_bind(country.trim().to_string())
                .push("))");
        }
        match query.order {
            CatalogOrder::IdAsc => {
                if let Some(after) = query.after {
                    qb.push(" AND media_item_id > ").push_bind(after);
                }
                qb.push(" ORDER BY media_item_id");
            }
            CatalogOrder::PopularityDesc => {
                qb.push(" ORDER BY popularity_score DESC NULLS LAST, media_item_id");
            }
        }
        qb.push(" LIMIT ").push_bind(query.limit as i64);

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|err| StoreError::persistence("select", "catalog_media_signals", err))?;
        rows.iter().map(signals_from_row).collect()
    }
}
