//! JSON admin API over the catalog policy engine.

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use reelgate_core::{CatalogEvaluationRun, CatalogPolicy, MediaCatalogEvaluation, PolicyConfig, ReadMode, RunCounters};
use reelgate_sync::{
    BatchOutcome, CatalogEngine, DryRunRequest, EngineConfig, EngineError, FinalizeOutcome, ItemPage,
    ItemReviewQuery, PreviewReport, SweepReport,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "reelgate-web";

#[derive(Clone)]
pub struct AppState {
    pub engine: CatalogEngine,
}

impl AppState {
    pub fn new(engine: CatalogEngine) -> Self {
        Self { engine }
    }
}

/// Engine errors rendered as `{"error": ..., "kind": ...}` with a matching status.
#[derive(Debug)]
pub struct ApiError(EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            EngineError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            EngineError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            EngineError::RunAlreadyActive { .. } => (StatusCode::CONFLICT, "run_already_active"),
            EngineError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (
            status,
            Json(serde_json::json!({ "error": self.0.to_string(), "kind": kind })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct StartRunBody {
    policy_id: Uuid,
}

#[derive(Debug, Deserialize)]
struct PromoteBody {
    promoted_by: String,
}

#[derive(Debug, Deserialize)]
struct CancelBody {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RunsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct CatalogQueryParams {
    #[serde(default)]
    mode: ReadMode,
    after: Option<Uuid>,
    limit: Option<usize>,
}

#[derive(Debug, Serialize)]
struct RunView {
    #[serde(flatten)]
    run: CatalogEvaluationRun,
    /// Recomputed from evaluation rows; the cached columns may lag.
    live_counters: RunCounters,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/policies", get(list_policies_handler).post(create_policy_handler))
        .route("/policies/active", get(active_policy_handler))
        .route("/policies/{id}/activate", post(activate_policy_handler))
        .route("/runs", get(list_runs_handler).post(start_run_handler))
        .route("/runs/sweep", post(sweep_handler))
        .route("/runs/{id}", get(get_run_handler))
        .route("/runs/{id}/batches", post(process_batch_handler))
        .route("/runs/{id}/finalize", post(finalize_run_handler))
        .route("/runs/{id}/promote", post(promote_run_handler))
        .route("/runs/{id}/cancel", post(cancel_run_handler))
        .route("/dry-run", post(dry_run_handler))
        .route("/items", get(items_handler))
        .route("/catalog", get(catalog_handler))
        .with_state(state)
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = EngineConfig::from_env();
    let port = config.web_port;
    let engine = CatalogEngine::connect(config).await?;
    serve(engine, port).await
}

pub async fn serve(engine: CatalogEngine, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "admin api listening");
    axum::serve(listener, app(AppState::new(engine))).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok", "service": CRATE_NAME }))
}

async fn list_policies_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<CatalogPolicy>>> {
    Ok(Json(state.engine.list_policies().await?))
}

async fn create_policy_handler(
    State(state): State<AppState>,
    Json(config): Json<PolicyConfig>,
) -> ApiResult<(StatusCode, Json<CatalogPolicy>)> {
    let policy = state.engine.create_policy(config).await?;
    Ok((StatusCode::CREATED, Json(policy)))
}

async fn active_policy_handler(State(state): State<AppState>) -> ApiResult<Json<CatalogPolicy>> {
    state
        .engine
        .active_policy()
        .await?
        .map(Json)
        .ok_or_else(|| EngineError::not_found("active policy", "none").into())
}

async fn activate_policy_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<CatalogPolicy>> {
    Ok(Json(state.engine.activate_policy(id).await?))
}

async fn list_runs_handler(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Json<Vec<CatalogEvaluationRun>>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    Ok(Json(state.engine.list_runs(limit).await?))
}

async fn start_run_handler(
    State(state): State<AppState>,
    Json(body): Json<StartRunBody>,
) -> ApiResult<(StatusCode, Json<CatalogEvaluationRun>)> {
    let run = state.engine.start_run(body.policy_id).await?;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run_handler(State(state): State<AppState>, AxumPath(id): AxumPath<Uuid>) -> ApiResult<Json<RunView>> {
    let run = state.engine.get_run(id).await?;
    let live_counters = state.engine.aggregate_run(id).await?;
    Ok(Json(RunView { run, live_counters }))
}

async fn process_batch_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<BatchOutcome>> {
    Ok(Json(state.engine.process_batch(id).await?))
}

async fn finalize_run_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
) -> ApiResult<Json<FinalizeOutcome>> {
    Ok(Json(state.engine.finalize_run(id).await?))
}

async fn promote_run_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<PromoteBody>,
) -> ApiResult<Json<CatalogEvaluationRun>> {
    if body.promoted_by.trim().is_empty() {
        return Err(EngineError::Validation("promoted_by must not be blank".into()).into());
    }
    Ok(Json(state.engine.promote_run(id, body.promoted_by.trim()).await?))
}

async fn cancel_run_handler(
    State(state): State<AppState>,
    AxumPath(id): AxumPath<Uuid>,
    Json(body): Json<CancelBody>,
) -> ApiResult<Json<CatalogEvaluationRun>> {
    let reason = body.reason.unwrap_or_else(|| "cancelled via admin api".to_string());
    Ok(Json(state.engine.cancel_run(id, &reason).await?))
}

async fn sweep_handler(State(state): State<AppState>) -> ApiResult<Json<SweepReport>> {
    Ok(Json(state.engine.sweep().await?))
}

async fn dry_run_handler(
    State(state): State<AppState>,
    Json(request): Json<DryRunRequest>,
) -> ApiResult<Json<PreviewReport>> {
    Ok(Json(state.engine.dry_run(request).await?))
}

async fn items_handler(
    State(state): State<AppState>,
    Query(query): Query<ItemReviewQuery>,
) -> ApiResult<Json<ItemPage>> {
    Ok(Json(state.engine.list_items(&query).await?))
}

async fn catalog_handler(
    State(state): State<AppState>,
    Query(query): Query<CatalogQueryParams>,
) -> ApiResult<Json<Vec<MediaCatalogEvaluation>>> {
    let limit = query.limit.unwrap_or(50);
    Ok(Json(state.engine.visible_items(query.mode, query.after, limit).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request};
    use chrono::{Duration as ChronoDuration, Utc};
    use http_body_util::BodyExt;
    use reelgate_core::{ExternalRating, MediaSignals, MediaStats, MediaType, RatingSource};
    use reelgate_storage::InMemoryCatalog;
    use reelgate_sync::EngineStores;
    use tower::ServiceExt;

    fn signals(n: u128, country: &str) -> MediaSignals {
        MediaSignals {
            media_item_id: Uuid::from_u128(n),
            media_type: MediaType::Movie,
            title: format!("Film {n}"),
            origin_countries: vec![country.to_string()],
            original_language: Some("en".to_string()),
            watch_providers: BTreeMap::from([("US".to_string(), vec![8])]),
            ratings: vec![ExternalRating {
                source: RatingSource::Imdb,
                rating: Some(6.5),
                votes: Some(500),
            }],
            stats: Some(MediaStats {
                quality_score: Some(0.6),
                popularity_score: Some(0.4),
                freshness_score: Some(0.2),
            }),
            is_ready: true,
            is_deleted: false,
            created_at: Utc::now() - ChronoDuration::hours(2),
        }
    }

    async fn test_app() -> Router {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog
            .extend((1..=6u128).map(|n| signals(n, if n == 6 { "RU" } else { "US" })))
            .await;
        let engine = CatalogEngine::new(EngineStores::in_memory(catalog), EngineConfig::default());
        app(AppState::new(engine))
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, json)
    }

    #[tokio::test]
    async fn handler_smoke_healthz() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn invalid_policy_is_unprocessable() {
        let app = test_app().await;
        let (status, body) = send(
            &app,
            "POST",
            "/policies",
            Some(serde_json::json!({ "allowed_countries": ["USA"] })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["kind"], "validation");
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let app = test_app().await;
        let (status, body) = send(&app, "GET", &format!("/runs/{}", Uuid::new_v4()), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "not_found");

        let (status, _) = send(&app, "GET", "/policies/active", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn full_run_lifecycle_over_http() {
        let app = test_app().await;
        let (status, policy) = send(
            &app,
            "POST",
            "/policies",
            Some(serde_json::json!({ "blocked_countries": ["RU"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(policy["version"], 1);

        let (status, run) = send(
            &app,
            "POST",
            "/runs",
            Some(serde_json::json!({ "policy_id": policy["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let run_id = run["id"].as_str().unwrap().to_string();

        let (status, _) = send(
            &app,
            "POST",
            "/runs",
            Some(serde_json::json!({ "policy_id": policy["id"] })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = send(
            &app,
            "POST",
            &format!("/runs/{run_id}/promote"),
            Some(serde_json::json!({ "promoted_by": "ops" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, batch) = send(&app, "POST", &format!("/runs/{run_id}/batches"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(batch["outcome"], "processed");
        assert_eq!(batch["evaluated"], 6);

        let (_, batch) = send(&app, "POST", &format!("/runs/{run_id}/batches"), None).await;
        assert_eq!(batch["outcome"], "exhausted");

        let (status, finalized) = send(&app, "POST", &format!("/runs/{run_id}/finalize"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(finalized["outcome"], "prepared");

        let (status, promoted) = send(
            &app,
            "POST",
            &format!("/runs/{run_id}/promote"),
            Some(serde_json::json!({ "promoted_by": "ops" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(promoted["status"], "promoted");

        let (_, view) = send(&app, "GET", &format!("/runs/{run_id}"), None).await;
        assert_eq!(view["live_counters"]["processed"], 6);
        assert_eq!(view["live_counters"]["ineligible"], 1);

        let (status, visible) = send(&app, "GET", "/catalog?mode=catalog&limit=10", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(visible.as_array().unwrap().len(), 5);

        let (status, items) = send(&app, "GET", "/items?status=ineligible", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(items["items"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dry_run_reports_without_touching_runs() {
        let app = test_app().await;
        let (status, report) = send(
            &app,
            "POST",
            "/dry-run",
            Some(serde_json::json!({
                "config": { "blocked_countries": ["RU"] },
                "mode": "top",
                "limit": 3
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report["summary"]["evaluated"], 3);

        let (_, runs) = send(&app, "GET", "/runs", None).await;
        assert!(runs.as_array().unwrap().is_empty());
    }
}
