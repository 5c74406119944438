//! HTTP+JSON binding of the engine.
//!
//! Per-model failures always come back inside a 200 envelope; a non-2xx
//! status means the call as a whole could not be dispatched.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ModelPreset;
use crate::engine::{
    Engine, EngineError, Envelope, GenerationConfig, LedgerError, ModelId, ResultItem, Run, RunId,
    RunMode,
};

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub start_time: Instant,
}

type AppStateArc = Arc<AppState>;

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code,
            message: message.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            e if e.is_invalid_request() => StatusCode::BAD_REQUEST,
            EngineError::RunNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!(error = %err, "request failed");
        }
        Self {
            status,
            code: err.code(),
            message: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request("invalid_request", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn require_prompt(prompt: &str) -> Result<(), ApiError> {
    if prompt.trim().is_empty() {
        return Err(EngineError::invalid("prompt must not be empty").into());
    }
    Ok(())
}

/// A request names either explicit model ids or a preset.
fn panel_models(model_ids: Vec<ModelId>, preset: Option<ModelPreset>) -> Result<Vec<ModelId>, ApiError> {
    match preset {
        Some(_) if !model_ids.is_empty() => Err(ApiError::bad_request(
            "invalid_request",
            "give either modelIds or preset, not both",
        )),
        Some(preset) => Ok(preset.models()),
        None => Ok(model_ids),
    }
}

fn parse_mode(mode: &str) -> Result<RunMode, ApiError> {
    mode.parse()
        .map_err(|e: LedgerError| ApiError::bad_request("invalid_request", e.to_string()))
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryRequest {
    #[serde(default)]
    pub model_ids: Vec<ModelId>,
    #[serde(default)]
    pub preset: Option<ModelPreset>,
    pub prompt: String,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeMultiRequest {
    pub judge_model_ids: Vec<ModelId>,
    pub prompt: String,
    pub primary_outputs: Vec<ResultItem>,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JudgeSingleRequest {
    pub evaluator_model_id: ModelId,
    pub prompt: String,
    pub primary_outputs: Vec<ResultItem>,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestrateRequest {
    pub orchestrator_model_id: ModelId,
    pub prompt: String,
    pub outputs: Vec<ResultItem>,
    #[serde(default)]
    pub orchestration_prompt: Option<String>,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitRunRequest {
    #[serde(default)]
    pub mode: Option<RunMode>,
    #[serde(default)]
    pub model_ids: Vec<ModelId>,
    #[serde(default)]
    pub preset: Option<ModelPreset>,
    pub prompt: String,
    #[serde(default)]
    pub config: GenerationConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJudgeMultiRequest {
    pub judge_model_ids: Vec<ModelId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJudgeSingleRequest {
    pub evaluator_model_id: ModelId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOrchestrateRequest {
    pub orchestrator_model_id: ModelId,
    #[serde(default)]
    pub orchestration_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ContinueRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub models: usize,
}

// =============================================================================
// Router
// =============================================================================

pub fn router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState {
        engine,
        start_time: Instant::now(),
    });

    Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/primary", post(primary))
        .route("/judge/multi", post(judge_multi))
        .route("/judge/single", post(judge_single))
        .route("/orchestrate", post(orchestrate))
        .route("/runs", post(submit_run))
        .route("/runs/:mode", get(list_runs).delete(clear_runs))
        .route("/run/:id", get(get_run))
        .route("/run/:id/judge/multi", post(run_judge_multi))
        .route("/run/:id/judge/single", post(run_judge_single))
        .route("/run/:id/orchestrate", post(run_orchestrate))
        .route("/run/:id/continue", post(run_continue))
        .route("/run/:id/cancel", post(run_cancel))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Bind and serve until the process is stopped.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(engine)).await
}

// =============================================================================
// Handlers
// =============================================================================

async fn health(State(state): State<AppStateArc>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        models: state.engine.registry().model_ids().len(),
    })
}

async fn list_models(State(state): State<AppStateArc>) -> Json<Vec<ModelId>> {
    Json(state.engine.registry().model_ids().to_vec())
}

async fn primary(
    State(state): State<AppStateArc>,
    payload: Result<Json<PrimaryRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    require_prompt(&req.prompt)?;
    let model_ids = panel_models(req.model_ids, req.preset)?;
    let envelope = state.engine.primary(&model_ids, &req.prompt, &req.config).await?;
    Ok(Json(envelope))
}

async fn judge_multi(
    State(state): State<AppStateArc>,
    payload: Result<Json<JudgeMultiRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    require_prompt(&req.prompt)?;
    let envelope = state
        .engine
        .judge_outputs_multi(&req.judge_model_ids, &req.prompt, &req.primary_outputs, &req.config)
        .await?;
    Ok(Json(envelope))
}

async fn judge_single(
    State(state): State<AppStateArc>,
    payload: Result<Json<JudgeSingleRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    require_prompt(&req.prompt)?;
    let envelope = state
        .engine
        .judge_outputs_single(&req.evaluator_model_id, &req.prompt, &req.primary_outputs, &req.config)
        .await?;
    Ok(Json(envelope))
}

async fn orchestrate(
    State(state): State<AppStateArc>,
    payload: Result<Json<OrchestrateRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    require_prompt(&req.prompt)?;
    let synthesis = state
        .engine
        .orchestrate_outputs(
            &req.orchestrator_model_id,
            &req.prompt,
            &req.outputs,
            req.orchestration_prompt.as_deref(),
            &req.config,
        )
        .await?;
    Ok(Json(synthesis.envelope))
}

/// Record the run and answer 202 with its placeholders; the primary phase
/// runs in the background so the caller can poll or cancel it by id.
async fn submit_run(
    State(state): State<AppStateArc>,
    payload: Result<Json<SubmitRunRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Run>), ApiError> {
    let Json(req) = payload?;
    let mode = req.mode.unwrap_or(RunMode::Compare);
    let model_ids = panel_models(req.model_ids, req.preset)?;
    if mode == RunMode::Chat && model_ids.len() != 1 {
        return Err(ApiError::bad_request(
            "invalid_request",
            "chat runs take exactly one model id",
        ));
    }
    let id = state.engine.submit(mode, model_ids, req.prompt, req.config)?;
    let run = state.engine.get_run(id)?;

    let engine = Arc::clone(&state.engine);
    tokio::spawn(async move {
        if let Err(err) = engine.run_primary(id).await {
            warn!(run_id = %id, error = %err, "primary phase failed");
        }
    });
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn list_runs(State(state): State<AppStateArc>, Path(mode): Path<String>) -> ApiResult<Vec<Run>> {
    let mode = parse_mode(&mode)?;
    Ok(Json(state.engine.list(mode)?))
}

async fn clear_runs(
    State(state): State<AppStateArc>,
    Path(mode): Path<String>,
) -> ApiResult<serde_json::Value> {
    let mode = parse_mode(&mode)?;
    let removed = state.engine.clear(mode)?;
    Ok(Json(json!({ "mode": mode, "removed": removed })))
}

async fn get_run(State(state): State<AppStateArc>, Path(id): Path<RunId>) -> ApiResult<Run> {
    Ok(Json(state.engine.get_run(id)?))
}

async fn run_judge_multi(
    State(state): State<AppStateArc>,
    Path(id): Path<RunId>,
    payload: Result<Json<RunJudgeMultiRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    Ok(Json(state.engine.evaluate_multi(id, req.judge_model_ids).await?))
}

async fn run_judge_single(
    State(state): State<AppStateArc>,
    Path(id): Path<RunId>,
    payload: Result<Json<RunJudgeSingleRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    Ok(Json(state.engine.evaluate_single(id, req.evaluator_model_id).await?))
}

async fn run_orchestrate(
    State(state): State<AppStateArc>,
    Path(id): Path<RunId>,
    payload: Result<Json<RunOrchestrateRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    let envelope = state
        .engine
        .orchestrate(id, req.orchestrator_model_id, req.orchestration_prompt)
        .await?;
    Ok(Json(envelope))
}

async fn run_continue(
    State(state): State<AppStateArc>,
    Path(id): Path<RunId>,
    payload: Result<Json<ContinueRequest>, JsonRejection>,
) -> ApiResult<Envelope> {
    let Json(req) = payload?;
    Ok(Json(state.engine.continue_thread(id, &req.message).await?))
}

async fn run_cancel(State(state): State<AppStateArc>, Path(id): Path<RunId>) -> ApiResult<serde_json::Value> {
    let cancelled = state.engine.cancel(id)?;
    Ok(Json(json!({ "id": id, "cancelled": cancelled })))
}
