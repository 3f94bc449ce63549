use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use crate::coordinator::{CompletionSignal, EngineEvent, EngineHandle, Outcome, SignalOrigin};
use crate::errors::SubmitError;
use crate::graph;
use crate::store::{DbHandle, NewPhase};

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub engine: EngineHandle,
    pub default_max_attempts: u32,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SubmitRunRequest {
    pub issue_ref: String,
    pub phases: Vec<SubmitPhase>,
}

#[derive(Deserialize)]
pub struct SubmitPhase {
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Row ids of phases from earlier runs (cross-run chaining).
    #[serde(default)]
    pub external_deps: Vec<i64>,
    /// Opaque versioned blob handed to the agent unmodified.
    #[serde(default)]
    pub payload: serde_json::Value,
    pub max_attempts: Option<u32>,
}

#[derive(Deserialize)]
pub struct CompletionRequest {
    pub outcome: Outcome,
    #[serde(default)]
    pub detail: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<crate::errors::StoreError> for ApiError {
    fn from(e: crate::errors::StoreError) -> Self {
        ApiError::Internal(e.to_string())
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/runs", get(list_runs).post(submit_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/phases/{id}", get(get_phase))
        .route("/api/phases/{id}/complete", post(complete_phase))
        .route("/api/phases/{id}/retry", post(retry_phase))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

/// Accept a workflow run. The dependency graph is validated wholesale
/// before anything is persisted; a rejected submission leaves no rows
/// behind. Returns immediately — execution is the coordinator's business.
async fn submit_run(
    State(state): State<SharedState>,
    Json(req): Json<SubmitRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let phases: Vec<NewPhase> = req
        .phases
        .into_iter()
        .map(|p| NewPhase {
            name: p.name,
            depends_on: p.depends_on,
            external_deps: p.external_deps,
            payload: p.payload,
            max_attempts: p.max_attempts.unwrap_or(state.default_max_attempts),
        })
        .collect();

    graph::validate(&phases).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let external: Vec<i64> = phases
        .iter()
        .flat_map(|p| p.external_deps.iter().copied())
        .collect();
    if !external.is_empty() {
        let missing = state
            .db
            .call(move |store| store.phases_exist(&external))
            .await?;
        if let Some(id) = missing {
            return Err(ApiError::BadRequest(
                SubmitError::UnknownExternalDependency(id).to_string(),
            ));
        }
    }

    let issue_ref = req.issue_ref;
    let detail = state
        .db
        .call(move |store| store.insert_run(&issue_ref, &phases))
        .await?;

    state.engine.wake();
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn list_runs(State(state): State<SharedState>) -> Result<impl IntoResponse, ApiError> {
    let runs = state.db.call(|store| store.list_runs()).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .db
        .call(move |store| store.get_run_detail(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    Ok(Json(detail))
}

async fn get_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = state
        .db
        .call(move |store| store.get_phase(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Phase {} not found", id)))?;
    Ok(Json(phase))
}

/// Completion callback from the execution agent (or its wrapper).
/// Idempotent per phase id: a duplicate or late signal is accepted and
/// ignored by the engine.
async fn complete_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
    Json(req): Json<CompletionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |store| store.get_phase(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Phase {} not found", id)))?;

    let delivered = state
        .engine
        .send(EngineEvent::Completion(CompletionSignal {
            phase_id: id,
            outcome: req.outcome,
            detail: req.detail,
            origin: SignalOrigin::Callback,
        }))
        .await;
    if !delivered {
        return Err(ApiError::Internal("engine is shutting down".to_string()));
    }
    Ok(Json(serde_json::json!({"accepted": true})))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state
        .db
        .call(move |store| store.get_run(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Run {} not found", id)))?;
    if run.status.is_terminal() {
        return Err(ApiError::Conflict(format!(
            "Run {} is already {}",
            id, run.status
        )));
    }

    let delivered = state.engine.send(EngineEvent::CancelRun { run_id: id }).await;
    if !delivered {
        return Err(ApiError::Internal("engine is shutting down".to_string()));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "cancelling"})),
    ))
}

async fn retry_phase(
    State(state): State<SharedState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let phase = state
        .db
        .call(move |store| store.get_phase(id))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Phase {} not found", id)))?;
    if phase.status != crate::store::PhaseStatus::Failed {
        return Err(ApiError::Conflict(format!(
            "Phase {} is {}, only failed phases can be retried",
            id, phase.status
        )));
    }
    if !phase.attempts_remaining() {
        return Err(ApiError::Conflict(format!(
            "Phase {} has exhausted its {} attempts",
            id, phase.max_attempts
        )));
    }

    let delivered = state.engine.send(EngineEvent::RetryPhase { phase_id: id }).await;
    if !delivered {
        return Err(ApiError::Internal("engine is shutting down".to_string()));
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"status": "retrying"})),
    ))
}
