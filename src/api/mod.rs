//! REST API — producer and worker surface over the engine.
//!
//! The claim endpoints are the authoritative path; the WebSocket stream in
//! `fanout::ws` is advisory only.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatchConfig;
use crate::error::{RegistryError, TaskError};
use crate::fanout::{StreamManager, advertise_task};
use crate::reaper::ReaperTelemetry;
use crate::registry::{WorkerRegistration, WorkerRegistry};
use crate::store::TaskStore;
use crate::tasks::model::{NewTask, Task, TaskRelease, TaskStatus};

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TaskStore>,
    pub registry: Arc<WorkerRegistry>,
    pub streams: Arc<StreamManager>,
    pub reaper: Arc<ReaperTelemetry>,
    pub config: DispatchConfig,
}

/// Build the Axum router for the REST surface.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/tasks", post(create_task).get(list_tasks))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/tasks/{id}/cancel", post(cancel_task))
        .route("/api/tasks/{id}/progress", post(task_progress))
        .route("/api/tasks/{id}/release", post(release_task))
        .route("/api/workers/register", post(register_worker))
        .route("/api/workers/{id}/heartbeat", post(worker_heartbeat))
        .route("/api/workers/{id}/scopes", post(update_worker_scopes))
        .route("/api/workers/{id}/claim", post(claim_next))
        .route("/api/workers/{id}/claim/{task_id}", post(claim_task))
        .route("/api/reaper", get(reaper_status))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connected_workers": state.streams.connected_count().await,
    }))
}

// ── Task endpoints ──────────────────────────────────────────────────

async fn create_task(
    State(state): State<AppState>,
    Json(request): Json<NewTask>,
) -> impl IntoResponse {
    let task = Task::from_request(request, state.config.default_max_attempts);

    if let Err(e) = state.store.create_task(&task).await {
        warn!(error = %e, "Task creation failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": e.to_string()})),
        );
    }

    info!(task_id = %task.id, scope = %task.scope, priority = task.priority, "Task submitted");
    advertise_task(&task, &state.registry, &state.streams, &state.store).await;

    // Hand back the store's view so the caller sees any advisory flip.
    match state.store.get_task(task.id).await {
        Ok(Some(task)) => (StatusCode::CREATED, Json(json!(task))),
        _ => (StatusCode::CREATED, Json(json!(task))),
    }
}

#[derive(Debug, Deserialize)]
struct ListTasksQuery {
    status: String,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(query): Query<ListTasksQuery>,
) -> impl IntoResponse {
    let Some(status) = TaskStatus::parse(&query.status) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("unknown status: {}", query.status)})),
        );
    };

    match state.store.list_tasks_by_status(status).await {
        Ok(tasks) => (StatusCode::OK, Json(json!(tasks))),
        Err(e) => {
            warn!(error = %e, "Task listing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.store.get_task(id).await {
        Ok(Some(task)) => (StatusCode::OK, Json(json!(task))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "Task not found"})),
        ),
        Err(e) => {
            warn!(task_id = %id, error = %e, "Task lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

async fn cancel_task(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    match state.store.cancel_task(id).await {
        Ok(task) => {
            info!(task_id = %id, status = %task.status, "Cancel requested");
            (StatusCode::OK, Json(json!(task)))
        }
        Err(e) => task_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ProgressRequest {
    worker_id: String,
    #[serde(default)]
    status: Option<TaskStatus>,
}

async fn task_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ProgressRequest>,
) -> impl IntoResponse {
    if let Some(status) = request.status {
        if status.is_terminal() {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"error": "terminal updates go through release"})),
            );
        }
    }

    // Any inbound status call also counts as worker presence.
    let _ = state.registry.heartbeat(&request.worker_id).await;

    let result = match request.status {
        Some(TaskStatus::Running) => state.store.mark_running(id, &request.worker_id).await,
        _ => state.store.record_progress(id, &request.worker_id).await,
    };

    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => task_error_response(e),
    }
}

async fn release_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(release): Json<TaskRelease>,
) -> impl IntoResponse {
    let _ = state.registry.heartbeat(&release.worker_id).await;

    match state.store.release_task(id, &release).await {
        Ok(task) => {
            info!(task_id = %id, status = %task.status, worker_id = %release.worker_id, "Task released");
            (StatusCode::OK, Json(json!(task)))
        }
        Err(e) => task_error_response(e),
    }
}

// ── Worker endpoints ────────────────────────────────────────────────

async fn register_worker(
    State(state): State<AppState>,
    Json(registration): Json<WorkerRegistration>,
) -> impl IntoResponse {
    match state.registry.register(registration).await {
        Ok(record) => (StatusCode::OK, Json(json!(record))),
        Err(e) => registry_error_response(e),
    }
}

async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.heartbeat(&id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => registry_error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct ScopesRequest {
    owned_codebases: Vec<String>,
}

async fn update_worker_scopes(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ScopesRequest>,
) -> impl IntoResponse {
    match state
        .registry
        .update_scopes(&id, &request.owned_codebases)
        .await
    {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "ok"}))),
        Err(e) => registry_error_response(e),
    }
}

async fn claim_next(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let worker = match state.registry.require(&id).await {
        Ok(worker) => worker,
        Err(e) => return registry_error_response(e).into_response(),
    };
    let _ = state.registry.heartbeat(&id).await;

    match state.store.claim_next(&worker, state.config.claim_batch).await {
        Ok(Some(task)) => {
            info!(task_id = %task.id, worker_id = %id, "Task claimed");
            (StatusCode::OK, Json(json!(task))).into_response()
        }
        // No eligible work — an empty poll, not an error.
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => task_error_response(e).into_response(),
    }
}

async fn claim_task(
    State(state): State<AppState>,
    Path((id, task_id)): Path<(String, Uuid)>,
) -> impl IntoResponse {
    let worker = match state.registry.require(&id).await {
        Ok(worker) => worker,
        Err(e) => return registry_error_response(e),
    };
    let _ = state.registry.heartbeat(&id).await;

    match state.store.claim_task(&worker, task_id).await {
        Ok(task) => {
            info!(task_id = %task_id, worker_id = %id, "Task claimed by name");
            (StatusCode::OK, Json(json!(task)))
        }
        Err(e) => task_error_response(e),
    }
}

// ── Introspection ───────────────────────────────────────────────────

async fn reaper_status(State(state): State<AppState>) -> impl IntoResponse {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(state.config.stuck_timeout)
            .unwrap_or(chrono::Duration::zero());

    match state.store.stuck_running(cutoff).await {
        Ok(stuck) => (
            StatusCode::OK,
            Json(json!({
                "stuck": stuck,
                "telemetry": state.reaper.snapshot(),
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Stuck-task scan failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
        }
    }
}

// ── Error mapping ───────────────────────────────────────────────────

fn task_error_response(error: TaskError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        // Losing a race is the expected outcome — not worth an error log.
        TaskError::Conflict { .. } => {
            debug!(error = %error, "Claim/transition conflict");
            StatusCode::CONFLICT
        }
        TaskError::NotFound { .. } => StatusCode::NOT_FOUND,
        TaskError::DeadlineExceeded { .. } => StatusCode::GONE,
        TaskError::MaxAttemptsExceeded { .. } => StatusCode::CONFLICT,
        TaskError::InvalidTransition { .. } => {
            warn!(error = %error, "Invalid state transition attempted");
            StatusCode::UNPROCESSABLE_ENTITY
        }
        TaskError::Database(_) => {
            warn!(error = %error, "Store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": error.to_string()})))
}

fn registry_error_response(error: RegistryError) -> (StatusCode, Json<serde_json::Value>) {
    let status = match &error {
        RegistryError::NotFound { .. } => StatusCode::NOT_FOUND,
        RegistryError::InvalidRegistration { .. } => StatusCode::BAD_REQUEST,
        RegistryError::Database(_) => {
            warn!(error = %error, "Registry store error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": error.to_string()})))
}
