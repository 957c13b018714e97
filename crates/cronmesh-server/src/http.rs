//! Axum HTTP surface of the control plane.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/healthz` | Liveness check — always `200 OK`. |
//! | `POST` | `/api/v1/result` | Result ingestion from agents. |
//! | `PUT` | `/api/v1/task` | Validate and publish a task. |
//! | `GET` | `/api/v1/task/{project}` | List a project's tasks. |
//! | `DELETE` | `/api/v1/task/{project}/{task}` | Unpublish a task. |
//! | `POST` | `/api/v1/task/{project}/{task}/kill` | Cancel the in-flight run. |
//! | `POST` | `/api/v1/task/{project}/{task}/run` | One-shot out-of-schedule run. |
//! | `GET` | `/api/v1/logs` | Query the execution log. |

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use cronmesh_core::model::{ProjectId, TaskInfo, TaskKey, TaskLogEntry, TaskRunResult};

use crate::publisher::{PublishError, TaskPublisher};
use crate::store::{Selector, StoreError, StoreQuery, TaskLogStore};

/// Shared state injected into every handler.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<TaskPublisher>,
    pub logs: Arc<dyn TaskLogStore>,
}

/// Uniform JSON error body with a mapped status code.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<PublishError> for ApiError {
    fn from(e: PublishError) -> Self {
        let status = match &e {
            PublishError::InvalidCron { .. } => StatusCode::BAD_REQUEST,
            PublishError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            PublishError::Coordinator(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match &e {
            StoreError::NotFound(_) => StatusCode::NOT_FOUND,
            StoreError::UnknownField(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

#[derive(Serialize)]
struct SaveTaskResponse {
    task: TaskInfo,
    prior: Option<TaskInfo>,
}

#[derive(Deserialize)]
struct LogQueryParams {
    project_id: Option<ProjectId>,
    task_id: Option<String>,
    page: Option<u64>,
    size: Option<u64>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/api/v1/result", post(ingest_result))
        .route("/api/v1/task", put(save_task))
        .route("/api/v1/task/{project}", get(list_tasks))
        .route("/api/v1/task/{project}/{task}", delete(delete_task))
        .route("/api/v1/task/{project}/{task}/kill", post(kill_task))
        .route("/api/v1/task/{project}/{task}/run", post(run_task))
        .route("/api/v1/logs", get(query_logs))
        .with_state(state)
}

/// Bind and serve until the token is cancelled.
pub async fn serve(
    bind_addr: &str,
    state: AppState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "control plane listening");
    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health() -> &'static str {
    "ok"
}

async fn ingest_result(
    State(state): State<AppState>,
    Json(result): Json<TaskRunResult>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let entry = TaskLogEntry::from(result);
    state.logs.insert_log(None, &entry).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn save_task(
    State(state): State<AppState>,
    Json(task): Json<TaskInfo>,
) -> Result<Json<SaveTaskResponse>, ApiError> {
    let (task, prior) = state.publisher.save_task(task).await?;
    Ok(Json(SaveTaskResponse { task, prior }))
}

async fn list_tasks(
    State(state): State<AppState>,
    Path(project): Path<ProjectId>,
) -> Result<Json<Vec<TaskInfo>>, ApiError> {
    Ok(Json(state.publisher.list_tasks(project).await?))
}

async fn delete_task(
    State(state): State<AppState>,
    Path((project, task)): Path<(ProjectId, String)>,
) -> Result<Json<Option<TaskInfo>>, ApiError> {
    let removed = state
        .publisher
        .delete_task(&TaskKey::new(project, task))
        .await?;
    Ok(Json(removed))
}

async fn kill_task(
    State(state): State<AppState>,
    Path((project, task)): Path<(ProjectId, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .publisher
        .kill_task(&TaskKey::new(project, task))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn run_task(
    State(state): State<AppState>,
    Path((project, task)): Path<(ProjectId, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .publisher
        .run_once(&TaskKey::new(project, task))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

async fn query_logs(
    State(state): State<AppState>,
    Query(params): Query<LogQueryParams>,
) -> Result<Json<Vec<TaskLogEntry>>, ApiError> {
    let mut query = StoreQuery::new().ordered("start_time desc");
    if let Some(project) = params.project_id {
        query = query.filter(Selector::equals("project_id", project));
    }
    if let Some(task) = params.task_id {
        query = query.filter(Selector::equals("task_id", task));
    }
    if let (Some(page), Some(size)) = (params.page, params.size) {
        query = query.paged(page.max(1), size.clamp(1, 500));
    }
    Ok(Json(state.logs.query_logs(&query).await?))
}
