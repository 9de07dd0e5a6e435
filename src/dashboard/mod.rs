//! HTTP API on the master: task submission, cancellation and listing, the
//! worker table and scheduler statistics, and clearing of finished history.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::network::{MasterNetwork, PeerInfo};
use crate::scheduler::{
    Scheduler, SchedulerError, Task, TaskPriority, TaskRequirements, TaskStatus, TaskType,
    WorkerCapacity,
};

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: Arc<Scheduler>,
    pub network: Arc<MasterNetwork>,
    /// Priority for submissions that name none.
    pub default_priority: TaskPriority,
}

#[derive(Debug, Deserialize)]
struct SubmitTaskRequest {
    #[serde(rename = "type")]
    task_type: TaskType,
    code: String,
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(default)]
    requirements: Option<TaskRequirements>,
}

#[derive(Debug, Serialize)]
struct SubmitTaskResponse {
    task_id: Uuid,
    priority: TaskPriority,
}

#[derive(Debug, Serialize)]
struct TaskView {
    #[serde(flatten)]
    task: Task,
    priority: Option<TaskPriority>,
}

#[derive(Debug, Serialize)]
struct WorkersResponse {
    workers: Vec<WorkerCapacity>,
    connections: Vec<PeerInfo>,
}

#[derive(Debug, Deserialize)]
struct StrategyRequest {
    strategy: String,
}

#[derive(Debug, Deserialize)]
struct ClearTasksQuery {
    status: Option<TaskStatus>,
}

#[derive(Debug, Serialize)]
struct ClearTasksResponse {
    cleared: usize,
}

#[derive(Debug, Deserialize)]
struct CleanupRequest {
    days_to_keep: u32,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

fn scheduler_error(e: SchedulerError) -> Response {
    let status = match &e {
        SchedulerError::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SchedulerError::TaskNotFound(_) => StatusCode::NOT_FOUND,
        SchedulerError::NotCancellable { .. } | SchedulerError::DuplicateTask(_) => {
            StatusCode::CONFLICT
        }
        _ => StatusCode::BAD_REQUEST,
    };
    error_response(status, e)
}

fn parse_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, format!("Invalid task id: {}", raw)))
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/stats", get(stats_handler))
        .route(
            "/api/tasks",
            get(list_tasks_handler)
                .post(submit_task_handler)
                .delete(clear_tasks_handler),
        )
        .route(
            "/api/tasks/{id}",
            get(get_task_handler).delete(cancel_task_handler),
        )
        .route("/api/workers", get(workers_handler))
        .route("/api/strategy", put(set_strategy_handler))
        .route("/api/cleanup", post(cleanup_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` fires.
pub async fn serve(listener: TcpListener, state: DashboardState, shutdown: CancellationToken) {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "Starting HTTP API");
    }

    if let Err(e) = axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "HTTP API server failed");
    }
}

async fn stats_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(state.scheduler.scheduler_statistics())
}

async fn list_tasks_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let tasks: Vec<TaskView> = state
        .scheduler
        .tasks()
        .into_iter()
        .map(|task| TaskView {
            priority: state.scheduler.priority_of(&task.id),
            task,
        })
        .collect();
    Json(tasks)
}

async fn get_task_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.get_task(&id) {
        Some(task) => Json(TaskView {
            priority: state.scheduler.priority_of(&id),
            task,
        })
        .into_response(),
        None => scheduler_error(SchedulerError::TaskNotFound(id)),
    }
}

async fn submit_task_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<SubmitTaskRequest>,
) -> Response {
    let priority = match payload.priority.as_deref() {
        Some(raw) => match raw.parse::<TaskPriority>() {
            Ok(priority) => priority,
            Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
        },
        None => state.default_priority,
    };
    if payload.code.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "Task code must not be empty");
    }

    let mut task = Task::new(payload.task_type, payload.code, payload.data);
    if let Some(name) = payload.name {
        task = task.with_name(name);
    }

    match state
        .scheduler
        .submit_task(task, priority, payload.requirements)
    {
        Ok(task_id) => (
            StatusCode::CREATED,
            Json(SubmitTaskResponse { task_id, priority }),
        )
            .into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn cancel_task_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(response) => return response,
    };
    match state.scheduler.cancel_task(&id) {
        Ok(task) => Json(task).into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    Json(WorkersResponse {
        workers: state.scheduler.balancer().workers(),
        connections: state.network.peers().await,
    })
}

async fn set_strategy_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<StrategyRequest>,
) -> Response {
    match state.scheduler.balancer().set_strategy(&payload.strategy) {
        Ok(kind) => Json(serde_json::json!({ "strategy": kind })).into_response(),
        Err(e) => error_response(StatusCode::BAD_REQUEST, e),
    }
}

async fn clear_tasks_handler(
    State(state): State<DashboardState>,
    Query(query): Query<ClearTasksQuery>,
) -> Response {
    match state.scheduler.clear_tasks(query.status) {
        Ok(cleared) => Json(ClearTasksResponse { cleared }).into_response(),
        Err(e) => scheduler_error(e),
    }
}

async fn cleanup_handler(
    State(state): State<DashboardState>,
    Json(payload): Json<CleanupRequest>,
) -> impl IntoResponse {
    let cutoff = chrono::Utc::now() - chrono::Duration::days(i64::from(payload.days_to_keep));
    Json(state.scheduler.cleanup_before(cutoff))
}
