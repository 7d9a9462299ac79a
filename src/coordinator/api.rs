//! REST API handlers for the coordinator
//!
//! Remote workers register, send heartbeats and report results through
//! these routes. A heartbeat response carries the tasks the manager has
//! assigned to that worker, so workers never need an inbound connection.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, ErrorCategory};
use crate::metrics;
use crate::models::{ManagerStatus, TaskResult, WorkerHeartbeat, WorkerInfo, WorkerTask};

use super::server::AppState;

// ============================================================================
// API Response Types
// ============================================================================

/// Generic API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// Simple error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

/// Worker list response
#[derive(Debug, Serialize)]
pub struct WorkersResponse {
    pub workers: Vec<WorkerInfo>,
    pub total: usize,
}

/// Task submission
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    pub url: String,
    #[serde(default = "default_depth")]
    pub max_depth: u32,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub backend_name: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_depth() -> u32 {
    1
}

impl From<SubmitTaskRequest> for WorkerTask {
    fn from(request: SubmitTaskRequest) -> Self {
        let mut task = WorkerTask::new(request.url, request.max_depth).with_priority(request.priority);
        task.backend_name = request.backend_name;
        task.metadata = request.metadata;
        task
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitTaskResponse {
    pub task_id: String,
}

#[derive(Debug, Serialize)]
pub struct HeartbeatResponse {
    /// Tasks the manager has assigned to this worker and not yet seen a result for
    pub assigned_tasks: Vec<WorkerTask>,
}

#[derive(Debug, Serialize)]
pub struct CompleteTaskResponse {
    /// Whether the task was running when its result arrived
    pub was_running: bool,
}

// ============================================================================
// API Routes
// ============================================================================

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/api/status", get(get_status))
        // Worker endpoints
        .route("/api/workers", get(list_workers))
        .route("/api/workers/register", post(register_worker))
        .route("/api/workers/heartbeat", post(heartbeat))
        .route("/api/workers/{id}", delete(unregister_worker))
        // Task endpoints
        .route("/api/tasks", post(submit_task))
        .route("/api/tasks/complete", post(complete_task))
        .route("/api/tasks/{id}", get(get_task_result))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Map a manager error to an HTTP response
fn error_response(error: &Error) -> Response {
    let status = match error.category() {
        ErrorCategory::Capacity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorCategory::Scheduling => StatusCode::NOT_FOUND,
        ErrorCategory::Config => StatusCode::BAD_REQUEST,
        ErrorCategory::Backend | ErrorCategory::Other => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(error.to_string()))).into_response()
}

// ============================================================================
// Health Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    }))
}

async fn get_status(State(state): State<AppState>) -> Json<ApiResponse<ManagerStatus>> {
    Json(ApiResponse::success(state.manager.get_status()))
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    metrics::update_manager_status(&state.manager.get_status());

    match metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("Failed to encode metrics: {e}"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Worker Handlers
// ============================================================================

async fn list_workers(State(state): State<AppState>) -> impl IntoResponse {
    let workers = state.manager.workers();
    let total = workers.len();
    Json(ApiResponse::success(WorkersResponse { workers, total }))
}

async fn register_worker(State(state): State<AppState>, Json(info): Json<WorkerInfo>) -> Response {
    let worker_id = info.worker_id.clone();
    match state.manager.register_worker(info) {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::success(worker_id))).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(heartbeat): Json<WorkerHeartbeat>,
) -> Response {
    if !state.manager.update_worker_heartbeat(&heartbeat) {
        return error_response(&Error::WorkerNotRegistered(heartbeat.worker_id));
    }

    let assigned_tasks = state.manager.assigned_tasks(&heartbeat.worker_id);
    (
        StatusCode::OK,
        Json(ApiResponse::success(HeartbeatResponse { assigned_tasks })),
    )
        .into_response()
}

async fn unregister_worker(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    if state.manager.unregister_worker(&id) {
        (StatusCode::OK, Json(ApiResponse::success(id))).into_response()
    } else {
        error_response(&Error::WorkerNotRegistered(id))
    }
}

// ============================================================================
// Task Handlers
// ============================================================================

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Response {
    if url::Url::parse(&request.url).is_err() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse::new(format!("Invalid URL: {}", request.url))),
        )
            .into_response();
    }

    let task = WorkerTask::from(request);
    let task_id = task.task_id.clone();
    match state.manager.add_task(task) {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::success(SubmitTaskResponse { task_id })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn complete_task(State(state): State<AppState>, Json(result): Json<TaskResult>) -> Response {
    let was_running = state.manager.complete_task(result);
    (
        StatusCode::OK,
        Json(ApiResponse::success(CompleteTaskResponse { was_running })),
    )
        .into_response()
}

async fn get_task_result(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.manager.get_task_result(&id) {
        Some(result) => (StatusCode::OK, Json(ApiResponse::success(result))).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse::new(format!("No result for task: {id}"))),
        )
            .into_response(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiConfig, DistributedConfig};
    use crate::coordinator::CoordinatorServer;
    use crate::distributed::DistributedCrawlManager;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn router() -> (Router, Arc<DistributedCrawlManager>) {
        let manager = Arc::new(DistributedCrawlManager::new(DistributedConfig::default()));
        let server = CoordinatorServer::new(Arc::clone(&manager), ApiConfig::default());
        (server.build_router(), manager)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert!(response.data.is_some());
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _) = router();
        let response = router
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["status"], "healthy");
    }

    #[tokio::test]
    async fn test_submit_task_queues_it() {
        let (router, manager) = router();
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/tasks",
                serde_json::json!({ "url": "https://a.test/", "priority": 4 }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(manager.pending_count(), 1);
        assert_eq!(manager.pending_tasks()[0].priority, 4);
    }

    #[tokio::test]
    async fn test_submit_invalid_url() {
        let (router, manager) = router();
        let response = router
            .oneshot(json_request("POST", "/api/tasks", serde_json::json!({ "url": "nope" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(manager.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_from_unknown_worker() {
        let (router, _) = router();
        let heartbeat = WorkerHeartbeat::new("ghost", crate::models::WorkerStatus::Idle);
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/workers/heartbeat",
                serde_json::to_value(&heartbeat).unwrap(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_heartbeat_returns_assignments() {
        let (router, manager) = router();
        manager.register_worker(WorkerInfo::new("w1")).unwrap();
        let task = WorkerTask::new("https://a.test/", 1);
        manager.add_task(task.clone()).unwrap();
        manager.assign_next().unwrap();

        let heartbeat = WorkerHeartbeat::new("w1", crate::models::WorkerStatus::Busy);
        let response = router
            .oneshot(json_request(
                "POST",
                "/api/workers/heartbeat",
                serde_json::to_value(&heartbeat).unwrap(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["assigned_tasks"][0]["task_id"], task.task_id.as_str());
    }

    #[tokio::test]
    async fn test_unknown_task_result() {
        let (router, _) = router();
        let response = router
            .oneshot(Request::get("/api/tasks/missing").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
