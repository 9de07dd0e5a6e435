use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use winlink::config::Config;
use winlink::dashboard::router;
use winlink::node::MasterNode;
use winlink::protocol::auth::{AuthManager, AuthOptions};
use winlink::scheduler::{Scheduler, WorkerTelemetry};
use winlink::store::MemoryStore;

fn create_test_app(config: Config) -> (Router, Arc<Scheduler>) {
    let (master, _events) = MasterNode::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(AuthManager::new("dashboard-test", AuthOptions::default())),
        None,
        CancellationToken::new(),
    );
    let scheduler = Arc::clone(master.scheduler());
    (router(master.dashboard_state()), scheduler)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn submit(app: &Router, body: Value) -> String {
    let (status, value) = call(app, Method::POST, "/api/tasks", Some(body)).await;
    assert_eq!(status, StatusCode::CREATED, "{}", value);
    value["task_id"].as_str().unwrap().to_string()
}

// ============================================================================
// Task submission
// ============================================================================

#[tokio::test]
async fn test_submit_task() {
    let (app, scheduler) = create_test_app(Config::default());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({
            "type": "computation",
            "code": "result = 6 * 7",
            "data": {"x": 1},
            "name": "answer",
            "priority": "high"
        })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["priority"], "HIGH");
    let id = body["task_id"].as_str().unwrap().parse().unwrap();
    let task = scheduler.get_task(&id).unwrap();
    assert_eq!(task.name, "answer");
    assert_eq!(task.data["x"], 1);
}

#[tokio::test]
async fn test_submit_uses_configured_default_priority() {
    let mut config = Config::default();
    config.scheduler.default_priority = "low".parse().unwrap();
    let (app, _scheduler) = create_test_app(config);

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"type": "custom", "code": "pass"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["priority"], "LOW");
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let (app, scheduler) = create_test_app(Config::default());

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"type": "custom", "code": "pass", "priority": "someday"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("someday"));

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"type": "custom", "code": "   "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"type": "quantum", "code": "pass"})),
    )
    .await;
    assert!(status.is_client_error());

    assert!(scheduler.tasks().is_empty());
}

#[tokio::test]
async fn test_submit_when_queue_full() {
    let mut config = Config::default();
    config.scheduler.max_queued_tasks = 1;
    let (app, _scheduler) = create_test_app(config);

    submit(&app, json!({"type": "custom", "code": "one"})).await;
    let (status, body) = call(
        &app,
        Method::POST,
        "/api/tasks",
        Some(json!({"type": "custom", "code": "two"})),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].is_string());
}

// ============================================================================
// Task queries and cancellation
// ============================================================================

#[tokio::test]
async fn test_list_tasks_empty() {
    let (app, _scheduler) = create_test_app(Config::default());
    let (status, body) = call(&app, Method::GET, "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

#[tokio::test]
async fn test_list_and_get_tasks() {
    let (app, _scheduler) = create_test_app(Config::default());
    let first = submit(&app, json!({"type": "custom", "code": "a", "priority": "CRITICAL"})).await;
    submit(&app, json!({"type": "data_analysis", "code": "b"})).await;

    let (status, body) = call(&app, Method::GET, "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    let tasks = body.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[0]["id"], first);
    assert_eq!(tasks[0]["priority"], "CRITICAL");
    assert_eq!(tasks[0]["status"], "pending");
    assert_eq!(tasks[1]["type"], "data_analysis");
    assert_eq!(tasks[1]["priority"], "NORMAL");

    let (status, task) = call(&app, Method::GET, &format!("/api/tasks/{}", first), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(task["code"], "a");
    assert_eq!(task["attempt"], 1);
    assert!(task["worker_id"].is_null());
}

#[tokio::test]
async fn test_get_task_errors() {
    let (app, _scheduler) = create_test_app(Config::default());

    let (status, _) = call(&app, Method::GET, "/api/tasks/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing = uuid::Uuid::new_v4();
    let (status, body) = call(&app, Method::GET, &format!("/api/tasks/{}", missing), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains(&missing.to_string()));
}

#[tokio::test]
async fn test_cancel_task() {
    let (app, scheduler) = create_test_app(Config::default());
    let id = submit(&app, json!({"type": "custom", "code": "a"})).await;
    let uri = format!("/api/tasks/{}", id);

    let (status, body) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "cancelled");

    let (status, _) = call(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = call(
        &app,
        Method::DELETE,
        &format!("/api/tasks/{}", uuid::Uuid::new_v4()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    assert!(scheduler.tick().is_empty());
}

#[tokio::test]
async fn test_clear_finished_tasks() {
    let (app, scheduler) = create_test_app(Config::default());
    let pending = submit(&app, json!({"type": "custom", "code": "a"})).await;
    let cancelled = submit(&app, json!({"type": "custom", "code": "b"})).await;
    call(&app, Method::DELETE, &format!("/api/tasks/{}", cancelled), None).await;

    let (status, _) = call(&app, Method::DELETE, "/api/tasks?status=pending", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, Method::DELETE, "/api/tasks?status=someday", None).await;
    assert!(status.is_client_error());

    let (status, body) = call(&app, Method::DELETE, "/api/tasks?status=completed", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 0);

    let (status, body) = call(&app, Method::DELETE, "/api/tasks", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["cleared"], 1);

    let (status, _) = call(&app, Method::GET, &format!("/api/tasks/{}", cancelled), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let remaining: Vec<String> = scheduler.tasks().iter().map(|t| t.id.to_string()).collect();
    assert_eq!(remaining, vec![pending]);
}

#[tokio::test]
async fn test_cleanup_old_history() {
    let (app, scheduler) = create_test_app(Config::default());
    let cancelled = submit(&app, json!({"type": "custom", "code": "a"})).await;
    call(&app, Method::DELETE, &format!("/api/tasks/{}", cancelled), None).await;

    let (status, body) = call(&app, Method::POST, "/api/cleanup", Some(json!({"days_to_keep": 7}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"], 0);
    assert_eq!(scheduler.tasks().len(), 1);

    let (status, _) = call(&app, Method::POST, "/api/cleanup", Some(json!({"days_to_keep": -1}))).await;
    assert!(status.is_client_error());
}

// ============================================================================
// Workers, statistics and strategy
// ============================================================================

#[tokio::test]
async fn test_workers_endpoint() {
    let (app, scheduler) = create_test_app(Config::default());
    let balancer = scheduler.balancer();
    balancer.declare_worker("w2", &["gpu".to_string()], Some(3));
    balancer.register_worker(
        "w1",
        &WorkerTelemetry {
            cpu_percent: 12.0,
            ..Default::default()
        },
    );

    let (status, body) = call(&app, Method::GET, "/api/workers", None).await;
    assert_eq!(status, StatusCode::OK);
    let workers = body["workers"].as_array().unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0]["worker_id"], "w1");
    assert_eq!(workers[0]["cpu_percent"], 12.0);
    assert_eq!(workers[1]["max_concurrent_tasks"], 3);
    assert_eq!(workers[1]["capabilities"], json!(["gpu"]));
    assert_eq!(body["connections"], json!([]));
}

#[tokio::test]
async fn test_stats_endpoint() {
    let (app, _scheduler) = create_test_app(Config::default());
    submit(&app, json!({"type": "custom", "code": "a", "priority": "high"})).await;
    let cancelled = submit(&app, json!({"type": "custom", "code": "b"})).await;
    call(&app, Method::DELETE, &format!("/api/tasks/{}", cancelled), None).await;

    let (status, body) = call(&app, Method::GET, "/api/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["queue"]["total_pending"], 1);
    assert_eq!(body["queue"]["total_queued"], 2);
    assert_eq!(body["queue"]["by_priority"]["HIGH"], 1);
    assert_eq!(body["by_status"]["failed"], 1);
    assert_eq!(body["load_balancing"]["total_workers"], 0);
    assert_eq!(body["load_balancing"]["current_strategy"], "performance_based");
}

#[tokio::test]
async fn test_set_strategy() {
    let (app, scheduler) = create_test_app(Config::default());

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/strategy",
        Some(json!({"strategy": "round_robin"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["strategy"], "round_robin");
    assert_eq!(scheduler.balancer().strategy().as_str(), "round_robin");

    let (status, body) = call(
        &app,
        Method::PUT,
        "/api/strategy",
        Some(json!({"strategy": "random"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("random"));
    assert_eq!(scheduler.balancer().strategy().as_str(), "round_robin");
}

#[tokio::test]
async fn test_cors_allows_any_origin() {
    let (app, _scheduler) = create_test_app(Config::default());
    let request = Request::builder()
        .uri("/api/stats")
        .header(header::ORIGIN, "http://example.com")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "*"
    );
}
