use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use serde_json::{json, Value};
use taskq_api::{create_routes, AppState, RouterOptions};
use taskq_core::{
    config::{ProgressConfig, QueueConfig, SchedulerConfig},
    Clock, SystemClock,
};
use taskq_dispatcher::ScheduledTaskService;
use taskq_infrastructure::database::DatabaseManager;
use taskq_worker::{HandlerRegistry, ProgressTracker, QueueService};
use tower::ServiceExt;

struct TestApp {
    router: Router,
    queue: QueueService,
}

async fn spawn_app() -> Result<TestApp> {
    let database = DatabaseManager::new("sqlite::memory:", 1).await?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let progress = Arc::new(ProgressTracker::new(
        database.task_repository(),
        database.progress_repository(),
        clock.clone(),
        ProgressConfig::default(),
    ));
    let queue = QueueService::new(
        QueueConfig {
            poll_interval_ms: 20,
            ..Default::default()
        },
        database.task_repository(),
        database.execution_repository(),
        Arc::new(HandlerRegistry::new()),
        progress,
        clock.clone(),
    );
    let scheduler = ScheduledTaskService::new(
        database.scheduled_task_repository(),
        Arc::new(queue.clone()),
        clock,
        SchedulerConfig::default(),
    );

    let state = AppState {
        queue: queue.clone(),
        scheduler,
        database,
        metrics: None,
        started_at: Utc::now(),
    };
    Ok(TestApp {
        router: create_routes(state, RouterOptions::default()),
        queue,
    })
}

impl TestApp {
    async fn send(&self, method: &str, uri: &str, body: Option<Value>) -> Result<(StatusCode, Value)> {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };
        self.send_request(request).await
    }

    async fn send_request(&self, request: Request<Body>) -> Result<(StatusCode, Value)> {
        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or_else(|_| {
                Value::String(String::from_utf8_lossy(&bytes).to_string())
            })
        };
        Ok((status, body))
    }
}

fn assert_error(body: &Value, code: u16, error_type: &str) {
    let error = &body["error"];
    assert_eq!(error["code"], code, "响应: {body}");
    assert_eq!(error["type"], error_type, "响应: {body}");
    assert!(error["message"].is_string());
    assert!(error["suggestions"].is_array());
    assert!(error["timestamp"].is_string());
}

#[tokio::test]
async fn test_health_reports_components() -> Result<()> {
    let app = spawn_app().await?;
    let (status, body) = app.send("GET", "/health", None).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["components"]["database"], "ok");
    assert_eq!(body["components"]["queue_runtime"], "stopped");
    assert_eq!(body["handlers"], json!([]));

    app.queue
        .register_handler_fn("thumbnail", |_ctx| async move { Ok(json!(null)) })
        .await;
    let (_, body) = app.send("GET", "/health", None).await?;
    assert_eq!(body["handlers"], json!(["thumbnail"]));
    Ok(())
}

#[tokio::test]
async fn test_metrics_disabled_returns_not_found() -> Result<()> {
    let app = spawn_app().await?;
    let (status, body) = app.send("GET", "/metrics", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, 404, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_submit_and_get_task() -> Result<()> {
    let app = spawn_app().await?;
    let (status, body) = app
        .send(
            "POST",
            "/api/tasks",
            Some(json!({
                "type": "send_email",
                "queue": "emails",
                "priority": 5,
                "payload": {"to": "ops@example.com"},
                "max_retries": 2,
                "timeout": 30,
                "owner_id": "team-a"
            })),
        )
        .await?;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert!(body["timestamp"].is_string());
    let task = &body["data"];
    assert_eq!(task["status"], "pending");
    assert_eq!(task["type"], "send_email");
    assert_eq!(task["max_retries"], 2);
    let id = task["id"].as_str().unwrap().to_string();

    let (status, body) = app.send("GET", &format!("/api/tasks/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["id"], id.as_str());
    assert_eq!(body["data"]["payload"]["to"], "ops@example.com");

    let (status, body) = app.send("GET", "/api/tasks/does-not-exist", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, 404, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_invalid_requests_use_error_envelope() -> Result<()> {
    let app = spawn_app().await?;

    let request = Request::builder()
        .method("POST")
        .uri("/api/tasks")
        .header("content-type", "application/json")
        .body(Body::from("{not json"))?;
    let (status, body) = app.send_request(request).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    let (status, body) = app
        .send("POST", "/api/tasks", Some(json!({"type": "", "queue": "default"})))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    let (status, body) = app
        .send(
            "POST",
            "/api/tasks",
            Some(json!({"type": "echo", "queue": "default", "delay_seconds": 1_000_000_000_000_000i64})),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    let (status, body) = app.send("GET", "/api/tasks?status=sleeping", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");
    Ok(())
}

#[tokio::test]
async fn test_cancel_and_result_rules() -> Result<()> {
    let app = spawn_app().await?;
    let (_, body) = app
        .send("POST", "/api/tasks", Some(json!({"type": "report", "queue": "default"})))
        .await?;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = app.send("GET", &format!("/api/tasks/{id}/result"), None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    let (status, body) = app.send("DELETE", &format!("/api/tasks/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "cancelled");

    let (status, body) = app.send("DELETE", &format!("/api/tasks/{id}"), None).await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, 409, "CONFLICT");
    Ok(())
}

#[tokio::test]
async fn test_list_tasks_with_filters() -> Result<()> {
    let app = spawn_app().await?;
    for (task_type, queue) in [("a", "alpha"), ("b", "alpha"), ("c", "beta")] {
        app.send(
            "POST",
            "/api/tasks",
            Some(json!({"type": task_type, "queue": queue})),
        )
        .await?;
    }

    let (status, body) = app
        .send("GET", "/api/tasks?queue=alpha&status=pending&page=1&page_size=1", None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 2);
    assert_eq!(body["data"]["items"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"]["page_size"], 1);

    let (status, body) = app.send("GET", "/api/tasks/statistics", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 3);
    Ok(())
}

#[tokio::test]
async fn test_queue_registration_and_stats() -> Result<()> {
    let app = spawn_app().await?;

    let (status, body) = app
        .send(
            "POST",
            "/api/queues",
            Some(json!({"name": "video", "concurrency": 3, "capacity": 10})),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["concurrency"], 3);

    let (status, body) = app
        .send("POST", "/api/queues", Some(json!({"name": "video", "concurrency": 1})))
        .await?;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_error(&body, 409, "CONFLICT");

    let (status, body) = app
        .send("POST", "/api/queues", Some(json!({"name": "zero", "concurrency": 0})))
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    app.send("POST", "/api/tasks", Some(json!({"type": "encode", "queue": "video"})))
        .await?;
    let (status, body) = app.send("GET", "/api/queues/video/stats", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["pending"], 1);
    assert_eq!(body["data"]["concurrency"], 3);
    assert_eq!(body["data"]["buffer_capacity"], 10);

    let (status, _) = app.send("GET", "/api/queues/missing/stats", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, body) = app.send("GET", "/api/queues", None).await?;
    let names: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|q| q["name"].as_str())
        .collect();
    assert!(names.contains(&"video"));
    Ok(())
}

#[tokio::test]
async fn test_scheduled_task_lifecycle() -> Result<()> {
    let app = spawn_app().await?;

    let (status, body) = app
        .send(
            "POST",
            "/api/scheduled-tasks",
            Some(json!({
                "name": "daily_report",
                "cron_expression": "0 0 9 * * *",
                "task_type": "report",
                "target_queue": "reports",
                "payload_template": {"format": "pdf"}
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["is_active"], true);
    assert!(body["data"]["next_run_at"].is_string());

    let (status, body) = app
        .send(
            "POST",
            "/api/scheduled-tasks",
            Some(json!({
                "name": "broken",
                "cron_expression": "every day",
                "task_type": "report",
                "target_queue": "reports"
            })),
        )
        .await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_error(&body, 400, "VALIDATION_ERROR");

    let (status, body) = app
        .send("POST", "/api/scheduled-tasks/daily_report/pause", None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["is_active"], false);
    assert!(body["data"]["next_run_at"].is_null());

    let (status, body) = app
        .send("POST", "/api/scheduled-tasks/daily_report/run", None)
        .await?;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["type"], "report");
    assert_eq!(body["data"]["queue"], "reports");

    let (status, body) = app
        .send(
            "PUT",
            "/api/scheduled-tasks/daily_report",
            Some(json!({"cron_expression": "0 30 9 * * *"})),
        )
        .await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cron_expression"], "0 30 9 * * *");
    assert_eq!(body["data"]["run_count"], 1);

    let (_, body) = app.send("GET", "/api/scheduler/stats", None).await?;
    assert_eq!(body["data"]["total_definitions"], 1);
    assert_eq!(body["data"]["paused_definitions"], 1);

    let (status, _) = app
        .send("DELETE", "/api/scheduled-tasks/daily_report", None)
        .await?;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = app
        .send("GET", "/api/scheduled-tasks/daily_report", None)
        .await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_error(&body, 404, "NOT_FOUND");
    Ok(())
}

#[tokio::test]
async fn test_completed_task_exposes_result_and_progress() -> Result<()> {
    let app = spawn_app().await?;
    app.queue
        .register_handler_fn("double", |ctx| async move {
            let value = ctx.payload()["value"].as_i64().unwrap_or(0);
            ctx.progress.report(50, "计算中").await?;
            Ok(json!({"doubled": value * 2}))
        })
        .await;
    app.queue.start().await?;

    let (_, body) = app
        .send(
            "POST",
            "/api/tasks",
            Some(json!({"type": "double", "queue": "default", "payload": {"value": 21}})),
        )
        .await?;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let mut completed = false;
    for _ in 0..300 {
        let (_, body) = app.send("GET", &format!("/api/tasks/{id}"), None).await?;
        if body["data"]["status"] == "completed" {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed);

    let (status, body) = app.send("GET", &format!("/api/tasks/{id}/result"), None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["doubled"], 42);

    let (_, body) = app.send("GET", &format!("/api/tasks/{id}/progress"), None).await?;
    assert_eq!(body["data"]["percent"], 50);

    let (_, body) = app
        .send("GET", &format!("/api/tasks/{id}/progress/history?limit=10"), None)
        .await?;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (_, body) = app.send("GET", &format!("/api/tasks/{id}/executions"), None).await?;
    let executions = body["data"].as_array().unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0]["outcome"], "success");

    app.queue.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
