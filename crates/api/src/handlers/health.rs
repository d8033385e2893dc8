use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::{error::ApiError, routes::AppState};

/// 健康检查，数据库不可用时返回503
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database_ok = match state.database.health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!("数据库健康检查失败: {}", e);
            false
        }
    };
    let status = if database_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let now = Utc::now();
    let queue_runtime = if state.queue.is_running() { "running" } else { "stopped" };
    let scheduler = if state.scheduler.is_running().await { "running" } else { "stopped" };
    let handlers = state.queue.handlers().task_types().await;
    let (overall, database) = if database_ok {
        ("ok", "ok")
    } else {
        ("degraded", "unavailable")
    };

    (
        status,
        Json(json!({
            "status": overall,
            "timestamp": now.to_rfc3339(),
            "service": "taskq",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime_seconds": (now - state.started_at).num_seconds().max(0),
            "components": {
                "database": database,
                "queue_runtime": queue_runtime,
                "scheduler": scheduler,
            },
            "handlers": handlers,
        })),
    )
}

/// Prometheus 文本格式的指标
pub async fn metrics(State(state): State<AppState>) -> Result<String, ApiError> {
    match &state.metrics {
        Some(handle) => Ok(handle.render()),
        None => Err(ApiError::NotFound),
    }
}
