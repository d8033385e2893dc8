use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct RegisterQueueRequest {
    pub name: String,
    pub concurrency: usize,
    pub capacity: Option<usize>,
}

/// 注册队列，注册后立即可以接收任务
pub async fn register_queue(
    State(state): State<AppState>,
    payload: Result<Json<RegisterQueueRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let capacity = request
        .capacity
        .unwrap_or(state.queue.config().default_capacity);
    let descriptor = state
        .queue
        .register_queue(&request.name, request.concurrency, capacity)
        .await?;
    Ok(created(descriptor))
}

pub async fn list_queues(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.queue.list_queues().await))
}

pub async fn queue_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let stats = state.queue.queue_stats(&name).await?;
    Ok(success(stats))
}
