use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use taskq_core::models::{ScheduledTaskRequest, ScheduledTaskUpdate};

use crate::{
    error::ApiResult,
    response::{created, success, success_with_message},
    routes::AppState,
};

pub async fn create_scheduled_task(
    State(state): State<AppState>,
    payload: Result<Json<ScheduledTaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let definition = state.scheduler.create_definition(request).await?;
    Ok(created(definition))
}

pub async fn list_scheduled_tasks(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.scheduler.list().await?))
}

pub async fn get_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.scheduler.get(&name).await?))
}

pub async fn update_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
    payload: Result<Json<ScheduledTaskUpdate>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(update) = payload?;
    let definition = state.scheduler.update_definition(&name, update).await?;
    Ok(success(definition))
}

pub async fn delete_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.delete_definition(&name).await?;
    Ok(success_with_message(json!({ "name": name }), "定时任务已删除"))
}

pub async fn pause_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state.scheduler.pause(&name).await?;
    Ok(success_with_message(definition, "定时任务已暂停"))
}

pub async fn resume_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let definition = state.scheduler.resume(&name).await?;
    Ok(success_with_message(definition, "定时任务已恢复"))
}

/// 立即触发一次，返回生成的任务
pub async fn run_scheduled_task(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.scheduler.run_now(&name).await?;
    Ok(created(task))
}

pub async fn scheduler_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.scheduler.stats().await?))
}
