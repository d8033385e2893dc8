use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::json;
use taskq_core::models::{TaskFilter, TaskRequest, TaskStatus};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success, success_with_message},
    routes::AppState,
};

/// 任务查询参数
#[derive(Debug, Default, Deserialize)]
pub struct TaskQueryParams {
    pub queue: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub status: Option<String>,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl TaskQueryParams {
    fn into_filter(self) -> ApiResult<TaskFilter> {
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(raw.parse::<TaskStatus>().map_err(ApiError::BadRequest)?),
            None => None,
        };
        Ok(TaskFilter {
            queue: self.queue,
            task_type: self.task_type,
            status,
            owner_id: self.owner_id,
            project_id: self.project_id,
            page: self.page,
            page_size: self.page_size,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQueryParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct StatisticsQueryParams {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// 提交任务
pub async fn create_task(
    State(state): State<AppState>,
    payload: Result<Json<TaskRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let task = state.queue.submit(request).await?;
    Ok(created(task))
}

/// 分页查询任务
pub async fn list_tasks(
    State(state): State<AppState>,
    params: Result<Query<TaskQueryParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let filter = params.into_filter()?;
    let page = state.queue.list_tasks(&filter).await?;
    Ok(success(page))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.queue.get_task(&id).await?;
    Ok(success(task))
}

/// 取消任务，只允许取消尚未开始执行的任务
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.queue.cancel(&id).await?;
    Ok(success_with_message(task, "任务已取消"))
}

pub async fn get_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let progress = state.queue.progress().get_progress(&id).await?;
    Ok(success(progress))
}

pub async fn get_progress_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    params: Result<Query<HistoryQueryParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    state.queue.get_task(&id).await?;
    let history = state
        .queue
        .progress()
        .get_history(&id, params.limit.unwrap_or(50))
        .await?;
    Ok(success(history))
}

pub async fn clear_progress_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    state.queue.get_task(&id).await?;
    let deleted = state.queue.progress().clear_history(&id).await?;
    Ok(success(json!({ "deleted": deleted })))
}

/// 获取处理器返回的结果，任务未完成时返回400
pub async fn get_task_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let result = state.queue.get_task_result(&id).await?;
    Ok(success(result))
}

pub async fn list_executions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let executions = state.queue.list_executions(&id).await?;
    Ok(success(executions))
}

pub async fn retry_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let task = state.queue.retry_task(&id).await?;
    Ok(success_with_message(task, "任务已重新排队"))
}

/// 时间段内的任务统计，默认统计最近24小时
pub async fn task_statistics(
    State(state): State<AppState>,
    params: Result<Query<StatisticsQueryParams>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(params) = params?;
    let to = params.to.unwrap_or_else(Utc::now);
    let from = params.from.unwrap_or_else(|| {
        to.checked_sub_signed(Duration::hours(24))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    });
    let statistics = state.queue.task_statistics(from, to).await?;
    Ok(success(statistics))
}
