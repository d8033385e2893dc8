use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use taskq_core::{ErrorKind, SchedulerError};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求体格式错误: {0}")]
    Json(#[from] JsonRejection),

    #[error("查询参数错误: {0}")]
    Query(#[from] QueryRejection),

    #[error("路径参数错误: {0}")]
    Path(#[from] PathRejection),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("未找到资源")]
    NotFound,

    #[error("请求处理超时")]
    Timeout,

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Scheduler(err) => match err.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::NotFound => StatusCode::NOT_FOUND,
                ErrorKind::Conflict => StatusCode::CONFLICT,
                ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
                ErrorKind::TransientExecution
                | ErrorKind::TerminalExecution
                | ErrorKind::Persistence
                | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::Json(_) | ApiError::Query(_) | ApiError::Path(_) | ApiError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 稳定的错误类型码
    pub fn error_type(&self) -> &'static str {
        match self {
            ApiError::Scheduler(err) => err.code(),
            ApiError::Json(_) | ApiError::Query(_) | ApiError::Path(_) | ApiError::BadRequest(_) => {
                ErrorKind::Validation.as_str()
            }
            ApiError::NotFound => ErrorKind::NotFound.as_str(),
            ApiError::Timeout => ErrorKind::Timeout.as_str(),
            ApiError::Internal(_) => ErrorKind::Internal.as_str(),
        }
    }

    fn suggestions(&self) -> Vec<String> {
        let hints: &[&str] = match self {
            ApiError::Scheduler(SchedulerError::TaskNotFound { .. }) => &[
                "请检查任务ID是否正确",
                "使用 GET /api/tasks 查看所有任务",
            ],
            ApiError::Scheduler(SchedulerError::QueueNotFound { .. }) => &[
                "请检查队列名称是否正确",
                "使用 GET /api/queues 查看已注册的队列",
            ],
            ApiError::Scheduler(SchedulerError::ScheduledTaskNotFound { .. }) => &[
                "请检查定时任务名称是否正确",
                "使用 GET /api/scheduled-tasks 查看所有定时任务",
            ],
            ApiError::Scheduler(SchedulerError::InvalidCron { .. }) => &[
                "支持5段或6段CRON表达式，6段格式以秒开头",
                "示例: '0 */5 * * * *' (每5分钟执行一次)",
            ],
            ApiError::Scheduler(SchedulerError::ResultNotReady { .. }) => &[
                "任务完成后才能获取结果",
                "使用 GET /api/tasks/{id} 查看任务状态",
            ],
            ApiError::Scheduler(SchedulerError::InvalidTransition { .. }) => &[
                "请求的操作与任务当前状态冲突",
                "运行中的任务无法取消，已结束的任务无法再次取消",
            ],
            ApiError::Scheduler(err) => match err.kind() {
                ErrorKind::Validation => &["请检查请求参数是否符合要求"],
                ErrorKind::Conflict => &["请刷新资源状态后重试"],
                ErrorKind::NotFound => &["请检查请求的资源标识是否正确"],
                ErrorKind::Timeout => &["请稍后重试"],
                _ => &[
                    "系统遇到内部错误，请稍后重试",
                    "查看 GET /health 检查系统状态",
                ],
            },
            ApiError::Json(_) => &["请检查JSON格式是否正确", "确保Content-Type为application/json"],
            ApiError::Query(_) | ApiError::Path(_) | ApiError::BadRequest(_) => {
                &["请检查请求格式和参数"]
            }
            ApiError::NotFound => &["请检查请求URL是否正确"],
            ApiError::Timeout => &["请求处理时间过长，请稍后重试"],
            ApiError::Internal(_) => &[
                "系统遇到内部错误，请稍后重试",
                "如果问题持续存在，请联系系统管理员",
            ],
        };
        hints.iter().map(|hint| hint.to_string()).collect()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("请求处理失败: {}", self);
            "系统内部错误".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": self.error_type(),
                "code": status.as_u16(),
                "suggestions": self.suggestions(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
