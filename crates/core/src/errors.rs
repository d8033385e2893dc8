use std::fmt;

use thiserror::Error;

use crate::models::TaskStatus;

/// 任务队列与调度引擎的错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("任务 {id} 尚未完成，无法获取结果")]
    ResultNotReady { id: String },

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("队列未找到: {name}")]
    QueueNotFound { name: String },

    #[error("定时任务未找到: {name}")]
    ScheduledTaskNotFound { name: String },

    #[error("未注册的任务处理器: {task_type}")]
    HandlerNotFound { task_type: String },

    #[error("队列已存在: {name}")]
    QueueAlreadyExists { name: String },

    #[error("定时任务已存在: {name}")]
    ScheduledTaskAlreadyExists { name: String },

    #[error("任务 {id} 当前状态为 {status}，不允许执行 {action}")]
    InvalidTransition {
        id: String,
        status: TaskStatus,
        action: &'static str,
    },

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务 {id} 重试 {attempts} 次后仍然失败: {message}")]
    RetriesExhausted {
        id: String,
        attempts: i32,
        message: String,
    },

    #[error("任务执行超时 ({timeout_seconds}秒)")]
    ExecutionTimeout { timeout_seconds: i64 },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("持久化失败: {0}")]
    Persistence(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误分类，对外暴露稳定的错误码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    TransientExecution,
    TerminalExecution,
    Timeout,
    Persistence,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::TransientExecution => "TRANSIENT_EXECUTION_ERROR",
            ErrorKind::TerminalExecution => "TERMINAL_EXECUTION_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Persistence => "PERSISTENCE_ERROR",
            ErrorKind::Internal => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SchedulerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SchedulerError::Validation(_)
            | SchedulerError::InvalidCron { .. }
            | SchedulerError::ResultNotReady { .. } => ErrorKind::Validation,
            SchedulerError::TaskNotFound { .. }
            | SchedulerError::QueueNotFound { .. }
            | SchedulerError::ScheduledTaskNotFound { .. }
            | SchedulerError::HandlerNotFound { .. } => ErrorKind::NotFound,
            SchedulerError::QueueAlreadyExists { .. }
            | SchedulerError::ScheduledTaskAlreadyExists { .. }
            | SchedulerError::InvalidTransition { .. } => ErrorKind::Conflict,
            SchedulerError::TaskExecution(_) => ErrorKind::TransientExecution,
            SchedulerError::RetriesExhausted { .. } => ErrorKind::TerminalExecution,
            SchedulerError::ExecutionTimeout { .. } => ErrorKind::Timeout,
            SchedulerError::Database(_) | SchedulerError::Persistence(_) => {
                ErrorKind::Persistence
            }
            SchedulerError::Serialization(_)
            | SchedulerError::Configuration(_)
            | SchedulerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// 稳定的错误码
    pub fn code(&self) -> &'static str {
        self.kind().as_str()
    }

    pub fn validation(message: impl Into<String>) -> Self {
        SchedulerError::Validation(message.into())
    }

    pub fn invalid_transition(id: &str, status: TaskStatus, action: &'static str) -> Self {
        SchedulerError::InvalidTransition {
            id: id.to_string(),
            status,
            action,
        }
    }

    /// 是否为可以在本地重试的存储层错误
    pub fn is_transient_persistence(&self) -> bool {
        match self {
            SchedulerError::Database(e) => match e {
                sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db) => {
                    let message = db.message().to_ascii_lowercase();
                    message.contains("locked") || message.contains("busy")
                }
                _ => false,
            },
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_classification() {
        assert_eq!(
            SchedulerError::validation("缺少字段").kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            SchedulerError::TaskNotFound { id: "t1".into() }.kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SchedulerError::HandlerNotFound {
                task_type: "video".into()
            }
            .kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            SchedulerError::invalid_transition("t1", TaskStatus::Running, "取消").kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            SchedulerError::ExecutionTimeout { timeout_seconds: 5 }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            SchedulerError::Persistence("down".into()).kind(),
            ErrorKind::Persistence
        );
    }

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            SchedulerError::QueueAlreadyExists {
                name: "reports".into()
            }
            .code(),
            "CONFLICT"
        );
        assert_eq!(
            SchedulerError::ResultNotReady { id: "t1".into() }.code(),
            "VALIDATION_ERROR"
        );
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        let err = SchedulerError::Database(sqlx::Error::PoolTimedOut);
        assert!(err.is_transient_persistence());
        assert!(!SchedulerError::Database(sqlx::Error::RowNotFound).is_transient_persistence());
    }
}
