use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务
///
/// 队列中的最小工作单元。任务只通过状态迁移操作修改，
/// 运行中的任务不会被删除。
///
/// # 字段说明
///
/// - `id`: 创建时分配的唯一标识 (UUID)
/// - `task_type`: 选择处理器的类型键
/// - `queue`: 所属队列，生命周期内不变
/// - `priority`: 优先级，数值越大越先执行
/// - `scheduled_at`: 最早可出队时间
/// - `result`: 处理器成功时返回的结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub queue: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub payload: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    /// 执行超时（秒）
    pub timeout: i64,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    pub progress: i32,
    pub progress_message: Option<String>,
    pub worker_id: Option<String>,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
}

impl Task {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 是否还允许再次重试
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn timeout_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout.max(1) as u64)
    }

    /// 本次执行的尝试序号（从1开始）
    pub fn attempt(&self) -> i32 {
        self.retry_count + 1
    }
}

/// 任务状态
///
/// `Pending → Running → {Completed | Retrying → Pending | Failed | Cancelled}`
///
/// `Retrying` 只是对外展示的过渡标签，不会被持久化：
/// 失败后可以重试的任务直接回到 `Pending` 并推迟 `scheduled_at`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Retrying => "retrying",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 可以被 worker 认领或被取消的状态
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Retrying)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "retrying" => Ok(TaskStatus::Retrying),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TaskStatus>().map_err(Into::into)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 任务提交请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    #[serde(rename = "type", alias = "task_type")]
    pub task_type: String,
    #[serde(default, alias = "queue_name")]
    pub queue: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// 为空时使用配置中的默认值
    #[serde(default)]
    pub max_retries: Option<i32>,
    /// 超时秒数，为空时使用配置中的默认值
    #[serde(default)]
    pub timeout: Option<i64>,
    /// 延迟执行秒数
    #[serde(default)]
    pub delay_seconds: Option<i64>,
    /// 指定最早执行时间，优先于 `delay_seconds`
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl TaskRequest {
    pub fn new(task_type: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            queue: queue.into(),
            payload: serde_json::Value::Null,
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: i64) -> Self {
        self.timeout = Some(timeout_seconds);
        self
    }

    pub fn with_delay(mut self, delay_seconds: i64) -> Self {
        self.delay_seconds = Some(delay_seconds);
        self
    }

    pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }
}

/// 任务查询过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskFilter {
    pub queue: Option<String>,
    #[serde(rename = "type")]
    pub task_type: Option<String>,
    pub status: Option<TaskStatus>,
    pub owner_id: Option<String>,
    pub project_id: Option<String>,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl TaskFilter {
    pub const DEFAULT_PAGE_SIZE: u32 = 20;
    pub const MAX_PAGE_SIZE: u32 = 100;

    pub fn page(&self) -> u32 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
            .unwrap_or(Self::DEFAULT_PAGE_SIZE)
            .clamp(1, Self::MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> u32 {
        (self.page() - 1) * self.page_size()
    }
}

/// 一页查询结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPage {
    pub items: Vec<Task>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}

/// 按状态统计的任务数量
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl TaskCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.running + self.completed + self.failed + self.cancelled
    }

    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Pending | TaskStatus::Retrying => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Completed => self.completed += count,
            TaskStatus::Failed => self.failed += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }
}

/// 时间段内的任务统计
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total: i64,
    pub counts: TaskCounts,
    /// 已结束任务中的成功比例 (0.0 - 1.0)
    pub success_rate: f64,
    pub avg_duration_ms: f64,
}
