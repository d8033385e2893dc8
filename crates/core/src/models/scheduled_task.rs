use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 定时任务定义
///
/// 由 cron 表达式驱动的任务模板，每次触发都会生成一个新的 [`Task`](super::Task)。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTaskDefinition {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub task_type: String,
    pub payload_template: serde_json::Value,
    pub target_queue: String,
    pub priority: i32,
    pub is_active: bool,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub run_count: i64,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 创建定时任务的请求
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledTaskRequest {
    pub name: String,
    #[serde(alias = "cron", alias = "cron_expr")]
    pub cron_expression: String,
    #[serde(alias = "type")]
    pub task_type: String,
    #[serde(default, alias = "payload")]
    pub payload_template: serde_json::Value,
    #[serde(alias = "queue", alias = "queue_name")]
    pub target_queue: String,
    #[serde(default)]
    pub priority: i32,
}

impl ScheduledTaskRequest {
    pub fn new(
        name: impl Into<String>,
        cron_expression: impl Into<String>,
        task_type: impl Into<String>,
        target_queue: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            cron_expression: cron_expression.into(),
            task_type: task_type.into(),
            payload_template: serde_json::Value::Null,
            target_queue: target_queue.into(),
            priority: 0,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload_template = payload;
        self
    }
}

/// 更新定时任务的请求，未提供的字段保持不变
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScheduledTaskUpdate {
    #[serde(default, alias = "cron", alias = "cron_expr")]
    pub cron_expression: Option<String>,
    #[serde(default, alias = "type")]
    pub task_type: Option<String>,
    #[serde(default, alias = "payload")]
    pub payload_template: Option<serde_json::Value>,
    #[serde(default, alias = "queue", alias = "queue_name")]
    pub target_queue: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
}

/// 调度器统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub total_definitions: usize,
    pub active_definitions: usize,
    pub paused_definitions: usize,
    pub registered: usize,
    pub running_since: Option<DateTime<Utc>>,
}
