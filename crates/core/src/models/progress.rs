use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 任务进度记录
///
/// 每个任务在内存中只保留最新的一条，历史副本追加到 progress_history。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub task_id: String,
    /// 完成百分比 (0-100)
    pub percent: i32,
    pub current_step: Option<String>,
    pub completed_steps: i32,
    pub total_steps: i32,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl ProgressRecord {
    pub fn new(
        task_id: impl Into<String>,
        percent: i32,
        message: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            percent: percent.clamp(0, 100),
            current_step: None,
            completed_steps: 0,
            total_steps: 0,
            message: message.into(),
            updated_at,
        }
    }

    /// 根据步骤计算百分比
    pub fn with_steps(
        task_id: impl Into<String>,
        current_step: impl Into<String>,
        completed_steps: i32,
        total_steps: i32,
        message: impl Into<String>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        let percent = if total_steps > 0 {
            (completed_steps.max(0) as i64 * 100 / total_steps as i64) as i32
        } else {
            0
        };
        Self {
            task_id: task_id.into(),
            percent: percent.clamp(0, 100),
            current_step: Some(current_step.into()),
            completed_steps,
            total_steps,
            message: message.into(),
            updated_at,
        }
    }

    /// 严格早于已有记录的更新会被丢弃
    pub fn is_older_than(&self, other: &ProgressRecord) -> bool {
        self.updated_at < other.updated_at
    }
}
