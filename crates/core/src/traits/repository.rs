//! 数据仓储层接口定义
//!
//! - `TaskRepository`: 任务及其状态迁移
//! - `ExecutionRepository`: 执行审计记录
//! - `ScheduledTaskRepository`: 定时任务定义
//! - `ProgressRepository`: 进度历史
//!
//! 所有状态迁移都是基于当前状态的条件更新，返回值表示迁移是否真正发生，
//! 重复调用不会产生副作用。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        ExecutionRecord, ProgressRecord, ScheduledTaskDefinition, Task, TaskCounts, TaskFilter,
        TaskStatistics,
    },
    SchedulerResult,
};

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>>;

    /// 分页查询，返回 (当前页, 总数)
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<(Vec<Task>, i64)>;

    /// 查询已就绪的待执行任务，按 (priority desc, created_at asc) 排序
    async fn fetch_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<Task>>;

    /// 原子认领: 仅当任务仍为 pending/retrying 且 scheduled_at <= now 时迁移为 running
    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>>;

    /// running → completed，同一事务内追加执行记录
    async fn complete(
        &self,
        id: &str,
        result: Option<&serde_json::Value>,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool>;

    /// running → pending，推迟可见时间
    async fn schedule_retry(
        &self,
        id: &str,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool>;

    /// running → failed
    async fn fail(
        &self,
        id: &str,
        error: &str,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool>;

    /// pending/retrying → cancelled
    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<bool>;

    /// 手动重试: failed 且 retry_count < max_retries 时回到 pending
    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<bool>;

    /// 启动恢复: 上个进程遗留的 running 任务回到 pending，返回受影响数量
    async fn recover_running(&self, now: DateTime<Utc>) -> SchedulerResult<u64>;

    async fn update_progress(
        &self,
        id: &str,
        percent: i32,
        message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn count_by_status(&self, queue: Option<&str>) -> SchedulerResult<TaskCounts>;

    async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<TaskStatistics>;

    /// 删除早于指定时间的终态任务及其关联数据
    async fn cleanup_finished(&self, before: DateTime<Utc>) -> SchedulerResult<u64>;
}

/// 执行记录仓储接口
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn create(&self, record: &ExecutionRecord) -> SchedulerResult<()>;

    /// 按执行时间正序返回
    async fn list_by_task(&self, task_id: &str) -> SchedulerResult<Vec<ExecutionRecord>>;
}

/// 定时任务定义仓储接口
#[async_trait]
pub trait ScheduledTaskRepository: Send + Sync {
    async fn create(&self, definition: &ScheduledTaskDefinition) -> SchedulerResult<()>;

    async fn get_by_name(&self, name: &str) -> SchedulerResult<Option<ScheduledTaskDefinition>>;

    /// 按名称排序
    async fn list(&self) -> SchedulerResult<Vec<ScheduledTaskDefinition>>;

    async fn list_active(&self) -> SchedulerResult<Vec<ScheduledTaskDefinition>>;

    async fn update(&self, definition: &ScheduledTaskDefinition) -> SchedulerResult<()>;

    async fn delete(&self, name: &str) -> SchedulerResult<bool>;

    /// 记录一次触发结果，`next_run_at` 为空表示保持不变
    async fn record_run(
        &self,
        name: &str,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> SchedulerResult<()>;
}

/// 进度历史仓储接口
#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// 追加一条历史，并只保留该任务最新的 `keep` 条
    async fn append(&self, record: &ProgressRecord, keep: u32) -> SchedulerResult<()>;

    /// 按更新时间倒序返回
    async fn history(&self, task_id: &str, limit: u32) -> SchedulerResult<Vec<ProgressRecord>>;

    async fn latest(&self, task_id: &str) -> SchedulerResult<Option<ProgressRecord>>;

    async fn clear(&self, task_id: &str) -> SchedulerResult<u64>;

    async fn prune_before(&self, before: DateTime<Utc>) -> SchedulerResult<u64>;
}
