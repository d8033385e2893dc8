pub mod sqlite_execution_repository;
pub mod sqlite_progress_repository;
pub mod sqlite_scheduled_task_repository;
pub mod sqlite_task_repository;

pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_progress_repository::SqliteProgressRepository;
pub use sqlite_scheduled_task_repository::SqliteScheduledTaskRepository;
pub use sqlite_task_repository::SqliteTaskRepository;

use taskq_core::{models::ExecutionRecord, SchedulerError, SchedulerResult};

pub(crate) fn json_to_text(value: &serde_json::Value) -> SchedulerResult<String> {
    serde_json::to_string(value).map_err(|e| SchedulerError::Serialization(e.to_string()))
}

pub(crate) fn text_to_json(text: &str) -> SchedulerResult<serde_json::Value> {
    serde_json::from_str(text).map_err(|e| SchedulerError::Serialization(e.to_string()))
}

/// 在给定的连接（通常是事务）上写入执行记录
pub(crate) async fn insert_execution(
    conn: &mut sqlx::SqliteConnection,
    record: &ExecutionRecord,
) -> SchedulerResult<()> {
    sqlx::query(
        r#"
        INSERT INTO task_executions (id, task_id, worker_id, attempt, outcome, duration_ms,
                                     error, started_at, completed_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.task_id)
    .bind(&record.worker_id)
    .bind(record.attempt)
    .bind(record.outcome)
    .bind(record.duration_ms)
    .bind(&record.error)
    .bind(record.started_at)
    .bind(record.completed_at)
    .execute(conn)
    .await
    .map_err(SchedulerError::Database)?;
    Ok(())
}
