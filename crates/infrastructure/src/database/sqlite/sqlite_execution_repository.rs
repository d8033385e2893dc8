use async_trait::async_trait;
use sqlx::{Row, SqlitePool};
use taskq_core::{models::ExecutionRecord, traits::ExecutionRepository, SchedulerResult};
use tracing::instrument;

use super::insert_execution;

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ExecutionRecord> {
        Ok(ExecutionRecord {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            worker_id: row.try_get("worker_id")?,
            attempt: row.try_get("attempt")?,
            outcome: row.try_get("outcome")?,
            duration_ms: row.try_get("duration_ms")?,
            error: row.try_get("error")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
        })
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, record), fields(task_id = %record.task_id, outcome = %record.outcome))]
    async fn create(&self, record: &ExecutionRecord) -> SchedulerResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_execution(&mut *conn, record).await
    }

    #[instrument(skip(self))]
    async fn list_by_task(&self, task_id: &str) -> SchedulerResult<Vec<ExecutionRecord>> {
        let rows = sqlx::query(
            "SELECT id, task_id, worker_id, attempt, outcome, duration_ms, error, started_at, \
             completed_at FROM task_executions WHERE task_id = ? ORDER BY rowid ASC",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_execution).collect()
    }
}
