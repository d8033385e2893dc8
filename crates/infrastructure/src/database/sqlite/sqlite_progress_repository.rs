use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use taskq_core::{models::ProgressRecord, traits::ProgressRepository, SchedulerResult};
use tracing::{debug, instrument};

const PROGRESS_COLUMNS: &str =
    "task_id, percent, current_step, completed_steps, total_steps, message, updated_at";

pub struct SqliteProgressRepository {
    pool: SqlitePool,
}

impl SqliteProgressRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_progress(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<ProgressRecord> {
        Ok(ProgressRecord {
            task_id: row.try_get("task_id")?,
            percent: row.try_get("percent")?,
            current_step: row.try_get("current_step")?,
            completed_steps: row.try_get("completed_steps")?,
            total_steps: row.try_get("total_steps")?,
            message: row.try_get("message")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ProgressRepository for SqliteProgressRepository {
    #[instrument(skip(self, record), fields(task_id = %record.task_id, percent = record.percent))]
    async fn append(&self, record: &ProgressRecord, keep: u32) -> SchedulerResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO progress_history ({PROGRESS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&record.task_id)
        .bind(record.percent)
        .bind(&record.current_step)
        .bind(record.completed_steps)
        .bind(record.total_steps)
        .bind(&record.message)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;

        let pruned = sqlx::query(
            "DELETE FROM progress_history WHERE task_id = ? AND id NOT IN ( \
                 SELECT id FROM progress_history WHERE task_id = ? \
                 ORDER BY updated_at DESC, id DESC LIMIT ?)",
        )
        .bind(&record.task_id)
        .bind(&record.task_id)
        .bind(keep as i64)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        tx.commit().await?;
        if pruned > 0 {
            debug!("任务 {} 的进度历史超出上限，删除 {} 条", record.task_id, pruned);
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn history(&self, task_id: &str, limit: u32) -> SchedulerResult<Vec<ProgressRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {PROGRESS_COLUMNS} FROM progress_history WHERE task_id = ? \
             ORDER BY updated_at DESC, id DESC LIMIT ?"
        ))
        .bind(task_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_progress).collect()
    }

    #[instrument(skip(self))]
    async fn latest(&self, task_id: &str) -> SchedulerResult<Option<ProgressRecord>> {
        Ok(self.history(task_id, 1).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn clear(&self, task_id: &str) -> SchedulerResult<u64> {
        let deleted = sqlx::query("DELETE FROM progress_history WHERE task_id = ?")
            .bind(task_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn prune_before(&self, before: DateTime<Utc>) -> SchedulerResult<u64> {
        let deleted = sqlx::query("DELETE FROM progress_history WHERE updated_at < ?")
            .bind(before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted)
    }
}
