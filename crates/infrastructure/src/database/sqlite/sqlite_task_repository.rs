use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use taskq_core::{
    models::{ExecutionRecord, Task, TaskCounts, TaskFilter, TaskStatistics, TaskStatus},
    traits::TaskRepository,
    SchedulerResult,
};
use tracing::{debug, info, instrument};

use super::{insert_execution, json_to_text, text_to_json};

const TASK_COLUMNS: &str = "id, task_type, queue, status, priority, payload, retry_count, \
     max_retries, timeout_seconds, scheduled_at, created_at, updated_at, started_at, \
     completed_at, last_error, result, progress, progress_message, worker_id, owner_id, project_id";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let payload: String = row.try_get("payload")?;
        let result: Option<String> = row.try_get("result")?;
        Ok(Task {
            id: row.try_get("id")?,
            task_type: row.try_get("task_type")?,
            queue: row.try_get("queue")?,
            status: row.try_get("status")?,
            priority: row.try_get("priority")?,
            payload: text_to_json(&payload)?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            timeout: row.try_get("timeout_seconds")?,
            scheduled_at: row.try_get("scheduled_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            last_error: row.try_get("last_error")?,
            result: result.as_deref().map(text_to_json).transpose()?,
            progress: row.try_get("progress")?,
            progress_message: row.try_get("progress_message")?,
            worker_id: row.try_get("worker_id")?,
            owner_id: row.try_get("owner_id")?,
            project_id: row.try_get("project_id")?,
        })
    }

    fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, filter: &'a TaskFilter) {
        builder.push(" WHERE 1 = 1");
        if let Some(queue) = &filter.queue {
            builder.push(" AND queue = ").push_bind(queue);
        }
        if let Some(task_type) = &filter.task_type {
            builder.push(" AND task_type = ").push_bind(task_type);
        }
        if let Some(status) = filter.status {
            // retrying 不落库，查询时等价于重试过的 pending 任务
            if status == TaskStatus::Retrying {
                builder
                    .push(" AND status = ")
                    .push_bind(TaskStatus::Pending)
                    .push(" AND retry_count > 0");
            } else {
                builder.push(" AND status = ").push_bind(status);
            }
        }
        if let Some(owner_id) = &filter.owner_id {
            builder.push(" AND owner_id = ").push_bind(owner_id);
        }
        if let Some(project_id) = &filter.project_id {
            builder.push(" AND project_id = ").push_bind(project_id);
        }
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id, queue = %task.queue))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let result = task.result.as_ref().map(json_to_text).transpose()?;
        let sql = format!(
            "INSERT INTO tasks ({TASK_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        );
        sqlx::query(&sql)
            .bind(&task.id)
            .bind(&task.task_type)
            .bind(&task.queue)
            .bind(task.status)
            .bind(task.priority)
            .bind(json_to_text(&task.payload)?)
            .bind(task.retry_count)
            .bind(task.max_retries)
            .bind(task.timeout)
            .bind(task.scheduled_at)
            .bind(task.created_at)
            .bind(task.updated_at)
            .bind(task.started_at)
            .bind(task.completed_at)
            .bind(&task.last_error)
            .bind(result)
            .bind(task.progress)
            .bind(&task.progress_message)
            .bind(&task.worker_id)
            .bind(&task.owner_id)
            .bind(&task.project_id)
            .execute(&self.pool)
            .await?;

        debug!("创建任务成功: {} ({})", task.id, task.task_type);
        Ok(task.clone())
    }

    #[instrument(skip(self))]
    async fn get_by_id(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<(Vec<Task>, i64)> {
        let mut count_query = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM tasks");
        Self::push_filters(&mut count_query, filter);
        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await?
            .try_get("total")?;

        let mut query = QueryBuilder::<Sqlite>::new(format!("SELECT {TASK_COLUMNS} FROM tasks"));
        Self::push_filters(&mut query, filter);
        query
            .push(" ORDER BY created_at DESC, rowid DESC LIMIT ")
            .push_bind(filter.page_size() as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset() as i64);

        let rows = query.build().fetch_all(&self.pool).await?;
        let tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<SchedulerResult<Vec<_>>>()?;
        Ok((tasks, total))
    }

    #[instrument(skip(self))]
    async fn fetch_ready(
        &self,
        queue: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<Task>> {
        let sql = format!(
            "SELECT {TASK_COLUMNS} FROM tasks \
             WHERE queue = ? AND status = ? AND scheduled_at <= ? \
             ORDER BY priority DESC, created_at ASC, rowid ASC \
             LIMIT ?"
        );
        let rows = sqlx::query(&sql)
            .bind(queue)
            .bind(TaskStatus::Pending)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self))]
    async fn claim(
        &self,
        id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Task>> {
        let sql = format!(
            "UPDATE tasks SET status = ?, worker_id = ?, started_at = ?, updated_at = ? \
             WHERE id = ? AND status IN (?, ?) AND scheduled_at <= ? \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(TaskStatus::Running)
            .bind(worker_id)
            .bind(now)
            .bind(now)
            .bind(id)
            .bind(TaskStatus::Pending)
            .bind(TaskStatus::Retrying)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                debug!("Worker {} 认领任务 {}", worker_id, id);
                Ok(Some(Self::row_to_task(&row)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, result, execution))]
    async fn complete(
        &self,
        id: &str,
        result: Option<&serde_json::Value>,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool> {
        let result = result.map(json_to_text).transpose()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ?, result = ?, \
             progress = 100, last_error = NULL \
             WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Completed)
        .bind(execution.completed_at)
        .bind(execution.completed_at)
        .bind(result)
        .bind(id)
        .bind(TaskStatus::Running)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            debug!("任务 {} 不在运行状态，忽略重复的完成信号", id);
            return Ok(false);
        }

        insert_execution(&mut *tx, execution).await?;
        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, error, execution))]
    async fn schedule_retry(
        &self,
        id: &str,
        retry_count: i32,
        scheduled_at: DateTime<Utc>,
        error: &str,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, retry_count = ?, scheduled_at = ?, last_error = ?, \
             updated_at = ?, worker_id = NULL \
             WHERE id = ? AND status = ? AND retry_count < max_retries",
        )
        .bind(TaskStatus::Pending)
        .bind(retry_count)
        .bind(scheduled_at)
        .bind(error)
        .bind(execution.completed_at)
        .bind(id)
        .bind(TaskStatus::Running)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_execution(&mut *tx, execution).await?;
        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self, error, execution))]
    async fn fail(
        &self,
        id: &str,
        error: &str,
        execution: &ExecutionRecord,
    ) -> SchedulerResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, last_error = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status = ?",
        )
        .bind(TaskStatus::Failed)
        .bind(error)
        .bind(execution.completed_at)
        .bind(execution.completed_at)
        .bind(id)
        .bind(TaskStatus::Running)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        insert_execution(&mut *tx, execution).await?;
        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, completed_at = ?, updated_at = ? \
             WHERE id = ? AND status IN (?, ?)",
        )
        .bind(TaskStatus::Cancelled)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(TaskStatus::Pending)
        .bind(TaskStatus::Retrying)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn requeue_failed(&self, id: &str, now: DateTime<Utc>) -> SchedulerResult<bool> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, scheduled_at = ?, updated_at = ?, completed_at = NULL, \
             last_error = NULL WHERE id = ? AND status = ? AND retry_count < max_retries",
        )
        .bind(TaskStatus::Pending)
        .bind(now)
        .bind(now)
        .bind(id)
        .bind(TaskStatus::Failed)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn recover_running(&self, now: DateTime<Utc>) -> SchedulerResult<u64> {
        let updated = sqlx::query(
            "UPDATE tasks SET status = ?, worker_id = NULL, updated_at = ? WHERE status = ?",
        )
        .bind(TaskStatus::Pending)
        .bind(now)
        .bind(TaskStatus::Running)
        .execute(&self.pool)
        .await?;

        let recovered = updated.rows_affected();
        if recovered > 0 {
            info!("恢复了 {} 个中断的运行中任务", recovered);
        }
        Ok(recovered)
    }

    #[instrument(skip(self, message))]
    async fn update_progress(
        &self,
        id: &str,
        percent: i32,
        message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let updated = sqlx::query(
            "UPDATE tasks SET progress = ?, progress_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(percent)
        .bind(message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(updated.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self, queue: Option<&str>) -> SchedulerResult<TaskCounts> {
        let mut query =
            QueryBuilder::<Sqlite>::new("SELECT status, COUNT(*) AS count FROM tasks");
        if let Some(queue) = queue {
            query.push(" WHERE queue = ").push_bind(queue);
        }
        query.push(" GROUP BY status");

        let rows = query.build().fetch_all(&self.pool).await?;
        let mut counts = TaskCounts::default();
        for row in &rows {
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.add(status, count);
        }
        Ok(counts)
    }

    #[instrument(skip(self))]
    async fn statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<TaskStatistics> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count FROM tasks \
             WHERE created_at >= ? AND created_at <= ? GROUP BY status",
        )
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = TaskCounts::default();
        for row in &rows {
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.add(status, count);
        }

        let avg_duration_ms: Option<f64> = sqlx::query(
            "SELECT AVG(e.duration_ms) AS avg_duration FROM task_executions e \
             JOIN tasks t ON t.id = e.task_id \
             WHERE t.created_at >= ? AND t.created_at <= ?",
        )
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await?
        .try_get("avg_duration")?;

        let finished = counts.completed + counts.failed;
        let success_rate = if finished > 0 {
            counts.completed as f64 / finished as f64
        } else {
            0.0
        };

        Ok(TaskStatistics {
            total: counts.total(),
            counts,
            success_rate,
            avg_duration_ms: avg_duration_ms.unwrap_or(0.0),
        })
    }

    #[instrument(skip(self))]
    async fn cleanup_finished(&self, before: DateTime<Utc>) -> SchedulerResult<u64> {
        let mut tx = self.pool.begin().await?;
        let finished = "SELECT id FROM tasks WHERE status IN (?, ?, ?) AND updated_at < ?";

        for table in ["task_executions", "progress_history"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE task_id IN ({finished})"))
                .bind(TaskStatus::Completed)
                .bind(TaskStatus::Failed)
                .bind(TaskStatus::Cancelled)
                .bind(before)
                .execute(&mut *tx)
                .await?;
        }

        let deleted = sqlx::query(&format!("DELETE FROM tasks WHERE id IN ({finished})"))
            .bind(TaskStatus::Completed)
            .bind(TaskStatus::Failed)
            .bind(TaskStatus::Cancelled)
            .bind(before)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        if deleted > 0 {
            info!("清理了 {} 个已结束的任务", deleted);
        }
        Ok(deleted)
    }
}
