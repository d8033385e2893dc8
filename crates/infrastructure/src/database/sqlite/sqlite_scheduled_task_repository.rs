use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use taskq_core::{
    models::ScheduledTaskDefinition, traits::ScheduledTaskRepository, SchedulerError,
    SchedulerResult,
};
use tracing::{debug, instrument};

use super::{json_to_text, text_to_json};

const DEFINITION_COLUMNS: &str = "id, name, cron_expression, task_type, payload_template, \
     target_queue, priority, is_active, next_run_at, last_run_at, run_count, last_error, \
     created_at, updated_at";

pub struct SqliteScheduledTaskRepository {
    pool: SqlitePool,
}

impl SqliteScheduledTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_definition(
        row: &sqlx::sqlite::SqliteRow,
    ) -> SchedulerResult<ScheduledTaskDefinition> {
        let payload_template: String = row.try_get("payload_template")?;
        Ok(ScheduledTaskDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            cron_expression: row.try_get("cron_expression")?,
            task_type: row.try_get("task_type")?,
            payload_template: text_to_json(&payload_template)?,
            target_queue: row.try_get("target_queue")?,
            priority: row.try_get("priority")?,
            is_active: row.try_get("is_active")?,
            next_run_at: row.try_get("next_run_at")?,
            last_run_at: row.try_get("last_run_at")?,
            run_count: row.try_get("run_count")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl ScheduledTaskRepository for SqliteScheduledTaskRepository {
    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn create(&self, definition: &ScheduledTaskDefinition) -> SchedulerResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO scheduled_task_definitions ({DEFINITION_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&definition.id)
        .bind(&definition.name)
        .bind(&definition.cron_expression)
        .bind(&definition.task_type)
        .bind(json_to_text(&definition.payload_template)?)
        .bind(&definition.target_queue)
        .bind(definition.priority)
        .bind(definition.is_active)
        .bind(definition.next_run_at)
        .bind(definition.last_run_at)
        .bind(definition.run_count)
        .bind(&definition.last_error)
        .bind(definition.created_at)
        .bind(definition.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {
                debug!("创建定时任务定义成功: {}", definition.name);
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(SchedulerError::ScheduledTaskAlreadyExists {
                    name: definition.name.clone(),
                })
            }
            Err(e) => Err(SchedulerError::Database(e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_by_name(&self, name: &str) -> SchedulerResult<Option<ScheduledTaskDefinition>> {
        let row = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_task_definitions WHERE name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_definition).transpose()
    }

    #[instrument(skip(self))]
    async fn list(&self) -> SchedulerResult<Vec<ScheduledTaskDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_task_definitions ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_definition).collect()
    }

    #[instrument(skip(self))]
    async fn list_active(&self) -> SchedulerResult<Vec<ScheduledTaskDefinition>> {
        let rows = sqlx::query(&format!(
            "SELECT {DEFINITION_COLUMNS} FROM scheduled_task_definitions \
             WHERE is_active = 1 ORDER BY name ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_definition).collect()
    }

    #[instrument(skip(self, definition), fields(name = %definition.name))]
    async fn update(&self, definition: &ScheduledTaskDefinition) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduled_task_definitions \
             SET cron_expression = ?, task_type = ?, payload_template = ?, target_queue = ?, \
                 priority = ?, is_active = ?, next_run_at = ?, last_run_at = ?, run_count = ?, \
                 last_error = ?, updated_at = ? \
             WHERE name = ?",
        )
        .bind(&definition.cron_expression)
        .bind(&definition.task_type)
        .bind(json_to_text(&definition.payload_template)?)
        .bind(&definition.target_queue)
        .bind(definition.priority)
        .bind(definition.is_active)
        .bind(definition.next_run_at)
        .bind(definition.last_run_at)
        .bind(definition.run_count)
        .bind(&definition.last_error)
        .bind(definition.updated_at)
        .bind(&definition.name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::ScheduledTaskNotFound {
                name: definition.name.clone(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, name: &str) -> SchedulerResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_task_definitions WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, last_error))]
    async fn record_run(
        &self,
        name: &str,
        ran_at: DateTime<Utc>,
        next_run_at: Option<DateTime<Utc>>,
        last_error: Option<&str>,
    ) -> SchedulerResult<()> {
        let result = sqlx::query(
            "UPDATE scheduled_task_definitions \
             SET last_run_at = ?, next_run_at = COALESCE(?, next_run_at), \
                 run_count = run_count + 1, last_error = ?, updated_at = ? \
             WHERE name = ?",
        )
        .bind(ran_at)
        .bind(next_run_at)
        .bind(last_error)
        .bind(ran_at)
        .bind(name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(SchedulerError::ScheduledTaskNotFound {
                name: name.to_string(),
            });
        }
        Ok(())
    }
}
