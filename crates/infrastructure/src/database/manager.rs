use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use taskq_core::{
    traits::{ExecutionRepository, ProgressRepository, ScheduledTaskRepository, TaskRepository},
    Result, SchedulerError,
};
use tracing::info;

use super::sqlite::{
    SqliteExecutionRepository, SqliteProgressRepository, SqliteScheduledTaskRepository,
    SqliteTaskRepository,
};

/// Unified database manager
///
/// 持有唯一的连接池，负责建表迁移并构造各个仓储实例。
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// Create new database manager and run migrations
    pub async fn new(url: &str, max_connections: u32) -> Result<Self> {
        Self::with_timeout(url, max_connections, Duration::from_secs(30)).await
    }

    pub async fn with_timeout(
        url: &str,
        max_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(SchedulerError::Database)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存数据库每个连接都是独立的库，只能使用单连接并保持常驻
        let pool_options = if in_memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(acquire_timeout)
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        let manager = Self { pool };
        manager.migrate().await?;
        info!("数据库连接已建立: {}", url);
        Ok(manager)
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SchedulerError::Persistence(format!("数据库迁移失败: {e}")))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn execution_repository(&self) -> Arc<dyn ExecutionRepository> {
        Arc::new(SqliteExecutionRepository::new(self.pool.clone()))
    }

    pub fn scheduled_task_repository(&self) -> Arc<dyn ScheduledTaskRepository> {
        Arc::new(SqliteScheduledTaskRepository::new(self.pool.clone()))
    }

    pub fn progress_repository(&self) -> Arc<dyn ProgressRepository> {
        Arc::new(SqliteProgressRepository::new(self.pool.clone()))
    }
}
