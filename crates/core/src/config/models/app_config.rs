use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    queue::QueueConfig,
    runtime::{ProgressConfig, SchedulerConfig, ShutdownConfig},
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub scheduler: SchedulerConfig,
    pub progress: ProgressConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    pub shutdown: ShutdownConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: TASKQ_, nesting: `__`)
    ///
    /// An explicit `config_path` must exist; without one the default
    /// locations are tried and silently skipped when absent.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = AppConfig::default();
        let mut builder = ConfigBuilder::builder()
            .set_default("database.url", defaults.database.url.as_str())?
            .set_default("database.max_connections", defaults.database.max_connections as i64)?
            .set_default(
                "database.connection_timeout_seconds",
                defaults.database.connection_timeout_seconds as i64,
            )?
            .set_default(
                "queue.default_concurrency",
                defaults.queue.default_concurrency as i64,
            )?
            .set_default("queue.default_capacity", defaults.queue.default_capacity as i64)?
            .set_default(
                "queue.default_timeout_seconds",
                defaults.queue.default_timeout_seconds,
            )?
            .set_default("queue.default_max_retries", defaults.queue.default_max_retries as i64)?
            .set_default("queue.poll_interval_ms", defaults.queue.poll_interval_ms as i64)?
            .set_default("scheduler.enabled", defaults.scheduler.enabled)?
            .set_default("scheduler.max_idle_ms", defaults.scheduler.max_idle_ms as i64)?
            .set_default(
                "progress.history_max_per_task",
                defaults.progress.history_max_per_task as i64,
            )?
            .set_default(
                "progress.history_ttl_seconds",
                defaults.progress.history_ttl_seconds as i64,
            )?
            .set_default(
                "progress.subscriber_buffer",
                defaults.progress.subscriber_buffer as i64,
            )?
            .set_default(
                "progress.prune_interval_seconds",
                defaults.progress.prune_interval_seconds as i64,
            )?
            .set_default("api.enabled", defaults.api.enabled)?
            .set_default("api.bind_address", defaults.api.bind_address.as_str())?
            .set_default("api.cors_enabled", defaults.api.cors_enabled)?
            .set_default(
                "api.request_timeout_seconds",
                defaults.api.request_timeout_seconds as i64,
            )?
            .set_default("observability.log_level", defaults.observability.log_level.as_str())?
            .set_default(
                "observability.log_format",
                defaults.observability.log_format.as_str(),
            )?
            .set_default(
                "observability.metrics_enabled",
                defaults.observability.metrics_enabled,
            )?
            .set_default(
                "shutdown.drain_timeout_seconds",
                defaults.shutdown.drain_timeout_seconds as i64,
            )?;

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = ["config/taskq.toml", "taskq.toml", "/etc/taskq/config.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("TASKQ")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    /// Validate configuration effectiveness
    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.queue.validate().context("队列配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.progress.validate().context("进度追踪配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}
