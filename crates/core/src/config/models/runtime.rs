use serde::{Deserialize, Serialize};

/// 定时调度器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// 没有即将到期的定义时，驱动循环的最长休眠时间
    pub max_idle_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_idle_ms: 1000,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_idle_ms == 0 {
            return Err(anyhow::anyhow!("调度器休眠间隔必须大于0"));
        }
        Ok(())
    }
}

/// 进度追踪配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// 每个任务保留的历史条数
    pub history_max_per_task: u32,
    pub history_ttl_seconds: u64,
    /// 每个订阅者的邮箱容量
    pub subscriber_buffer: usize,
    pub prune_interval_seconds: u64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            history_max_per_task: 100,
            history_ttl_seconds: 7 * 24 * 3600,
            subscriber_buffer: 64,
            prune_interval_seconds: 300,
        }
    }
}

impl ProgressConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_max_per_task == 0 {
            return Err(anyhow::anyhow!("进度历史保留条数必须大于0"));
        }
        if self.history_ttl_seconds == 0 {
            return Err(anyhow::anyhow!("进度历史保留时间必须大于0"));
        }
        if self.subscriber_buffer == 0 {
            return Err(anyhow::anyhow!("订阅者缓冲区必须大于0"));
        }
        if self.prune_interval_seconds == 0 {
            return Err(anyhow::anyhow!("历史清理间隔必须大于0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// 等待运行中任务完成的最长时间
    pub drain_timeout_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_seconds: 30,
        }
    }
}
