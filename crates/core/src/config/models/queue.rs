use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// 队列运行时配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub default_concurrency: usize,
    pub default_capacity: usize,
    pub default_timeout_seconds: i64,
    pub default_max_retries: i32,
    pub poll_interval_ms: u64,
    pub retry: RetryPolicy,
    /// 启动时预先注册的队列
    pub queues: Vec<PredeclaredQueue>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            default_capacity: 1000,
            default_timeout_seconds: 30 * 60,
            default_max_retries: 3,
            poll_interval_ms: 1000,
            retry: RetryPolicy::default(),
            queues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredeclaredQueue {
    pub name: String,
    pub concurrency: Option<usize>,
    pub capacity: Option<usize>,
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_concurrency == 0 {
            return Err(anyhow::anyhow!("默认并发数必须大于0"));
        }

        if self.default_capacity == 0 {
            return Err(anyhow::anyhow!("默认缓冲区容量必须大于0"));
        }

        if self.default_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("默认超时时间必须大于0"));
        }

        if self.default_max_retries < 0 {
            return Err(anyhow::anyhow!("默认最大重试次数不能为负数"));
        }

        if self.poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        self.retry
            .validate()
            .map_err(|e| anyhow::anyhow!("重试策略无效: {e}"))?;

        let mut names = std::collections::HashSet::new();
        for queue in &self.queues {
            if queue.name.trim().is_empty() {
                return Err(anyhow::anyhow!("预定义队列名称不能为空"));
            }
            if !names.insert(queue.name.as_str()) {
                return Err(anyhow::anyhow!("预定义队列名称重复: {}", queue.name));
            }
            if queue.concurrency == Some(0) || queue.capacity == Some(0) {
                return Err(anyhow::anyhow!(
                    "队列 {} 的并发数和容量必须大于0",
                    queue.name
                ));
            }
        }

        Ok(())
    }
}
