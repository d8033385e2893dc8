use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// 队列描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueDescriptor {
    pub name: String,
    /// worker 数量
    pub concurrency: usize,
    /// 内存缓冲区容量
    pub capacity: usize,
    pub retry_policy: RetryPolicy,
}

impl QueueDescriptor {
    pub fn new(name: impl Into<String>, concurrency: usize, capacity: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            capacity,
            retry_policy: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }
}

/// 队列统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: i64,
    pub running: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub buffer_size: usize,
    pub buffer_capacity: usize,
    pub concurrency: usize,
}
