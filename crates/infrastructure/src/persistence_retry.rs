//! 存储层短时重试
//!
//! 状态迁移写库遇到连接池超时、数据库繁忙等暂时性错误时，
//! 在本地以很短的退避重试几次，仍失败则以 `Persistence` 错误返回给调用方。

use std::future::Future;
use std::time::Duration;

use taskq_core::{SchedulerError, SchedulerResult};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct PersistenceRetry {
    /// 首次调用之外的重试次数
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for PersistenceRetry {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

impl PersistenceRetry {
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient_persistence() => {
                    if attempt > self.max_retries {
                        return Err(SchedulerError::Persistence(format!(
                            "{operation} 在重试 {} 次后仍然失败: {e}",
                            self.max_retries
                        )));
                    }
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        "{} 失败（第 {} 次），{}ms 后重试: {}",
                        operation,
                        attempt,
                        delay.as_millis(),
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// 使用默认参数执行：最多重试3次，间隔依次为 50ms/100ms/200ms
pub async fn with_persistence_retry<T, F, Fut>(operation: &str, f: F) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    PersistenceRetry::default().run(operation, f).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_persistence_retry("更新任务状态", || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SchedulerError::Database(sqlx::Error::PoolTimedOut))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_persistence_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: SchedulerResult<()> = with_persistence_retry("更新任务状态", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::Database(sqlx::Error::PoolTimedOut))
            }
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::Persistence(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_from_base_delay() {
        let started = tokio::time::Instant::now();
        let result: SchedulerResult<()> = with_persistence_retry("写入进度快照", || async {
            Err(SchedulerError::Database(sqlx::Error::PoolTimedOut))
        })
        .await;

        assert!(result.is_err());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(50 + 100 + 200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    }

    #[tokio::test]
    async fn test_non_transient_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: SchedulerResult<()> = with_persistence_retry("查询任务", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SchedulerError::TaskNotFound { id: "x".into() })
            }
        })
        .await;

        assert!(matches!(result, Err(SchedulerError::TaskNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
