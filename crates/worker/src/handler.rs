use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use taskq_core::{models::Task, SchedulerResult};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::progress::ProgressReporter;

/// 处理器执行上下文
///
/// 超时或强制停机时 `cancellation` 会被触发，长时间运行的处理器应在
/// 适当的位置检查它并尽快返回。
pub struct TaskContext {
    pub task: Task,
    pub worker_id: String,
    pub cancellation: CancellationToken,
    pub progress: ProgressReporter,
}

impl TaskContext {
    pub fn payload(&self) -> &serde_json::Value {
        &self.task.payload
    }
}

/// 任务处理器
///
/// 按任务类型注册。返回 `Ok(value)` 时 `value` 会作为任务结果保存，
/// 返回错误则交由重试策略处理。
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> SchedulerResult<serde_json::Value>;
}

/// 闭包形式的处理器
pub struct FnHandler<F> {
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = SchedulerResult<serde_json::Value>> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync,
    Fut: Future<Output = SchedulerResult<serde_json::Value>> + Send,
{
    async fn handle(&self, ctx: TaskContext) -> SchedulerResult<serde_json::Value> {
        (self.f)(ctx).await
    }
}

/// 任务类型到处理器的映射，重复注册时后者覆盖前者
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let task_type = task_type.into();
        let mut handlers = self.handlers.write().await;
        if handlers.insert(task_type.clone(), handler).is_some() {
            info!("覆盖已注册的任务处理器: {}", task_type);
        } else {
            info!("注册任务处理器: {}", task_type);
        }
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    /// 已注册的任务类型，按名称排序
    pub async fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(&'static str);

    #[async_trait]
    impl TaskHandler for Constant {
        async fn handle(&self, _ctx: TaskContext) -> SchedulerResult<serde_json::Value> {
            Ok(serde_json::json!(self.0))
        }
    }

    #[tokio::test]
    async fn test_last_registration_wins() {
        let registry = HandlerRegistry::new();
        registry.register("echo", Arc::new(Constant("first"))).await;
        registry.register("echo", Arc::new(Constant("second"))).await;
        registry
            .register("sleep", Arc::new(FnHandler::new(|_ctx| async { Ok(serde_json::Value::Null) })))
            .await;

        assert!(registry.get("echo").await.is_some());
        assert!(registry.get("missing").await.is_none());
        assert_eq!(registry.task_types().await, vec!["echo", "sleep"]);
    }
}
