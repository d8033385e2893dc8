//! 队列运行时
//!
//! 每个队列拥有一个内存缓冲区、若干 worker 协程和一个轮询器。
//! 任务先落库再尝试非阻塞地放入缓冲区；缓冲区满或延迟执行的任务
//! 由轮询器按 (priority desc, created_at asc) 从数据库补充。
//! worker 出队后通过数据库条件更新认领任务，认领是唯一的串行化点，
//! 重复入队或多个 worker 竞争同一任务都只会有一个成功。

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use metrics::{counter, histogram};
use taskq_core::{
    config::QueueConfig,
    models::{
        ExecutionOutcome, ExecutionRecord, QueueDescriptor, QueueStats, Task, TaskFilter,
        TaskPage, TaskRequest, TaskStatistics, TaskStatus,
    },
    traits::{ExecutionRepository, TaskRepository, TaskSubmitter},
    Clock, SchedulerError, SchedulerResult,
};
use taskq_infrastructure::with_persistence_retry;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{PushOutcome, QueueBuffer};
use crate::handler::{HandlerRegistry, TaskContext, TaskHandler};
use crate::progress::ProgressTracker;

struct QueueRuntime {
    descriptor: QueueDescriptor,
    buffer: Arc<QueueBuffer>,
}

struct Inner {
    config: QueueConfig,
    task_repo: Arc<dyn TaskRepository>,
    execution_repo: Arc<dyn ExecutionRepository>,
    handlers: Arc<HandlerRegistry>,
    progress: Arc<ProgressTracker>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    queues: RwLock<HashMap<String, Arc<QueueRuntime>>>,
    running: AtomicBool,
    /// 停止 worker 和轮询器接收新任务
    intake: CancellationToken,
    /// 排空超时后通知运行中的处理器退出
    force: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

/// 处理结果分类
enum Outcome {
    Success(serde_json::Value),
    Failure(String),
    Timeout(String),
}

#[derive(Clone)]
pub struct QueueService {
    inner: Arc<Inner>,
}

impl QueueService {
    pub fn new(
        config: QueueConfig,
        task_repo: Arc<dyn TaskRepository>,
        execution_repo: Arc<dyn ExecutionRepository>,
        handlers: Arc<HandlerRegistry>,
        progress: Arc<ProgressTracker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut queues = HashMap::new();
        for declared in &config.queues {
            let descriptor = QueueDescriptor::new(
                declared.name.clone(),
                declared.concurrency.unwrap_or(config.default_concurrency),
                declared.capacity.unwrap_or(config.default_capacity),
            )
            .with_retry_policy(config.retry.clone());
            queues.insert(declared.name.clone(), Arc::new(QueueRuntime::new(descriptor)));
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            inner: Arc::new(Inner {
                config,
                task_repo,
                execution_repo,
                handlers,
                progress,
                clock,
                instance_id: format!("{}-{}", host, std::process::id()),
                queues: RwLock::new(queues),
                running: AtomicBool::new(false),
                intake: CancellationToken::new(),
                force: CancellationToken::new(),
                loops: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn handlers(&self) -> &Arc<HandlerRegistry> {
        &self.inner.handlers
    }

    pub fn progress(&self) -> &Arc<ProgressTracker> {
        &self.inner.progress
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub async fn register_handler(&self, task_type: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.inner.handlers.register(task_type, handler).await;
    }

    pub async fn register_handler_fn<F, Fut>(&self, task_type: impl Into<String>, f: F)
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = SchedulerResult<serde_json::Value>> + Send + 'static,
    {
        self.inner
            .handlers
            .register(task_type, Arc::new(crate::handler::FnHandler::new(f)))
            .await;
    }

    /// 注册队列，使用配置中的默认重试策略
    pub async fn register_queue(
        &self,
        name: &str,
        concurrency: usize,
        capacity: usize,
    ) -> SchedulerResult<QueueDescriptor> {
        let descriptor = QueueDescriptor::new(name, concurrency, capacity)
            .with_retry_policy(self.inner.config.retry.clone());
        self.register_queue_with(descriptor).await
    }

    pub async fn register_queue_with(
        &self,
        descriptor: QueueDescriptor,
    ) -> SchedulerResult<QueueDescriptor> {
        if descriptor.name.trim().is_empty() {
            return Err(SchedulerError::validation("队列名称不能为空"));
        }
        if descriptor.concurrency < 1 {
            return Err(SchedulerError::validation("队列并发数必须大于等于1"));
        }
        if descriptor.capacity < 1 {
            return Err(SchedulerError::validation("队列缓冲区容量必须大于等于1"));
        }
        descriptor
            .retry_policy
            .validate()
            .map_err(SchedulerError::Validation)?;

        let runtime = {
            let mut queues = self.inner.queues.write().await;
            if queues.contains_key(&descriptor.name) {
                return Err(SchedulerError::QueueAlreadyExists {
                    name: descriptor.name,
                });
            }
            let runtime = Arc::new(QueueRuntime::new(descriptor.clone()));
            queues.insert(descriptor.name.clone(), Arc::clone(&runtime));
            runtime
        };

        info!(
            "注册队列 {}: 并发数 {}, 缓冲区容量 {}",
            descriptor.name, descriptor.concurrency, descriptor.capacity
        );
        if self.is_running() {
            Inner::spawn_queue(&self.inner, runtime).await;
        }
        Ok(descriptor)
    }

    /// 启动所有队列。先把上次进程遗留的运行中任务放回待执行。
    pub async fn start(&self) -> SchedulerResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("队列服务已在运行");
            return Ok(());
        }

        let now = self.inner.clock.now();
        let recovered = self.inner.task_repo.recover_running(now).await?;
        if recovered > 0 {
            warn!("恢复了 {} 个上次未完成的运行中任务", recovered);
        }

        let runtimes: Vec<Arc<QueueRuntime>> =
            self.inner.queues.read().await.values().cloned().collect();
        for runtime in runtimes {
            Inner::spawn_queue(&self.inner, runtime).await;
        }
        info!("队列服务已启动，实例 {}", self.inner.instance_id);
        Ok(())
    }

    /// 停止接收新任务，等待运行中的处理器完成；超时后触发取消并中止剩余协程
    pub async fn shutdown(&self, drain_timeout: Duration) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("正在停止队列服务，排空超时 {:?}", drain_timeout);
        self.inner.intake.cancel();

        let mut loops = std::mem::take(&mut *self.inner.loops.lock().await);
        let drained = tokio::time::timeout(
            drain_timeout,
            futures::future::join_all(loops.iter_mut()),
        )
        .await
        .is_ok();

        if !drained {
            warn!("排空超时，取消仍在运行的任务");
            self.inner.force.cancel();
            for handle in &loops {
                handle.abort();
            }
        }
        info!("队列服务已停止");
    }

    pub async fn submit(&self, request: TaskRequest) -> SchedulerResult<Task> {
        Inner::submit(&self.inner, request).await
    }

    pub async fn get_task(&self, id: &str) -> SchedulerResult<Task> {
        self.inner.load_task(id).await
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<TaskPage> {
        let (items, total) = self.inner.task_repo.list(filter).await?;
        Ok(TaskPage {
            items,
            total,
            page: filter.page(),
            page_size: filter.page_size(),
        })
    }

    /// 取消尚未开始执行的任务
    pub async fn cancel(&self, id: &str) -> SchedulerResult<Task> {
        let task = self.inner.load_task(id).await?;
        if !task.status.is_claimable() {
            return Err(SchedulerError::invalid_transition(id, task.status, "cancel"));
        }

        let now = self.inner.clock.now();
        let cancelled =
            with_persistence_retry("取消任务", || self.inner.task_repo.cancel(id, now)).await?;
        if !cancelled {
            // 在读取和更新之间被 worker 认领
            let current = self.inner.load_task(id).await?;
            return Err(SchedulerError::invalid_transition(id, current.status, "cancel"));
        }

        if let Some(runtime) = self.inner.queue(&task.queue).await {
            runtime.buffer.remove(id);
        }
        counter!("taskq_tasks_cancelled_total", "queue" => task.queue.clone()).increment(1);
        info!("任务 {} 已取消", id);
        self.inner.load_task(id).await
    }

    /// 手动重试已失败且仍有重试额度的任务
    pub async fn retry_task(&self, id: &str) -> SchedulerResult<Task> {
        let task = self.inner.load_task(id).await?;
        let now = self.inner.clock.now();
        let requeued = with_persistence_retry("手动重试任务", || {
            self.inner.task_repo.requeue_failed(id, now)
        })
        .await?;
        if !requeued {
            return Err(SchedulerError::invalid_transition(id, task.status, "retry"));
        }

        let task = self.inner.load_task(id).await?;
        if let Some(runtime) = self.inner.queue(&task.queue).await {
            runtime.buffer.try_push(&task);
        }
        info!("任务 {} 已重新加入队列 {}", id, task.queue);
        Ok(task)
    }

    pub async fn get_task_result(&self, id: &str) -> SchedulerResult<serde_json::Value> {
        let task = self.inner.load_task(id).await?;
        if task.status != TaskStatus::Completed {
            return Err(SchedulerError::ResultNotReady { id: task.id });
        }
        Ok(task.result.unwrap_or(serde_json::Value::Null))
    }

    pub async fn list_executions(&self, id: &str) -> SchedulerResult<Vec<ExecutionRecord>> {
        self.inner.load_task(id).await?;
        self.inner.execution_repo.list_by_task(id).await
    }

    pub async fn list_queues(&self) -> Vec<QueueDescriptor> {
        let mut queues: Vec<QueueDescriptor> = self
            .inner
            .queues
            .read()
            .await
            .values()
            .map(|runtime| runtime.descriptor.clone())
            .collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        queues
    }

    pub async fn queue_stats(&self, name: &str) -> SchedulerResult<QueueStats> {
        let runtime = self
            .inner
            .queue(name)
            .await
            .ok_or_else(|| SchedulerError::QueueNotFound {
                name: name.to_string(),
            })?;
        let counts = self.inner.task_repo.count_by_status(Some(name)).await?;

        Ok(QueueStats {
            name: name.to_string(),
            pending: counts.pending,
            running: counts.running,
            completed: counts.completed,
            failed: counts.failed,
            cancelled: counts.cancelled,
            buffer_size: runtime.buffer.len(),
            buffer_capacity: runtime.buffer.capacity(),
            concurrency: runtime.descriptor.concurrency,
        })
    }

    pub async fn task_statistics(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> SchedulerResult<TaskStatistics> {
        if from > to {
            return Err(SchedulerError::validation("统计起始时间不能晚于结束时间"));
        }
        self.inner.task_repo.statistics(from, to).await
    }

    /// 删除更新时间早于 `older_than` 之前的终态任务
    pub async fn cleanup_finished(&self, older_than: chrono::Duration) -> SchedulerResult<u64> {
        let before = self
            .inner
            .clock
            .now()
            .checked_sub_signed(older_than)
            .ok_or_else(|| SchedulerError::validation("清理时间范围超出可表示的时间"))?;
        let deleted = self.inner.task_repo.cleanup_finished(before).await?;
        info!("清理了 {} 个已结束的任务", deleted);
        Ok(deleted)
    }
}

#[async_trait]
impl TaskSubmitter for QueueService {
    async fn submit(&self, request: TaskRequest) -> SchedulerResult<Task> {
        Inner::submit(&self.inner, request).await
    }
}

impl QueueRuntime {
    fn new(descriptor: QueueDescriptor) -> Self {
        let buffer = Arc::new(QueueBuffer::new(descriptor.capacity));
        Self { descriptor, buffer }
    }
}

impl Inner {
    async fn queue(&self, name: &str) -> Option<Arc<QueueRuntime>> {
        self.queues.read().await.get(name).cloned()
    }

    async fn load_task(&self, id: &str) -> SchedulerResult<Task> {
        self.task_repo
            .get_by_id(id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })
    }

    async fn spawn_queue(inner: &Arc<Inner>, runtime: Arc<QueueRuntime>) {
        let mut loops = inner.loops.lock().await;
        for index in 0..runtime.descriptor.concurrency {
            let worker_id = format!(
                "{}-{}-{}",
                inner.instance_id, runtime.descriptor.name, index
            );
            loops.push(tokio::spawn(Inner::run_worker(
                Arc::clone(inner),
                Arc::clone(&runtime),
                worker_id,
            )));
        }
        loops.push(tokio::spawn(Inner::run_poller(
            Arc::clone(inner),
            Arc::clone(&runtime),
        )));
        debug!(
            "队列 {} 启动了 {} 个 worker 和 1 个轮询器",
            runtime.descriptor.name, runtime.descriptor.concurrency
        );
    }

    async fn ensure_queue(inner: &Arc<Inner>, name: &str) -> SchedulerResult<Arc<QueueRuntime>> {
        if let Some(runtime) = inner.queue(name).await {
            return Ok(runtime);
        }

        let runtime = {
            let mut queues = inner.queues.write().await;
            if let Some(runtime) = queues.get(name) {
                return Ok(Arc::clone(runtime));
            }
            let descriptor = QueueDescriptor::new(
                name,
                inner.config.default_concurrency,
                inner.config.default_capacity,
            )
            .with_retry_policy(inner.config.retry.clone());
            let runtime = Arc::new(QueueRuntime::new(descriptor));
            queues.insert(name.to_string(), Arc::clone(&runtime));
            runtime
        };

        info!("自动注册队列 {}", name);
        if inner.running.load(Ordering::SeqCst) {
            Inner::spawn_queue(inner, Arc::clone(&runtime)).await;
        }
        Ok(runtime)
    }

    async fn submit(inner: &Arc<Inner>, request: TaskRequest) -> SchedulerResult<Task> {
        if request.task_type.trim().is_empty() {
            return Err(SchedulerError::validation("任务类型不能为空"));
        }
        if request.queue.trim().is_empty() {
            return Err(SchedulerError::validation("队列名称不能为空"));
        }
        let max_retries = request
            .max_retries
            .unwrap_or(inner.config.default_max_retries);
        if max_retries < 0 {
            return Err(SchedulerError::validation("最大重试次数不能为负数"));
        }
        let timeout = request
            .timeout
            .unwrap_or(inner.config.default_timeout_seconds);
        if timeout <= 0 {
            return Err(SchedulerError::validation("超时时间必须大于0"));
        }
        if matches!(request.delay_seconds, Some(delay) if delay < 0) {
            return Err(SchedulerError::validation("延迟秒数不能为负数"));
        }

        let now = inner.clock.now();
        let scheduled_at = match (request.scheduled_at, request.delay_seconds) {
            (Some(at), _) => at,
            (None, Some(delay)) => chrono::Duration::try_seconds(delay)
                .and_then(|delay| now.checked_add_signed(delay))
                .ok_or_else(|| SchedulerError::validation(format!("延迟秒数超出范围: {delay}")))?,
            (None, None) => now,
        };

        let runtime = Inner::ensure_queue(inner, &request.queue).await?;

        let task = Task {
            id: uuid::Uuid::new_v4().to_string(),
            task_type: request.task_type,
            queue: request.queue,
            status: TaskStatus::Pending,
            priority: request.priority,
            payload: request.payload,
            retry_count: 0,
            max_retries,
            timeout,
            scheduled_at,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
            progress: 0,
            progress_message: None,
            worker_id: None,
            owner_id: request.owner_id,
            project_id: request.project_id,
        };

        let task = with_persistence_retry("保存任务", || inner.task_repo.create(&task)).await?;
        counter!("taskq_tasks_submitted_total", "queue" => task.queue.clone()).increment(1);

        if task.scheduled_at <= now {
            match runtime.buffer.try_push(&task) {
                PushOutcome::Queued | PushOutcome::Duplicate => {}
                PushOutcome::Full => {
                    debug!("队列 {} 缓冲区已满，任务 {} 等待轮询", task.queue, task.id);
                }
            }
        } else {
            debug!("任务 {} 延迟到 {} 执行", task.id, task.scheduled_at);
        }

        info!(
            "提交任务 {} (类型: {}, 队列: {}, 优先级: {})",
            task.id, task.task_type, task.queue, task.priority
        );
        Ok(task)
    }

    async fn run_worker(inner: Arc<Inner>, runtime: Arc<QueueRuntime>, worker_id: String) {
        debug!("worker {} 已启动", worker_id);
        loop {
            let task_id = tokio::select! {
                _ = inner.intake.cancelled() => break,
                task_id = runtime.buffer.pop() => task_id,
            };
            inner.process(&runtime, &worker_id, &task_id).await;
        }
        debug!("worker {} 已停止", worker_id);
    }

    async fn run_poller(inner: Arc<Inner>, runtime: Arc<QueueRuntime>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(inner.config.poll_interval_ms.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = inner.intake.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = inner.poll_queue(&runtime).await {
                        warn!("轮询队列 {} 失败: {}", runtime.descriptor.name, e);
                    }
                }
            }
        }
        debug!("队列 {} 的轮询器已停止", runtime.descriptor.name);
    }

    async fn poll_queue(&self, runtime: &QueueRuntime) -> SchedulerResult<usize> {
        let remaining = runtime.buffer.remaining();
        if remaining == 0 {
            return Ok(0);
        }

        let ready = self
            .task_repo
            .fetch_ready(&runtime.descriptor.name, self.clock.now(), remaining as i64)
            .await?;
        let mut queued = 0;
        for task in &ready {
            if runtime.buffer.try_push(task) == PushOutcome::Queued {
                queued += 1;
            }
        }
        if queued > 0 {
            debug!("轮询器向队列 {} 补充了 {} 个任务", runtime.descriptor.name, queued);
        }
        Ok(queued)
    }

    async fn process(&self, runtime: &QueueRuntime, worker_id: &str, task_id: &str) {
        let claimed_at = self.clock.now();
        let task = match with_persistence_retry("认领任务", || {
            self.task_repo.claim(task_id, worker_id, claimed_at)
        })
        .await
        {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!("任务 {} 已被认领或不再就绪，跳过", task_id);
                return;
            }
            Err(e) => {
                error!("认领任务 {} 失败: {}", task_id, e);
                return;
            }
        };

        debug!(
            "worker {} 开始执行任务 {} (第 {} 次尝试)",
            worker_id,
            task.id,
            task.attempt()
        );

        let Some(handler) = self.handlers.get(&task.task_type).await else {
            let error = SchedulerError::HandlerNotFound {
                task_type: task.task_type.clone(),
            };
            warn!("任务 {} 没有可用的处理器: {}", task.id, error);
            self.finish_failed(&task, worker_id, claimed_at, &error.to_string(), ExecutionOutcome::Failed)
                .await;
            return;
        };

        let cancellation = self.force.child_token();
        let ctx = TaskContext {
            task: task.clone(),
            worker_id: worker_id.to_string(),
            cancellation: cancellation.clone(),
            progress: self.progress.reporter(task.id.clone()),
        };

        let execution = AssertUnwindSafe(handler.handle(ctx)).catch_unwind();
        let outcome = match tokio::time::timeout(task.timeout_duration(), execution).await {
            Ok(Ok(Ok(value))) => Outcome::Success(value),
            Ok(Ok(Err(e))) => Outcome::Failure(e.to_string()),
            Ok(Err(panic)) => Outcome::Failure(format!("处理器发生panic: {}", panic_message(&*panic))),
            Err(_) => {
                cancellation.cancel();
                Outcome::Timeout(
                    SchedulerError::ExecutionTimeout {
                        timeout_seconds: task.timeout,
                    }
                    .to_string(),
                )
            }
        };

        let finished_at = self.clock.now();
        let elapsed = (finished_at - claimed_at).num_milliseconds().max(0) as f64 / 1000.0;
        histogram!("taskq_task_execution_duration_seconds", "queue" => runtime.descriptor.name.clone())
            .record(elapsed);

        // 处理器返回后进度已全部落库，释放内存记录
        self.progress.forget(&task.id).await;

        match outcome {
            Outcome::Success(value) => {
                self.finish_success(&task, worker_id, claimed_at, value).await;
            }
            Outcome::Failure(message) => {
                self.handle_failure(runtime, &task, worker_id, claimed_at, message, ExecutionOutcome::Failed)
                    .await;
            }
            Outcome::Timeout(message) => {
                warn!("任务 {} 执行超时 ({}秒)", task.id, task.timeout);
                self.handle_failure(runtime, &task, worker_id, claimed_at, message, ExecutionOutcome::Timeout)
                    .await;
            }
        }
    }

    async fn finish_success(
        &self,
        task: &Task,
        worker_id: &str,
        started_at: DateTime<Utc>,
        value: serde_json::Value,
    ) {
        let record = ExecutionRecord::new(
            &task.id,
            worker_id,
            task.attempt(),
            ExecutionOutcome::Success,
            started_at,
            self.clock.now(),
        );
        match with_persistence_retry("完成任务", || {
            self.task_repo.complete(&task.id, Some(&value), &record)
        })
        .await
        {
            Ok(true) => {
                counter!("taskq_task_executions_total", "outcome" => "success").increment(1);
                info!("任务 {} 执行成功，耗时 {}ms", task.id, record.duration_ms);
            }
            Ok(false) => debug!("任务 {} 已不在运行状态，忽略完成结果", task.id),
            Err(e) => error!("保存任务 {} 的完成状态失败: {}", task.id, e),
        }
    }

    async fn handle_failure(
        &self,
        runtime: &QueueRuntime,
        task: &Task,
        worker_id: &str,
        started_at: DateTime<Utc>,
        message: String,
        outcome: ExecutionOutcome,
    ) {
        if !task.can_retry() {
            let exhausted = SchedulerError::RetriesExhausted {
                id: task.id.clone(),
                attempts: task.attempt(),
                message,
            };
            self.finish_failed(task, worker_id, started_at, &exhausted.to_string(), outcome)
                .await;
            return;
        }

        let retry_count = task.retry_count + 1;
        let delay = runtime
            .descriptor
            .retry_policy
            .delay_with_jitter(retry_count as u32);
        let now = self.clock.now();
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = ExecutionRecord::new(
            &task.id,
            worker_id,
            task.attempt(),
            outcome,
            started_at,
            now,
        )
        .with_error(message.clone());

        match with_persistence_retry("安排任务重试", || {
            self.task_repo
                .schedule_retry(&task.id, retry_count, retry_at, &message, &record)
        })
        .await
        {
            Ok(true) => {
                counter!("taskq_task_executions_total", "outcome" => outcome.as_str()).increment(1);
                counter!("taskq_task_retries_total", "queue" => task.queue.clone()).increment(1);
                warn!(
                    "任务 {} 第 {} 次执行失败，{}ms 后重试: {}",
                    task.id,
                    task.attempt(),
                    delay.as_millis(),
                    message
                );
            }
            Ok(false) => debug!("任务 {} 已不在运行状态，忽略失败结果", task.id),
            Err(e) => error!("保存任务 {} 的重试状态失败: {}", task.id, e),
        }
    }

    async fn finish_failed(
        &self,
        task: &Task,
        worker_id: &str,
        started_at: DateTime<Utc>,
        message: &str,
        outcome: ExecutionOutcome,
    ) {
        let record = ExecutionRecord::new(
            &task.id,
            worker_id,
            task.attempt(),
            outcome,
            started_at,
            self.clock.now(),
        )
        .with_error(message);

        match with_persistence_retry("标记任务失败", || {
            self.task_repo.fail(&task.id, message, &record)
        })
        .await
        {
            Ok(true) => {
                counter!("taskq_task_executions_total", "outcome" => outcome.as_str()).increment(1);
                error!("任务 {} 最终失败: {}", task.id, message);
            }
            Ok(false) => debug!("任务 {} 已不在运行状态，忽略失败结果", task.id),
            Err(e) => error!("保存任务 {} 的失败状态失败: {}", task.id, e),
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知错误".to_string()
    }
}
