//! 任务进度追踪
//!
//! 同一任务的进度按 `updated_at` 做 last-write-wins：比当前记录更旧的更新直接丢弃，
//! 与调用顺序无关。内存中没有记录时（任务结束后或进程重启后）以持久化的最新历史为准。每条被接受的更新会写回任务行、追加进度历史，
//! 然后异步分发给订阅者。每个订阅者拥有独立的有界邮箱和消费协程，
//! 慢订阅者或 panic 的回调不会影响其他订阅者和更新方。

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use taskq_core::{
    config::ProgressConfig,
    models::ProgressRecord,
    traits::{ProgressRepository, TaskRepository},
    Clock, SchedulerError, SchedulerResult,
};
use taskq_infrastructure::with_persistence_retry;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 订阅目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionTarget {
    Task(String),
    /// 通配，接收所有任务的进度
    All,
}

impl SubscriptionTarget {
    fn matches(&self, task_id: &str) -> bool {
        match self {
            SubscriptionTarget::Task(id) => id == task_id,
            SubscriptionTarget::All => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// 单个任务的最新记录，锁贯穿比较与落库
type Slot = Arc<Mutex<Option<ProgressRecord>>>;

struct Subscriber {
    target: SubscriptionTarget,
    mailbox: mpsc::Sender<ProgressRecord>,
    consumer: JoinHandle<()>,
}

pub struct ProgressTracker {
    task_repo: Arc<dyn TaskRepository>,
    history_repo: Arc<dyn ProgressRepository>,
    clock: Arc<dyn Clock>,
    config: ProgressConfig,
    records: Mutex<HashMap<String, Slot>>,
    subscribers: RwLock<HashMap<SubscriptionId, Subscriber>>,
    next_subscription: AtomicU64,
}

impl ProgressTracker {
    pub fn new(
        task_repo: Arc<dyn TaskRepository>,
        history_repo: Arc<dyn ProgressRepository>,
        clock: Arc<dyn Clock>,
        config: ProgressConfig,
    ) -> Self {
        Self {
            task_repo,
            history_repo,
            clock,
            config,
            records: Mutex::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// 以当前时间更新进度，返回该更新是否被接受
    pub async fn update_progress(
        &self,
        task_id: &str,
        percent: i32,
        message: &str,
    ) -> SchedulerResult<bool> {
        let record = ProgressRecord::new(task_id, percent, message, self.clock.now());
        self.apply(record).await
    }

    pub async fn update_progress_with_steps(
        &self,
        task_id: &str,
        current_step: &str,
        completed_steps: i32,
        total_steps: i32,
        message: &str,
    ) -> SchedulerResult<bool> {
        if total_steps < 0 || completed_steps < 0 {
            return Err(SchedulerError::validation("步骤数不能为负数"));
        }
        let record = ProgressRecord::with_steps(
            task_id,
            current_step,
            completed_steps,
            total_steps,
            message,
            self.clock.now(),
        );
        self.apply(record).await
    }

    /// 应用一条自带时间戳的进度记录
    pub async fn apply(&self, mut record: ProgressRecord) -> SchedulerResult<bool> {
        record.percent = record.percent.clamp(0, 100);

        {
            let slot = self.slot(&record.task_id).await;
            let mut current = slot.lock().await;
            if current.is_none() {
                *current = self.history_repo.latest(&record.task_id).await?;
            }
            if let Some(current) = current.as_ref() {
                if record.is_older_than(current) {
                    debug!(
                        "丢弃任务 {} 的过期进度: {} < {}",
                        record.task_id, record.updated_at, current.updated_at
                    );
                    return Ok(false);
                }
            }

            let updated = with_persistence_retry("写入进度快照", || {
                self.task_repo.update_progress(
                    &record.task_id,
                    record.percent,
                    &record.message,
                    record.updated_at,
                )
            })
            .await?;
            if !updated {
                drop(current);
                self.records.lock().await.remove(&record.task_id);
                return Err(SchedulerError::TaskNotFound {
                    id: record.task_id.clone(),
                });
            }

            with_persistence_retry("追加进度历史", || {
                self.history_repo
                    .append(&record, self.config.history_max_per_task)
            })
            .await?;

            *current = Some(record.clone());
        }

        self.dispatch(&record).await;
        Ok(true)
    }

    async fn slot(&self, task_id: &str) -> Slot {
        let mut records = self.records.lock().await;
        Arc::clone(records.entry(task_id.to_string()).or_default())
    }

    async fn dispatch(&self, record: &ProgressRecord) {
        let subscribers = self.subscribers.read().await;
        for (id, subscriber) in subscribers.iter() {
            if !subscriber.target.matches(&record.task_id) {
                continue;
            }
            match subscriber.mailbox.try_send(record.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("订阅者 {} 的邮箱已满，丢弃任务 {} 的进度更新", id, record.task_id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("订阅者 {} 已关闭", id);
                }
            }
        }
    }

    /// 订阅进度更新，回调在订阅者自己的协程中依次执行
    pub async fn subscribe<F, Fut>(&self, target: SubscriptionTarget, callback: F) -> SubscriptionId
    where
        F: Fn(ProgressRecord) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (mailbox, mut inbox) = mpsc::channel::<ProgressRecord>(self.config.subscriber_buffer.max(1));

        let consumer = tokio::spawn(async move {
            while let Some(record) = inbox.recv().await {
                let task_id = record.task_id.clone();
                let delivery = AssertUnwindSafe(async { callback(record).await }).catch_unwind();
                if delivery.await.is_err() {
                    error!("订阅者 {} 处理任务 {} 的进度时发生panic", id, task_id);
                }
            }
        });

        debug!("新增进度订阅 {}: {:?}", id, target);
        self.subscribers.write().await.insert(
            id,
            Subscriber {
                target,
                mailbox,
                consumer,
            },
        );
        id
    }

    /// 取消订阅，已投递到邮箱的更新仍会被处理完
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.write().await.remove(&id) {
            Some(_) => {
                debug!("取消进度订阅 {}", id);
                true
            }
            None => false,
        }
    }

    /// 获取最新进度：内存 → 进度历史 → 任务行快照
    pub async fn get_progress(&self, task_id: &str) -> SchedulerResult<ProgressRecord> {
        let slot = self.records.lock().await.get(task_id).cloned();
        if let Some(slot) = slot {
            if let Some(record) = slot.lock().await.as_ref() {
                return Ok(record.clone());
            }
        }

        let task = self
            .task_repo
            .get_by_id(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })?;

        if let Some(record) = self.history_repo.latest(task_id).await? {
            return Ok(record);
        }

        Ok(ProgressRecord::new(
            task_id,
            task.progress,
            task.progress_message.unwrap_or_default(),
            task.updated_at,
        ))
    }

    pub async fn get_history(&self, task_id: &str, limit: u32) -> SchedulerResult<Vec<ProgressRecord>> {
        let limit = limit.clamp(1, self.config.history_max_per_task.max(1));
        self.history_repo.history(task_id, limit).await
    }

    pub async fn clear_history(&self, task_id: &str) -> SchedulerResult<u64> {
        let deleted = self.history_repo.clear(task_id).await?;
        info!("清除任务 {} 的进度历史 {} 条", task_id, deleted);
        Ok(deleted)
    }

    /// 删除超过保留期的历史
    pub async fn prune_history(&self) -> SchedulerResult<u64> {
        let cutoff = i64::try_from(self.config.history_ttl_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|ttl| self.clock.now().checked_sub_signed(ttl));
        // 保留期超出可表示的时间范围时没有任何历史过期
        let Some(cutoff) = cutoff else {
            return Ok(0);
        };
        let deleted = self.history_repo.prune_before(cutoff).await?;
        if deleted > 0 {
            info!("清理过期进度历史 {} 条", deleted);
        }
        Ok(deleted)
    }

    /// 任务结束后释放内存中的记录，之后的查询走持久化数据
    pub async fn forget(&self, task_id: &str) {
        self.records.lock().await.remove(task_id);
    }

    /// 启动定期清理历史的维护循环
    pub fn start_maintenance(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = Duration::from_secs(self.config.prune_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            info!("进度维护循环已启动，间隔 {:?}", period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = tracker.prune_history().await {
                            warn!("清理进度历史失败: {}", e);
                        }
                    }
                }
            }
            info!("进度维护循环已停止");
        })
    }

    /// 停止所有订阅者的消费协程
    pub async fn close(&self) {
        let mut subscribers = self.subscribers.write().await;
        for (_, subscriber) in subscribers.drain() {
            subscriber.consumer.abort();
        }
    }

    pub fn reporter(self: &Arc<Self>, task_id: impl Into<String>) -> ProgressReporter {
        ProgressReporter {
            tracker: Arc::clone(self),
            task_id: task_id.into(),
        }
    }
}

/// 交给处理器使用的进度上报句柄
#[derive(Clone)]
pub struct ProgressReporter {
    tracker: Arc<ProgressTracker>,
    task_id: String,
}

impl ProgressReporter {
    pub async fn report(&self, percent: i32, message: &str) -> SchedulerResult<bool> {
        self.tracker
            .update_progress(&self.task_id, percent, message)
            .await
    }

    pub async fn report_steps(
        &self,
        current_step: &str,
        completed_steps: i32,
        total_steps: i32,
        message: &str,
    ) -> SchedulerResult<bool> {
        self.tracker
            .update_progress_with_steps(
                &self.task_id,
                current_step,
                completed_steps,
                total_steps,
                message,
            )
            .await
    }
}
