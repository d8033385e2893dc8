//! 定时任务调度
//!
//! 每个启用的定义在内存中持有一个触发登记（CRON + 下次触发时间）。
//! 单个驱动协程休眠到最早的触发时间、登记变化或停机，然后触发所有到期的登记。
//! 触发失败只记录到定义的 `last_error`，不会影响后续触发。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use taskq_core::{
    config::SchedulerConfig,
    models::{
        ScheduledTaskDefinition, ScheduledTaskRequest, ScheduledTaskUpdate, SchedulerStats, Task,
        TaskRequest,
    },
    traits::{ScheduledTaskRepository, TaskSubmitter},
    Clock, SchedulerError, SchedulerResult,
};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cron_utils::CronScheduler;

struct Registration {
    schedule: CronScheduler,
    definition: ScheduledTaskDefinition,
    next_fire: DateTime<Utc>,
}

struct Inner {
    repo: Arc<dyn ScheduledTaskRepository>,
    submitter: Arc<dyn TaskSubmitter>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    /// 所有对登记表和定义的修改都在此锁内完成，触发与更新不会交错
    registrations: Mutex<HashMap<String, Registration>>,
    changed: Notify,
    running_since: RwLock<Option<DateTime<Utc>>>,
    driver: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct ScheduledTaskService {
    inner: Arc<Inner>,
}

impl ScheduledTaskService {
    pub fn new(
        repo: Arc<dyn ScheduledTaskRepository>,
        submitter: Arc<dyn TaskSubmitter>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                repo,
                submitter,
                clock,
                config,
                registrations: Mutex::new(HashMap::new()),
                changed: Notify::new(),
                running_since: RwLock::new(None),
                driver: Mutex::new(None),
            }),
        }
    }

    pub async fn create_definition(
        &self,
        request: ScheduledTaskRequest,
    ) -> SchedulerResult<ScheduledTaskDefinition> {
        validate_required(&request.name, "定时任务名称")?;
        validate_required(&request.task_type, "任务类型")?;
        validate_required(&request.target_queue, "目标队列")?;
        let schedule = CronScheduler::new(&request.cron_expression)?;

        let now = self.inner.clock.now();
        let next_fire = next_fire_after(&schedule, now)?;
        let definition = ScheduledTaskDefinition {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name.trim().to_string(),
            cron_expression: schedule.expression().to_string(),
            task_type: request.task_type,
            payload_template: request.payload_template,
            target_queue: request.target_queue,
            priority: request.priority,
            is_active: true,
            next_run_at: Some(next_fire),
            last_run_at: None,
            run_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        };

        {
            let mut registrations = self.inner.registrations.lock().await;
            self.inner.repo.create(&definition).await?;
            registrations.insert(
                definition.name.clone(),
                Registration {
                    schedule,
                    definition: definition.clone(),
                    next_fire,
                },
            );
        }
        self.inner.changed.notify_one();

        info!(
            "创建定时任务 {} ({}), 下次执行时间 {}",
            definition.name, definition.cron_expression, next_fire
        );
        Ok(definition)
    }

    /// 更新定义，新旧登记在同一临界区内替换
    pub async fn update_definition(
        &self,
        name: &str,
        update: ScheduledTaskUpdate,
    ) -> SchedulerResult<ScheduledTaskDefinition> {
        let mut registrations = self.inner.registrations.lock().await;
        let mut definition = self.inner.load(name).await?;

        if let Some(task_type) = update.task_type {
            validate_required(&task_type, "任务类型")?;
            definition.task_type = task_type;
        }
        if let Some(target_queue) = update.target_queue {
            validate_required(&target_queue, "目标队列")?;
            definition.target_queue = target_queue;
        }
        if let Some(payload) = update.payload_template {
            definition.payload_template = payload;
        }
        if let Some(priority) = update.priority {
            definition.priority = priority;
        }
        let schedule = CronScheduler::new(
            update
                .cron_expression
                .as_deref()
                .unwrap_or(&definition.cron_expression),
        )?;
        definition.cron_expression = schedule.expression().to_string();

        let now = self.inner.clock.now();
        definition.updated_at = now;
        let next_fire = if definition.is_active {
            Some(next_fire_after(&schedule, now)?)
        } else {
            None
        };
        definition.next_run_at = next_fire;

        self.inner.repo.update(&definition).await?;
        match next_fire {
            Some(next_fire) => {
                registrations.insert(
                    definition.name.clone(),
                    Registration {
                        schedule,
                        definition: definition.clone(),
                        next_fire,
                    },
                );
            }
            None => {
                registrations.remove(name);
            }
        }
        drop(registrations);
        self.inner.changed.notify_one();

        info!("更新定时任务 {}", name);
        Ok(definition)
    }

    pub async fn delete_definition(&self, name: &str) -> SchedulerResult<()> {
        let mut registrations = self.inner.registrations.lock().await;
        if !self.inner.repo.delete(name).await? {
            return Err(SchedulerError::ScheduledTaskNotFound {
                name: name.to_string(),
            });
        }
        registrations.remove(name);
        drop(registrations);
        self.inner.changed.notify_one();

        info!("删除定时任务 {}", name);
        Ok(())
    }

    /// 暂停：注销触发登记但保留定义
    pub async fn pause(&self, name: &str) -> SchedulerResult<ScheduledTaskDefinition> {
        let mut registrations = self.inner.registrations.lock().await;
        let mut definition = self.inner.load(name).await?;
        if !definition.is_active {
            return Ok(definition);
        }

        definition.is_active = false;
        definition.next_run_at = None;
        definition.updated_at = self.inner.clock.now();
        self.inner.repo.update(&definition).await?;
        registrations.remove(name);
        drop(registrations);
        self.inner.changed.notify_one();

        info!("暂停定时任务 {}", name);
        Ok(definition)
    }

    /// 恢复：从当前时间重新计算下次执行时间
    pub async fn resume(&self, name: &str) -> SchedulerResult<ScheduledTaskDefinition> {
        let mut registrations = self.inner.registrations.lock().await;
        let mut definition = self.inner.load(name).await?;
        if definition.is_active {
            return Ok(definition);
        }

        let schedule = CronScheduler::new(&definition.cron_expression)?;
        let now = self.inner.clock.now();
        let next_fire = next_fire_after(&schedule, now)?;
        definition.is_active = true;
        definition.next_run_at = Some(next_fire);
        definition.updated_at = now;
        self.inner.repo.update(&definition).await?;
        registrations.insert(
            name.to_string(),
            Registration {
                schedule,
                definition: definition.clone(),
                next_fire,
            },
        );
        drop(registrations);
        self.inner.changed.notify_one();

        info!("恢复定时任务 {}, 下次执行时间 {}", name, next_fire);
        Ok(definition)
    }

    /// 立即触发一次，不改变下次执行时间
    pub async fn run_now(&self, name: &str) -> SchedulerResult<Task> {
        let _registrations = self.inner.registrations.lock().await;
        let definition = self.inner.load(name).await?;
        let now = self.inner.clock.now();

        let result = self.inner.fire(&definition).await;
        let last_error = result.as_ref().err().map(|e| e.to_string());
        self.inner
            .repo
            .record_run(name, now, None, last_error.as_deref())
            .await?;

        match &result {
            Ok(task) => info!("手动触发定时任务 {}，提交任务 {}", name, task.id),
            Err(e) => warn!("手动触发定时任务 {} 失败: {}", name, e),
        }
        result
    }

    pub async fn get(&self, name: &str) -> SchedulerResult<ScheduledTaskDefinition> {
        self.inner.load(name).await
    }

    pub async fn list(&self) -> SchedulerResult<Vec<ScheduledTaskDefinition>> {
        self.inner.repo.list().await
    }

    pub async fn stats(&self) -> SchedulerResult<SchedulerStats> {
        let definitions = self.inner.repo.list().await?;
        let active = definitions.iter().filter(|d| d.is_active).count();
        Ok(SchedulerStats {
            total_definitions: definitions.len(),
            active_definitions: active,
            paused_definitions: definitions.len() - active,
            registered: self.inner.registrations.lock().await.len(),
            running_since: *self.inner.running_since.read().await,
        })
    }

    /// 加载所有启用的定义并启动驱动协程。停机期间错过的触发不会补跑。
    pub async fn start(&self) -> SchedulerResult<()> {
        let mut driver = self.inner.driver.lock().await;
        if driver.is_some() {
            warn!("定时调度器已在运行");
            return Ok(());
        }

        let loaded = self.load_active().await?;
        let token = CancellationToken::new();
        let handle = tokio::spawn(Inner::run(Arc::clone(&self.inner), token.clone()));
        *driver = Some((token, handle));
        *self.inner.running_since.write().await = Some(self.inner.clock.now());

        info!("定时调度器已启动，加载了 {} 个定时任务", loaded);
        Ok(())
    }

    pub async fn stop(&self) {
        let Some((token, handle)) = self.inner.driver.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!("定时调度器驱动协程异常退出: {}", e);
        }
        *self.inner.running_since.write().await = None;
        info!("定时调度器已停止");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.driver.lock().await.is_some()
    }

    /// 在给定时刻执行一次触发检查，返回触发的定义数量
    pub async fn tick(&self, now: DateTime<Utc>) -> usize {
        self.inner.tick(now).await
    }

    async fn load_active(&self) -> SchedulerResult<usize> {
        let now = self.inner.clock.now();
        let mut registrations = self.inner.registrations.lock().await;
        registrations.clear();

        for mut definition in self.inner.repo.list_active().await? {
            let schedule = match CronScheduler::new(&definition.cron_expression) {
                Ok(schedule) => schedule,
                Err(e) => {
                    warn!("跳过定时任务 {}: {}", definition.name, e);
                    continue;
                }
            };
            let Some(next_fire) = schedule.next_execution_time(now) else {
                warn!("定时任务 {} 没有未来的执行时间", definition.name);
                continue;
            };

            if definition.next_run_at != Some(next_fire) {
                if matches!(definition.next_run_at, Some(missed) if missed <= now) {
                    debug!(
                        "定时任务 {} 错过了 {:?} 的触发，下次执行时间 {}",
                        definition.name, definition.next_run_at, next_fire
                    );
                }
                definition.next_run_at = Some(next_fire);
                self.inner.repo.update(&definition).await?;
            }
            registrations.insert(
                definition.name.clone(),
                Registration {
                    schedule,
                    definition,
                    next_fire,
                },
            );
        }
        Ok(registrations.len())
    }
}

impl Inner {
    async fn load(&self, name: &str) -> SchedulerResult<ScheduledTaskDefinition> {
        self.repo
            .get_by_name(name)
            .await?
            .ok_or_else(|| SchedulerError::ScheduledTaskNotFound {
                name: name.to_string(),
            })
    }

    async fn fire(&self, definition: &ScheduledTaskDefinition) -> SchedulerResult<Task> {
        let request = TaskRequest {
            task_type: definition.task_type.clone(),
            queue: definition.target_queue.clone(),
            priority: definition.priority,
            payload: definition.payload_template.clone(),
            ..Default::default()
        };
        self.submitter.submit(request).await
    }

    async fn tick(&self, now: DateTime<Utc>) -> usize {
        let mut registrations = self.registrations.lock().await;
        let mut due: Vec<&String> = registrations
            .iter()
            .filter(|(_, registration)| registration.next_fire <= now)
            .map(|(name, _)| name)
            .collect();
        due.sort();
        let due: Vec<String> = due.into_iter().cloned().collect();

        let mut fired = 0;
        for name in due {
            let Some(registration) = registrations.get_mut(&name) else {
                continue;
            };

            let result = self.fire(&registration.definition).await;
            let next_fire = registration.schedule.next_execution_time(now);
            let last_error = match &result {
                Ok(task) => {
                    counter!("taskq_scheduled_firings_total", "result" => "success").increment(1);
                    info!("定时任务 {} 已触发，提交任务 {}", name, task.id);
                    None
                }
                Err(e) => {
                    counter!("taskq_scheduled_firings_total", "result" => "error").increment(1);
                    error!("定时任务 {} 提交失败: {}", name, e);
                    Some(e.to_string())
                }
            };
            fired += 1;

            if let Err(e) = self
                .repo
                .record_run(&name, now, next_fire, last_error.as_deref())
                .await
            {
                warn!("记录定时任务 {} 的执行结果失败: {}", name, e);
            }

            match next_fire {
                Some(next_fire) => {
                    registration.next_fire = next_fire;
                    registration.definition.next_run_at = Some(next_fire);
                }
                None => {
                    warn!("定时任务 {} 没有后续执行时间，注销登记", name);
                    registrations.remove(&name);
                }
            }
        }
        fired
    }

    async fn next_wake(&self) -> Duration {
        let max_idle = Duration::from_millis(self.config.max_idle_ms.max(1));
        let earliest = self
            .registrations
            .lock()
            .await
            .values()
            .map(|registration| registration.next_fire)
            .min();
        match earliest {
            Some(next_fire) => (next_fire - self.clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                .min(max_idle),
            None => max_idle,
        }
    }

    async fn run(inner: Arc<Inner>, shutdown: CancellationToken) {
        debug!("定时调度驱动协程已启动");
        loop {
            let wait = inner.next_wake().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = inner.changed.notified() => continue,
                _ = tokio::time::sleep(wait) => {
                    let now = inner.clock.now();
                    let fired = inner.tick(now).await;
                    if fired > 0 {
                        debug!("本轮触发了 {} 个定时任务", fired);
                    }
                }
            }
        }
        debug!("定时调度驱动协程已退出");
    }
}

fn validate_required(value: &str, field: &str) -> SchedulerResult<()> {
    if value.trim().is_empty() {
        return Err(SchedulerError::validation(format!("{field}不能为空")));
    }
    Ok(())
}

fn next_fire_after(schedule: &CronScheduler, now: DateTime<Utc>) -> SchedulerResult<DateTime<Utc>> {
    schedule
        .next_execution_time(now)
        .ok_or_else(|| SchedulerError::InvalidCron {
            expr: schedule.expression().to_string(),
            message: "没有未来的执行时间".to_string(),
        })
}
