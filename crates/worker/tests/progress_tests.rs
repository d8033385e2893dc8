use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{TimeZone, Utc};
use serde_json::json;
use taskq_core::{
    config::{ProgressConfig, QueueConfig},
    models::{ProgressRecord, TaskRequest, TaskStatus},
    Clock, ErrorKind, ManualClock, SchedulerError,
};
use taskq_infrastructure::database::DatabaseManager;
use taskq_worker::{HandlerRegistry, ProgressTracker, QueueService, SubscriptionTarget};
use tokio::sync::Mutex;

struct Harness {
    clock: Arc<ManualClock>,
    tracker: Arc<ProgressTracker>,
    service: QueueService,
}

async fn harness(config: ProgressConfig) -> Result<Harness> {
    let db = DatabaseManager::new("sqlite::memory:", 1).await?;
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
    ));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let tracker = Arc::new(ProgressTracker::new(
        db.task_repository(),
        db.progress_repository(),
        dyn_clock.clone(),
        config,
    ));
    let service = QueueService::new(
        QueueConfig {
            poll_interval_ms: 20,
            ..Default::default()
        },
        db.task_repository(),
        db.execution_repository(),
        Arc::new(HandlerRegistry::new()),
        tracker.clone(),
        dyn_clock,
    );
    Ok(Harness {
        clock,
        tracker,
        service,
    })
}

async fn new_task(h: &Harness) -> Result<String> {
    // 服务未启动，任务保持待执行
    Ok(h.service
        .submit(TaskRequest::new("transcode", "media"))
        .await?
        .id)
}

async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_older_update_is_discarded() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let id = new_task(&h).await?;
    let base = h.clock.now();

    let newer = ProgressRecord::new(&id, 60, "解码", base + chrono::Duration::seconds(10));
    let older = ProgressRecord::new(&id, 30, "下载", base + chrono::Duration::seconds(5));

    assert!(h.tracker.apply(newer).await?);
    assert!(!h.tracker.apply(older).await?);

    let latest = h.tracker.get_progress(&id).await?;
    assert_eq!(latest.percent, 60);
    assert_eq!(latest.message, "解码");

    // 相同时间戳的更新被接受
    let same = ProgressRecord::new(&id, 70, "解码", base + chrono::Duration::seconds(10));
    assert!(h.tracker.apply(same).await?);
    assert_eq!(h.tracker.get_progress(&id).await?.percent, 70);
    Ok(())
}

#[tokio::test]
async fn test_older_update_after_forget_is_discarded() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let id = new_task(&h).await?;
    let base = h.clock.now();

    let newer = ProgressRecord::new(&id, 60, "解码", base + chrono::Duration::seconds(10));
    let older = ProgressRecord::new(&id, 30, "下载", base + chrono::Duration::seconds(5));

    assert!(h.tracker.apply(newer).await?);
    h.tracker.forget(&id).await;
    assert!(!h.tracker.apply(older).await?);

    let latest = h.tracker.get_progress(&id).await?;
    assert_eq!(latest.percent, 60);
    assert_eq!(latest.message, "解码");
    assert_eq!(h.service.get_task(&id).await?.progress, 60);
    assert_eq!(h.tracker.get_history(&id, 10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_older_update_after_restart_is_discarded() -> Result<()> {
    let db = DatabaseManager::new("sqlite::memory:", 1).await?;
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap(),
    ));
    let tracker = |clock: Arc<dyn Clock>| {
        Arc::new(ProgressTracker::new(
            db.task_repository(),
            db.progress_repository(),
            clock,
            ProgressConfig::default(),
        ))
    };
    let first = tracker(clock.clone());
    let service = QueueService::new(
        QueueConfig::default(),
        db.task_repository(),
        db.execution_repository(),
        Arc::new(HandlerRegistry::new()),
        first.clone(),
        clock.clone(),
    );
    let id = service.submit(TaskRequest::new("transcode", "media")).await?.id;
    let base = clock.now();

    first
        .apply(ProgressRecord::new(&id, 80, "封装", base + chrono::Duration::seconds(20)))
        .await?;

    // 新实例内存为空，只能依赖持久化的最新记录
    let second = tracker(clock);
    let stale = ProgressRecord::new(&id, 40, "解码", base + chrono::Duration::seconds(15));
    assert!(!second.apply(stale).await?);
    assert_eq!(second.get_progress(&id).await?.percent, 80);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_updates_keep_latest_per_task() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let first = new_task(&h).await?;
    let second = new_task(&h).await?;
    let base = h.clock.now();

    let mut handles = Vec::new();
    // 乱序提交，时间戳最大的为 offset = 20
    for offset in [7, 20, 3, 12, 1, 18, 9, 15] {
        for id in [first.clone(), second.clone()] {
            let tracker = h.tracker.clone();
            let record = ProgressRecord::new(
                &id,
                offset * 5,
                format!("t{offset}"),
                base + chrono::Duration::seconds(offset as i64),
            );
            handles.push(tokio::spawn(async move { tracker.apply(record).await }));
        }
    }
    for handle in handles {
        handle.await??;
    }

    for id in [&first, &second] {
        let latest = h.tracker.get_progress(id).await?;
        assert_eq!(latest.percent, 100);
        assert_eq!(latest.message, "t20");
        assert_eq!(h.service.get_task(id).await?.progress, 100);
    }
    Ok(())
}

#[tokio::test]
async fn test_update_progress_clamps_and_persists_snapshot() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let id = new_task(&h).await?;

    assert!(h.tracker.update_progress(&id, 140, "快完成了").await?);
    let task = h.service.get_task(&id).await?;
    assert_eq!(task.progress, 100);
    assert_eq!(task.progress_message.as_deref(), Some("快完成了"));

    h.clock.advance(chrono::Duration::seconds(1));
    h.tracker
        .update_progress_with_steps(&id, "封装", 3, 4, "第3步")
        .await?;
    let latest = h.tracker.get_progress(&id).await?;
    assert_eq!(latest.percent, 75);
    assert_eq!(latest.current_step.as_deref(), Some("封装"));
    assert_eq!(latest.total_steps, 4);
    Ok(())
}

#[tokio::test]
async fn test_unknown_task_is_not_found() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;

    let err = h.tracker.update_progress("missing", 10, "").await.unwrap_err();
    assert!(matches!(err, SchedulerError::TaskNotFound { .. }));

    let err = h.tracker.get_progress("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    Ok(())
}

#[tokio::test]
async fn test_get_progress_falls_back_to_persisted_state() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let id = new_task(&h).await?;

    // 没有任何更新时返回任务行上的初始快照
    let initial = h.tracker.get_progress(&id).await?;
    assert_eq!(initial.percent, 0);

    h.tracker.update_progress_with_steps(&id, "上传", 1, 2, "").await?;
    h.tracker.forget(&id).await;

    let restored = h.tracker.get_progress(&id).await?;
    assert_eq!(restored.percent, 50);
    assert_eq!(restored.current_step.as_deref(), Some("上传"));
    Ok(())
}

#[tokio::test]
async fn test_history_is_capped_newest_first_and_clearable() -> Result<()> {
    let h = harness(ProgressConfig {
        history_max_per_task: 3,
        ..Default::default()
    })
    .await?;
    let id = new_task(&h).await?;

    for percent in [10, 20, 30, 40, 50] {
        h.clock.advance(chrono::Duration::seconds(1));
        h.tracker.update_progress(&id, percent, "").await?;
    }

    let history = h.tracker.get_history(&id, 10).await?;
    let percents: Vec<i32> = history.iter().map(|r| r.percent).collect();
    assert_eq!(percents, vec![50, 40, 30]);

    assert_eq!(h.tracker.clear_history(&id).await?, 3);
    assert!(h.tracker.get_history(&id, 10).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_prune_history_uses_ttl() -> Result<()> {
    let h = harness(ProgressConfig {
        history_ttl_seconds: 60,
        ..Default::default()
    })
    .await?;
    let id = new_task(&h).await?;

    h.tracker.update_progress(&id, 10, "旧").await?;
    h.clock.advance(chrono::Duration::seconds(120));
    h.tracker.update_progress(&id, 20, "新").await?;

    assert_eq!(h.tracker.prune_history().await?, 1);
    let history = h.tracker.get_history(&id, 10).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].message, "新");
    Ok(())
}

#[tokio::test]
async fn test_prune_history_with_unbounded_ttl_keeps_everything() -> Result<()> {
    let h = harness(ProgressConfig {
        history_ttl_seconds: u64::MAX,
        ..Default::default()
    })
    .await?;
    let id = new_task(&h).await?;

    h.tracker.update_progress(&id, 10, "旧").await?;
    assert_eq!(h.tracker.prune_history().await?, 0);
    assert_eq!(h.tracker.get_history(&id, 10).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_subscribers_receive_matching_updates() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let first = new_task(&h).await?;
    let second = new_task(&h).await?;

    let everything = Arc::new(Mutex::new(Vec::new()));
    let only_first = Arc::new(Mutex::new(Vec::new()));
    {
        let sink = everything.clone();
        h.tracker
            .subscribe(SubscriptionTarget::All, move |record| {
                let sink = sink.clone();
                async move { sink.lock().await.push(record.task_id) }
            })
            .await;
    }
    let targeted = {
        let sink = only_first.clone();
        h.tracker
            .subscribe(SubscriptionTarget::Task(first.clone()), move |record| {
                let sink = sink.clone();
                async move { sink.lock().await.push(record.percent) }
            })
            .await
    };

    h.tracker.update_progress(&first, 10, "").await?;
    h.tracker.update_progress(&second, 20, "").await?;

    let all_seen = everything.clone();
    assert!(eventually(|| all_seen.try_lock().map(|v| v.len() == 2).unwrap_or(false)).await);
    let first_seen = only_first.clone();
    assert!(eventually(|| first_seen.try_lock().map(|v| *v == vec![10]).unwrap_or(false)).await);

    assert!(h.tracker.unsubscribe(targeted).await);
    assert!(!h.tracker.unsubscribe(targeted).await);
    h.clock.advance(chrono::Duration::seconds(1));
    h.tracker.update_progress(&first, 30, "").await?;

    let all_seen = everything.clone();
    assert!(eventually(|| all_seen.try_lock().map(|v| v.len() == 3).unwrap_or(false)).await);
    assert_eq!(*only_first.lock().await, vec![10]);
    Ok(())
}

#[tokio::test]
async fn test_panicking_or_slow_subscriber_does_not_block_others() -> Result<()> {
    let h = harness(ProgressConfig {
        subscriber_buffer: 1,
        ..Default::default()
    })
    .await?;
    let id = new_task(&h).await?;

    h.tracker
        .subscribe(SubscriptionTarget::All, |_record| async move {
            panic!("订阅者崩溃");
        })
        .await;
    h.tracker
        .subscribe(SubscriptionTarget::All, |_record| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
        })
        .await;
    let delivered = Arc::new(AtomicUsize::new(0));
    {
        let delivered = delivered.clone();
        h.tracker
            .subscribe(SubscriptionTarget::Task(id.clone()), move |_record| {
                let delivered = delivered.clone();
                async move {
                    delivered.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await;
    }

    let updates = async {
        for percent in [10, 20, 30] {
            h.clock.advance(chrono::Duration::seconds(1));
            h.tracker.update_progress(&id, percent, "").await?;
            // 给健康的订阅者留出消费时间，邮箱容量只有1
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        Ok::<_, SchedulerError>(())
    };
    tokio::time::timeout(Duration::from_secs(5), updates).await??;

    assert!(eventually(|| delivered.load(Ordering::SeqCst) == 3).await);
    assert_eq!(h.tracker.get_progress(&id).await?.percent, 30);
    Ok(())
}

#[tokio::test]
async fn test_handler_reports_progress_through_context() -> Result<()> {
    let h = harness(ProgressConfig::default()).await?;
    let clock = h.clock.clone();
    h.service
        .register_handler_fn("transcode", move |ctx| {
            let clock = clock.clone();
            async move {
                ctx.progress.report(25, "开始").await?;
                clock.advance(chrono::Duration::seconds(1));
                ctx.progress.report_steps("输出", 2, 2, "完成").await?;
                Ok(json!({"task": ctx.task.id}))
            }
        })
        .await;

    let id = new_task(&h).await?;
    h.service.start().await?;

    let mut status = TaskStatus::Pending;
    for _ in 0..500 {
        status = h.service.get_task(&id).await?.status;
        if status == TaskStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, TaskStatus::Completed);

    // 完成后内存记录被释放，查询走持久化历史
    let latest = h.tracker.get_progress(&id).await?;
    assert_eq!(latest.percent, 100);
    assert_eq!(latest.message, "完成");
    assert_eq!(h.tracker.get_history(&id, 10).await?.len(), 2);
    h.service.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
