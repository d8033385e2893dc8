use std::time::Duration;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use taskq_dispatcher::ScheduledTaskService;
use taskq_infrastructure::database::DatabaseManager;
use taskq_worker::QueueService;

use crate::handlers::{
    health::{health_check, metrics},
    queues::{list_queues, queue_stats, register_queue},
    scheduled_tasks::{
        create_scheduled_task, delete_scheduled_task, get_scheduled_task, list_scheduled_tasks,
        pause_scheduled_task, resume_scheduled_task, run_scheduled_task, scheduler_stats,
        update_scheduled_task,
    },
    tasks::{
        cancel_task, clear_progress_history, create_task, get_progress, get_progress_history,
        get_task, get_task_result, list_executions, list_tasks, retry_task, task_statistics,
    },
};
use crate::middleware::{cors_layer, request_logging, request_timeout, trace_layer};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub queue: QueueService,
    pub scheduler: ScheduledTaskService,
    pub database: DatabaseManager,
    /// 未启用指标时为空，`/metrics` 返回404
    pub metrics: Option<PrometheusHandle>,
    pub started_at: DateTime<Utc>,
}

/// 路由层面的可选项
#[derive(Debug, Clone)]
pub struct RouterOptions {
    pub cors_enabled: bool,
    pub request_timeout: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            cors_enabled: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// 创建API路由
pub fn create_routes(state: AppState, options: RouterOptions) -> Router {
    let api = Router::new()
        // 任务
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/statistics", get(task_statistics))
        .route("/tasks/{id}", get(get_task).delete(cancel_task))
        .route("/tasks/{id}/progress", get(get_progress))
        .route(
            "/tasks/{id}/progress/history",
            get(get_progress_history).delete(clear_progress_history),
        )
        .route("/tasks/{id}/result", get(get_task_result))
        .route("/tasks/{id}/executions", get(list_executions))
        .route("/tasks/{id}/retry", post(retry_task))
        // 队列
        .route("/queues", get(list_queues).post(register_queue))
        .route("/queues/{name}/stats", get(queue_stats))
        // 定时任务
        .route(
            "/scheduled-tasks",
            get(list_scheduled_tasks).post(create_scheduled_task),
        )
        .route(
            "/scheduled-tasks/{name}",
            get(get_scheduled_task)
                .put(update_scheduled_task)
                .delete(delete_scheduled_task),
        )
        .route("/scheduled-tasks/{name}/pause", post(pause_scheduled_task))
        .route("/scheduled-tasks/{name}/resume", post(resume_scheduled_task))
        .route("/scheduled-tasks/{name}/run", post(run_scheduled_task))
        .route("/scheduler/stats", get(scheduler_stats));

    let router = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .nest("/api", api)
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            options.request_timeout,
            request_timeout,
        ))
        .layer(middleware::from_fn(request_logging))
        .layer(trace_layer());

    if options.cors_enabled {
        router.layer(cors_layer())
    } else {
        router
    }
}
