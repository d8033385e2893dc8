//! 内置的演示处理器
//!
//! - `echo`: 原样返回载荷
//! - `sleep`: 按 `{"duration_ms": N, "steps": M}` 分步休眠并上报进度，可被取消

use std::time::Duration;

use serde_json::{json, Value};
use taskq_core::{SchedulerError, SchedulerResult};
use taskq_worker::{QueueService, TaskContext};
use tracing::debug;

pub async fn register_builtin_handlers(queue: &QueueService) {
    queue.register_handler_fn("echo", echo).await;
    queue.register_handler_fn("sleep", sleep).await;
}

pub async fn echo(ctx: TaskContext) -> SchedulerResult<Value> {
    Ok(ctx.payload().clone())
}

pub async fn sleep(ctx: TaskContext) -> SchedulerResult<Value> {
    let duration_ms = ctx.payload()["duration_ms"].as_u64().unwrap_or(1000);
    let steps = ctx.payload()["steps"].as_u64().unwrap_or(1).clamp(1, 100) as i32;
    let step_duration = Duration::from_millis(duration_ms / steps as u64);

    for step in 1..=steps {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                debug!("任务 {} 在第 {} 步被取消", ctx.task.id, step);
                return Err(SchedulerError::TaskExecution("任务被取消".to_string()));
            }
            _ = tokio::time::sleep(step_duration) => {}
        }
        ctx.progress
            .report_steps(&format!("step-{step}"), step, steps, "")
            .await?;
    }

    Ok(json!({ "slept_ms": duration_ms, "steps": steps }))
}
