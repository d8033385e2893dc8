use async_trait::async_trait;

use crate::{
    models::{Task, TaskRequest},
    SchedulerResult,
};

/// 任务提交接口
///
/// 调度器通过该接口把定时触发生成的任务交给队列运行时，
/// 两者之间不直接依赖。
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    async fn submit(&self, request: TaskRequest) -> SchedulerResult<Task>;
}
