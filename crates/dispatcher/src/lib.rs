//! 定时任务调度
//!
//! 按 CRON 表达式周期性地向队列提交任务。

pub mod cron_utils;
pub mod scheduler;

pub use cron_utils::CronScheduler;
pub use scheduler::ScheduledTaskService;
