pub mod execution;
pub mod progress;
pub mod queue;
pub mod scheduled_task;
pub mod task;

pub use execution::{ExecutionOutcome, ExecutionRecord};
pub use progress::ProgressRecord;
pub use queue::{QueueDescriptor, QueueStats};
pub use scheduled_task::{
    ScheduledTaskDefinition, ScheduledTaskRequest, ScheduledTaskUpdate, SchedulerStats,
};
pub use task::{
    Task, TaskCounts, TaskFilter, TaskPage, TaskRequest, TaskStatistics, TaskStatus,
};
