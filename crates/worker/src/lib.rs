//! 任务队列运行时：内存缓冲区、worker、轮询器、处理器注册和进度追踪

pub mod buffer;
pub mod handler;
pub mod progress;
pub mod queue;

pub use buffer::{PushOutcome, QueueBuffer};
pub use handler::{FnHandler, HandlerRegistry, TaskContext, TaskHandler};
pub use progress::{ProgressReporter, ProgressTracker, SubscriptionId, SubscriptionTarget};
pub use queue::QueueService;
