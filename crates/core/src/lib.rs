pub mod clock;
pub mod config;
pub mod errors;
pub mod models;
pub mod retry;
pub mod traits;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::AppConfig;
pub use errors::{ErrorKind, Result, SchedulerError};
pub use retry::{BackoffStrategy, RetryPolicy};

/// 统一的Result类型别名
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
