pub mod api_observability;
pub mod app_config;
pub mod database;
pub mod queue;
pub mod runtime;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use database::DatabaseConfig;
pub use queue::{PredeclaredQueue, QueueConfig};
pub use runtime::{ProgressConfig, SchedulerConfig, ShutdownConfig};
