//! # TaskQ API
//!
//! 基于 axum 的 HTTP 接口，对外暴露任务提交、进度查询、队列管理与定时任务管理。
//! 除 `/health` 与 `/metrics` 外，所有端点都挂载在 `/api` 之下。
//!
//! 成功响应统一为 `{"success", "data", "message", "timestamp"}`，
//! 错误响应统一为 `{"error": {"message", "type", "code", "suggestions", "timestamp"}}`。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

pub use error::{ApiError, ApiResult};
pub use response::ApiResponse;
pub use routes::{create_routes, AppState, RouterOptions};
