//! 应用配置
//!
//! 配置按以下顺序叠加，后者覆盖前者：
//! 1. 内置默认值
//! 2. TOML 配置文件
//! 3. 环境变量（前缀 `TASKQ_`，层级分隔符 `__`，例如 `TASKQ_QUEUE__DEFAULT_CONCURRENCY=8`）

pub mod models;

pub use models::*;
