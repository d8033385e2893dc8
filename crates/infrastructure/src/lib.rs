pub mod database;
pub mod persistence_retry;

pub use database::*;
pub use persistence_retry::{with_persistence_retry, PersistenceRetry};
