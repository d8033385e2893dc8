pub mod health;
pub mod queues;
pub mod scheduled_tasks;
pub mod tasks;
