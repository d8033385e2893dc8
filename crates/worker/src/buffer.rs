//! 队列内存缓冲区
//!
//! 有界优先级堆，按 (priority desc, created_at asc, 入队序号 asc) 出队，
//! 同一任务ID在缓冲区内最多出现一次。缓冲区只是加速路径，
//! 满了之后任务仍然留在数据库中由轮询器补充。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use taskq_core::models::Task;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    Duplicate,
    Full,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    priority: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task_id: String,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    ids: HashSet<String>,
    next_seq: u64,
}

pub struct QueueBuffer {
    inner: Mutex<Inner>,
    capacity: usize,
    notify: Notify,
}

impl QueueBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.max(1),
            notify: Notify::new(),
        }
    }

    // 持锁期间不会 panic，中毒时直接沿用内部数据
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 非阻塞入队
    pub fn try_push(&self, task: &Task) -> PushOutcome {
        let mut inner = self.lock();
        if inner.ids.contains(&task.id) {
            return PushOutcome::Duplicate;
        }
        if inner.heap.len() >= self.capacity {
            return PushOutcome::Full;
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.ids.insert(task.id.clone());
        inner.heap.push(Entry {
            priority: task.priority,
            created_at: task.created_at,
            seq,
            task_id: task.id.clone(),
        });
        drop(inner);

        self.notify.notify_one();
        PushOutcome::Queued
    }

    pub fn try_pop(&self) -> Option<String> {
        let mut inner = self.lock();
        let entry = inner.heap.pop()?;
        inner.ids.remove(&entry.task_id);
        Some(entry.task_id)
    }

    /// 等待直到有任务可取
    pub async fn pop(&self) -> String {
        loop {
            if let Some(task_id) = self.try_pop() {
                return task_id;
            }
            self.notify.notified().await;
        }
    }

    pub fn remove(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        if !inner.ids.remove(task_id) {
            return false;
        }
        inner.heap.retain(|entry| entry.task_id != task_id);
        true
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use taskq_core::models::TaskStatus;

    fn task(id: &str, priority: i32, created_at: DateTime<Utc>) -> Task {
        Task {
            id: id.to_string(),
            task_type: "echo".to_string(),
            queue: "default".to_string(),
            status: TaskStatus::Pending,
            priority,
            payload: serde_json::Value::Null,
            retry_count: 0,
            max_retries: 0,
            timeout: 10,
            scheduled_at: created_at,
            created_at,
            updated_at: created_at,
            started_at: None,
            completed_at: None,
            last_error: None,
            result: None,
            progress: 0,
            progress_message: None,
            worker_id: None,
            owner_id: None,
            project_id: None,
        }
    }

    #[test]
    fn test_priority_then_age_then_sequence() {
        let buffer = QueueBuffer::new(10);
        let now = Utc::now();
        buffer.try_push(&task("old-low", 1, now - Duration::seconds(5)));
        buffer.try_push(&task("b", 5, now));
        buffer.try_push(&task("a", 5, now));
        buffer.try_push(&task("older-high", 5, now - Duration::seconds(1)));
        buffer.try_push(&task("urgent", 10, now));

        let order: Vec<String> = std::iter::from_fn(|| buffer.try_pop()).collect();
        assert_eq!(order, vec!["urgent", "older-high", "b", "a", "old-low"]);
    }

    #[test]
    fn test_capacity_and_dedupe() {
        let buffer = QueueBuffer::new(2);
        let now = Utc::now();
        assert_eq!(buffer.try_push(&task("1", 0, now)), PushOutcome::Queued);
        assert_eq!(buffer.try_push(&task("1", 0, now)), PushOutcome::Duplicate);
        assert_eq!(buffer.try_push(&task("2", 0, now)), PushOutcome::Queued);
        assert_eq!(buffer.try_push(&task("3", 0, now)), PushOutcome::Full);
        assert_eq!(buffer.remaining(), 0);

        assert!(buffer.remove("1"));
        assert!(!buffer.remove("1"));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.try_pop().as_deref(), Some("2"));
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let buffer = std::sync::Arc::new(QueueBuffer::new(4));
        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move { buffer.pop().await })
        };
        tokio::task::yield_now().await;
        buffer.try_push(&task("late", 0, Utc::now()));

        assert_eq!(waiter.await.unwrap(), "late");
    }
}
