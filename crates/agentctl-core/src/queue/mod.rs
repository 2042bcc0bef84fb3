//! In-memory priority queue of tasks awaiting execution.
//!
//! Ordering is a total order over (priority desc, enqueue sequence asc):
//! higher priority first, FIFO within a priority. Ids are unique; the
//! queue is bounded. The queue never touches storage -- restart replays
//! pending tasks from the task table.

use std::collections::HashSet;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use agentctl_db::models::Task;

/// Errors from queue operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The task id is already present in the queue.
    #[error("task {0} is already queued")]
    TaskExists(Uuid),

    /// The queue has reached its configured capacity. The caller must
    /// persist task state and retry later.
    #[error("queue is full (capacity {0})")]
    QueueFull(usize),
}

/// A task wrapped with its scheduling bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedTask {
    pub task: Task,
    pub enqueued_at: DateTime<Utc>,
    pub retries: u32,
    /// Monotonic insertion sequence; breaks priority ties FIFO.
    seq: u64,
}

impl QueuedTask {
    pub fn priority(&self) -> i32 {
        self.task.priority
    }
}

#[derive(Default)]
struct QueueInner {
    /// Kept sorted by (priority desc, seq asc).
    entries: Vec<QueuedTask>,
    ids: HashSet<Uuid>,
    next_seq: u64,
}

/// Snapshot of queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct QueueStatus {
    pub queued: usize,
    pub capacity: usize,
}

/// The bounded priority queue. All operations lock a single mutex; none
/// block.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    capacity: usize,
}

impl TaskQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            capacity,
        }
    }

    /// Insert a task. Fails with [`QueueError::TaskExists`] when the id is
    /// present and [`QueueError::QueueFull`] at capacity.
    pub fn enqueue(&self, task: Task, retries: u32) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");

        if inner.ids.contains(&task.id) {
            return Err(QueueError::TaskExists(task.id));
        }
        if inner.entries.len() >= self.capacity {
            return Err(QueueError::QueueFull(self.capacity));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;

        let entry = QueuedTask {
            enqueued_at: Utc::now(),
            retries,
            seq,
            task,
        };

        // Sort key: priority desc, then seq asc. partition_point finds the
        // first entry that sorts after the new one.
        let priority = entry.priority();
        let pos = inner
            .entries
            .partition_point(|e| e.priority() > priority || (e.priority() == priority && e.seq < seq));
        inner.ids.insert(entry.task.id);
        inner.entries.insert(pos, entry);
        Ok(())
    }

    /// Remove and return the highest-priority task, if any.
    pub fn dequeue(&self) -> Option<QueuedTask> {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if inner.entries.is_empty() {
            return None;
        }
        let entry = inner.entries.remove(0);
        inner.ids.remove(&entry.task.id);
        Some(entry)
    }

    /// Remove a queued entry by task id. Returns whether an entry was
    /// removed. Never cancels a running execution.
    pub fn remove(&self, id: Uuid) -> bool {
        let mut inner = self.inner.lock().expect("queue mutex poisoned");
        if !inner.ids.remove(&id) {
            return false;
        }
        inner.entries.retain(|e| e.task.id != id);
        true
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.inner
            .lock()
            .expect("queue mutex poisoned")
            .ids
            .contains(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn status(&self) -> QueueStatus {
        QueueStatus {
            queued: self.len(),
            capacity: self.capacity,
        }
    }
}
