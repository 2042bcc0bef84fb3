//! Scheduler: drives the in-memory priority queue into the executor
//! within its concurrency budget, with retry and backoff.
//!
//! A single driver loop ticks at `process_interval` (and on an enqueue
//! kick). Each tick dequeues while the executor reports capacity,
//! transitions the task `scheduling -> in_progress`, and submits it. A
//! failed update or submit re-enqueues the entry unchanged with a
//! best-effort state revert. Completion clears the retry count; failure
//! retries after a delay until `retry_limit`, then the task fails for
//! good.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentctl_db::models::{Task, TaskState};
use agentctl_db::queries::tasks as task_db;

use crate::bus::EventBus;
use crate::event::Event;
use crate::executor::Executor;
use crate::queue::{QueueError, TaskQueue};
use crate::state::dispatch;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Driver tick interval.
    pub process_interval: Duration,
    /// Retries per task before it fails for good.
    pub retry_limit: u32,
    /// Delay before a retry re-enters the queue.
    pub retry_delay: Duration,
    /// Queue capacity; `enqueue` fails beyond it.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            process_interval: Duration::from_secs(5),
            retry_limit: 2,
            retry_delay: Duration::from_secs(10),
            queue_capacity: 256,
        }
    }
}

/// Decision from [`Scheduler::handle_failure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// A retry worker was spawned; the task re-enters the queue after
    /// the delay.
    Retrying { attempt: u32 },
    /// The retry budget is spent.
    Exhausted,
}

#[derive(Debug, Default)]
struct Totals {
    processed: u64,
    failed: u64,
}

/// Snapshot for the control API.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub queued: usize,
    pub queue_capacity: usize,
    pub active: usize,
    pub processed: u64,
    pub failed: u64,
}

/// The scheduler. Shared via `Arc`; `run` is the single driver worker.
pub struct Scheduler {
    pool: PgPool,
    bus: EventBus,
    queue: TaskQueue,
    executor: Arc<Executor>,
    /// Retry counts for tasks currently failing, behind their own mutex.
    retry_counts: Mutex<HashMap<Uuid, u32>>,
    totals: Mutex<Totals>,
    config: SchedulerConfig,
    kick: Notify,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        executor: Arc<Executor>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            queue: TaskQueue::new(config.queue_capacity),
            executor,
            retry_counts: Mutex::new(HashMap::new()),
            totals: Mutex::new(Totals::default()),
            config,
            kick: Notify::new(),
        })
    }

    /// Insert a task into the queue, waking the driver.
    pub fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        let retries = self
            .retry_counts
            .lock()
            .expect("retry counts poisoned")
            .get(&task.id)
            .copied()
            .unwrap_or(0);
        self.queue.enqueue(task, retries)?;
        self.kick.notify_one();
        Ok(())
    }

    /// Remove a queued entry. Never cancels a running execution.
    pub fn remove(&self, task_id: Uuid) -> bool {
        self.queue.remove(task_id)
    }

    pub fn queue_status(&self) -> SchedulerStatus {
        let queue = self.queue.status();
        let totals = self.totals.lock().expect("totals poisoned");
        SchedulerStatus {
            queued: queue.queued,
            queue_capacity: queue.capacity,
            active: self.executor.active_count(),
            processed: totals.processed,
            failed: totals.failed,
        }
    }

    /// Clear bookkeeping after a successful execution.
    pub fn handle_completion(&self, task_id: Uuid) {
        self.retry_counts
            .lock()
            .expect("retry counts poisoned")
            .remove(&task_id);
        self.totals.lock().expect("totals poisoned").processed += 1;
    }

    /// Decide what happens after a failed execution: spawn a retry
    /// worker, or report exhaustion. Each call increments the retry
    /// count by exactly one until the limit.
    pub fn handle_failure(self: &Arc<Self>, task_id: Uuid) -> RetryDecision {
        let attempt = {
            let mut counts = self.retry_counts.lock().expect("retry counts poisoned");
            let count = counts.entry(task_id).or_insert(0);
            if *count >= self.config.retry_limit {
                counts.remove(&task_id);
                self.totals.lock().expect("totals poisoned").failed += 1;
                return RetryDecision::Exhausted;
            }
            *count += 1;
            *count
        };

        info!(
            task_id = %task_id,
            attempt,
            limit = self.config.retry_limit,
            "scheduling retry"
        );

        // One retry worker per retry in flight.
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(scheduler.config.retry_delay).await;
            if let Err(e) = scheduler.requeue_for_retry(task_id, attempt).await {
                warn!(task_id = %task_id, error = %format!("{e:#}"), "retry re-enqueue failed");
            }
        });

        RetryDecision::Retrying { attempt }
    }

    async fn requeue_for_retry(&self, task_id: Uuid, attempt: u32) -> Result<()> {
        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .with_context(|| format!("task {task_id} vanished before retry"))?;

        if task.state != TaskState::Scheduling {
            debug!(
                task_id = %task_id,
                state = %task.state,
                "task left the retry path, dropping retry"
            );
            return Ok(());
        }

        match self.queue.enqueue(task, attempt) {
            Ok(()) => {
                self.kick.notify_one();
                Ok(())
            }
            Err(QueueError::TaskExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The driver loop. Ticks at `process_interval`, wakes early on
    /// enqueue, exits on cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.replay_pending().await {
            warn!(error = %format!("{e:#}"), "failed to replay pending tasks");
        }

        let mut interval = tokio::time::interval(self.config.process_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.kick.notified() => {}
                _ = cancel.cancelled() => {
                    info!("scheduler stopping");
                    return;
                }
            }
            self.drive_once().await;
        }
    }

    /// Replay queued work after a restart: every `scheduling` task in
    /// storage re-enters the in-memory queue.
    async fn replay_pending(&self) -> Result<()> {
        let pending = task_db::list_tasks_in_state(&self.pool, TaskState::Scheduling).await?;
        let count = pending.len();
        for task in pending {
            match self.queue.enqueue(task, 0) {
                Ok(()) | Err(QueueError::TaskExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if count > 0 {
            info!(count, "replayed pending tasks into the queue");
            self.kick.notify_one();
        }
        Ok(())
    }

    /// One pass: dequeue while the executor has capacity.
    async fn drive_once(&self) {
        while self.executor.can_execute() {
            let Some(entry) = self.queue.dequeue() else {
                break;
            };
            let task_id = entry.task.id;

            // Tasks cancelled while queued are dropped here.
            match task_db::get_task(&self.pool, task_id).await {
                Ok(Some(current)) if current.state == TaskState::Scheduling => {}
                Ok(other) => {
                    debug!(
                        task_id = %task_id,
                        state = ?other.map(|t| t.state),
                        "dropping dequeued task that is no longer scheduling"
                    );
                    continue;
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %format!("{e:#}"), "task lookup failed, re-enqueueing");
                    let _ = self.queue.enqueue(entry.task, entry.retries);
                    break;
                }
            }

            if let Err(e) = dispatch::start_task(&self.pool, task_id).await {
                warn!(task_id = %task_id, error = %format!("{e:#}"), "state update failed, re-enqueueing");
                let _ = self.queue.enqueue(entry.task, entry.retries);
                continue;
            }
            self.bus.publish(Event::task_state_changed(
                task_id,
                TaskState::Scheduling,
                TaskState::InProgress,
            ));

            if let Err(e) = self.executor.execute(&entry.task) {
                warn!(task_id = %task_id, error = %format!("{e:#}"), "submit failed, re-enqueueing");
                // Best-effort state revert so the entry can be dequeued
                // again.
                if let Err(revert) = dispatch::requeue_task(&self.pool, task_id).await {
                    warn!(task_id = %task_id, error = %format!("{revert:#}"), "state revert failed");
                }
                let _ = self.queue.enqueue(entry.task, entry.retries);
                break;
            }
        }
    }
}
