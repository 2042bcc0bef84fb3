//! Watcher: subscribes to task and agent lifecycle events and drives the
//! task state machine in response.
//!
//! `task.*` and `agent.*` are consumed through the `orchestrator` queue
//! group so work is partitioned across orchestrator instances; the ACP
//! message, permission, tool-call, prompt-complete and git-status
//! subjects are broadcast subscriptions, because every instance fans
//! them out to its own UI clients.

use std::sync::Arc;

use anyhow::Result;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use agentctl_db::models::TaskState;
use agentctl_db::queries::tasks as task_db;

use crate::bus::{EventBus, Subscription};
use crate::error::ErrorKind;
use crate::event::{Event, subjects};
use crate::queue::QueueError;
use crate::scheduler::{RetryDecision, Scheduler};
use crate::state::dispatch;

/// The queue group orchestrator instances share.
pub const QUEUE_GROUP: &str = "orchestrator";

struct WatcherSubs {
    tasks: Subscription,
    agents: Subscription,
    acp_messages: Subscription,
    permissions: Subscription,
    tool_calls: Subscription,
    prompt_completes: Subscription,
    git_status: Subscription,
}

/// Drives task state transitions off the bus.
pub struct Watcher {
    pool: PgPool,
    bus: EventBus,
    scheduler: Arc<Scheduler>,
    /// Taken by `run`. Subscribing at construction means no event
    /// published after `new` is ever missed.
    subs: std::sync::Mutex<Option<WatcherSubs>>,
}

impl Watcher {
    pub fn new(pool: PgPool, bus: EventBus, scheduler: Arc<Scheduler>) -> Arc<Self> {
        let subs = WatcherSubs {
            tasks: bus.queue_subscribe(subjects::TASK_ALL, QUEUE_GROUP),
            agents: bus.queue_subscribe(subjects::AGENT_ALL, QUEUE_GROUP),
            // UI-fanout subjects: consumed broadcast; delivery to clients
            // is the transport collaborator's job.
            acp_messages: bus.subscribe(subjects::ACP_MESSAGE_ALL),
            permissions: bus.subscribe(subjects::PERMISSION_ALL),
            tool_calls: bus.subscribe(subjects::TOOL_CALL_ALL),
            prompt_completes: bus.subscribe(subjects::PROMPT_COMPLETE_ALL),
            git_status: bus.subscribe(subjects::GIT_STATUS_ALL),
        };
        Arc::new(Self {
            pool,
            bus,
            scheduler,
            subs: std::sync::Mutex::new(Some(subs)),
        })
    }

    /// Handle events until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let subs = self.subs.lock().expect("subs mutex poisoned").take();
        let Some(subs) = subs else {
            warn!("watcher run called twice");
            return;
        };
        let WatcherSubs {
            mut tasks,
            mut agents,
            mut acp_messages,
            mut permissions,
            mut tool_calls,
            mut prompt_completes,
            mut git_status,
        } = subs;

        info!("watcher running");
        loop {
            tokio::select! {
                Some(event) = tasks.recv() => {
                    if let Err(e) = self.handle_task_event(&event).await {
                        warn!(subject = %event.subject, error = %format!("{e:#}"), "task event handler failed");
                    }
                }
                Some(event) = agents.recv() => {
                    if let Err(e) = self.handle_agent_event(&event).await {
                        warn!(subject = %event.subject, error = %format!("{e:#}"), "agent event handler failed");
                    }
                }
                Some(event) = acp_messages.recv() => {
                    trace!(subject = %event.subject, "acp message for fanout");
                }
                Some(event) = permissions.recv() => {
                    trace!(subject = %event.subject, "permission request for fanout");
                }
                Some(event) = tool_calls.recv() => {
                    trace!(subject = %event.subject, "tool call for fanout");
                }
                Some(event) = prompt_completes.recv() => {
                    trace!(subject = %event.subject, "prompt completion for fanout");
                }
                Some(event) = git_status.recv() => {
                    trace!(subject = %event.subject, "git status for fanout");
                }
                _ = cancel.cancelled() => {
                    info!("watcher stopping");
                    return;
                }
            }
        }
    }

    /// Events with no resolvable task id are orphans and are dropped.
    fn require_task_id(event: &Event) -> Option<Uuid> {
        let task_id = event.task_id();
        if task_id.is_none() {
            warn!(subject = %event.subject, "dropping event without a task id");
        }
        task_id
    }

    async fn handle_task_event(&self, event: &Event) -> Result<()> {
        let Some(task_id) = Self::require_task_id(event) else {
            return Ok(());
        };

        let to = event.data.get("to").and_then(|t| t.as_str());
        match (event.subject.as_str(), to) {
            // A task landing in todo (filed or moved there by the user)
            // enters the queue.
            (subjects::TASK_STATE_CHANGED, Some("todo")) => self.enqueue_task(task_id).await,
            _ => {
                trace!(subject = %event.subject, "ignoring task event");
                Ok(())
            }
        }
    }

    /// Move a todo task into the queue: `todo -> scheduling`, enqueue,
    /// publish the transition.
    pub async fn enqueue_task(&self, task_id: Uuid) -> Result<()> {
        dispatch::begin_scheduling(&self.pool, task_id).await?;

        let task = task_db::get_task(&self.pool, task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task {task_id} not found"))?;

        match self.scheduler.enqueue(task) {
            Ok(()) => {
                self.bus.publish(Event::task_state_changed(
                    task_id,
                    TaskState::Todo,
                    TaskState::Scheduling,
                ));
                Ok(())
            }
            Err(QueueError::TaskExists(_)) => {
                debug!(task_id = %task_id, "task already queued");
                Ok(())
            }
            Err(e @ QueueError::QueueFull(_)) => {
                // Persist the revert so the task is replayed later.
                let _ = dispatch::revert_scheduling(&self.pool, task_id).await;
                Err(e.into())
            }
        }
    }

    async fn handle_agent_event(&self, event: &Event) -> Result<()> {
        let Some(task_id) = Self::require_task_id(event) else {
            return Ok(());
        };

        match event.subject.as_str() {
            subjects::AGENT_COMPLETED => {
                dispatch::complete_task(&self.pool, task_id).await?;
                self.scheduler.handle_completion(task_id);
                self.bus.publish(Event::task_state_changed(
                    task_id,
                    TaskState::InProgress,
                    TaskState::Completed,
                ));
                info!(task_id = %task_id, "task completed");
                Ok(())
            }
            subjects::AGENT_FAILED => {
                let kind = event
                    .data
                    .get("kind")
                    .and_then(|k| k.as_str())
                    .unwrap_or("internal");
                self.handle_agent_failure(task_id, kind).await
            }
            subjects::AGENT_STOPPED => {
                dispatch::cancel_task(&self.pool, task_id, TaskState::InProgress).await?;
                self.bus.publish(Event::task_state_changed(
                    task_id,
                    TaskState::InProgress,
                    TaskState::Cancelled,
                ));
                info!(task_id = %task_id, "task cancelled");
                Ok(())
            }
            subjects::AGENT_STARTED
            | subjects::AGENT_READY
            | subjects::AGENT_SESSION_CREATED => {
                trace!(subject = %event.subject, task_id = %task_id, "agent lifecycle");
                Ok(())
            }
            other => {
                trace!(subject = other, "ignoring agent event");
                Ok(())
            }
        }
    }

    async fn handle_agent_failure(&self, task_id: Uuid, kind: &str) -> Result<()> {
        let retryable = kind == ErrorKind::Transport.as_str()
            || kind == ErrorKind::Resource.as_str()
            || kind == ErrorKind::Internal.as_str();

        if retryable {
            match self.scheduler.handle_failure(task_id) {
                RetryDecision::Retrying { attempt } => {
                    dispatch::requeue_task(&self.pool, task_id).await?;
                    self.bus.publish(Event::task_state_changed(
                        task_id,
                        TaskState::InProgress,
                        TaskState::Scheduling,
                    ));
                    info!(task_id = %task_id, attempt, "task re-queued for retry");
                    return Ok(());
                }
                RetryDecision::Exhausted => {
                    info!(task_id = %task_id, "retry budget exhausted");
                }
            }
        }

        dispatch::fail_task(&self.pool, task_id, TaskState::InProgress).await?;
        self.bus.publish(Event::task_state_changed(
            task_id,
            TaskState::InProgress,
            TaskState::Failed,
        ));
        warn!(task_id = %task_id, kind, "task failed");
        Ok(())
    }
}
