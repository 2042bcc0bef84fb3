//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph and optimistic locking. `TODO -> SCHEDULING
//! -> IN_PROGRESS` is the only automatic path; the terminal states are
//! absorbing.

pub mod dispatch;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use agentctl_db::models::TaskState;
use agentctl_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// todo              -> scheduling | cancelled
/// scheduling        -> in_progress | todo | failed | cancelled
/// in_progress       -> scheduling (retry re-enqueue)
///                    | waiting_for_input | review | blocked
///                    | completed | failed | cancelled
/// waiting_for_input -> in_progress | cancelled
/// review            -> in_progress | completed | cancelled
/// blocked           -> in_progress | todo | cancelled
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskState, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (from, to),
            (Todo, Scheduling)
                | (Todo, Cancelled)
                | (Scheduling, InProgress)
                | (Scheduling, Todo)
                | (Scheduling, Failed)
                | (Scheduling, Cancelled)
                | (InProgress, Scheduling)
                | (InProgress, WaitingForInput)
                | (InProgress, Review)
                | (InProgress, Blocked)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (WaitingForInput, InProgress)
                | (WaitingForInput, Cancelled)
                | (Review, InProgress)
                | (Review, Completed)
                | (Review, Cancelled)
                | (Blocked, InProgress)
                | (Blocked, Todo)
                | (Blocked, Cancelled)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// Returns an error if:
    /// - The transition is not a valid edge.
    /// - The current state in the database does not match `from`
    ///   (optimistic lock failure).
    /// - The task does not exist.
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskState,
        to: TaskState,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        let rows = db::transition_task_state(pool, task_id, from, to, Utc::now())
            .await
            .with_context(|| {
                format!(
                    "failed to transition task {} from {} to {}",
                    task_id, from, to
                )
            })?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {} not found", task_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has state {}, expected {}",
                    task_id,
                    t.state,
                    from
                ),
            }
        }

        Ok(())
    }
}
