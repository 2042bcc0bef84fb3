//! Convenience dispatch helpers that wrap [`super::TaskStateMachine`]
//! transitions with semantic names.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use agentctl_db::models::TaskState;

use super::TaskStateMachine;

/// Pull a task into the queue: transition `todo -> scheduling`.
pub async fn begin_scheduling(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskState::Todo, TaskState::Scheduling).await
}

/// Hand a task to the executor: transition `scheduling -> in_progress`.
pub async fn start_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskState::Scheduling, TaskState::InProgress)
        .await
}

/// Put a task back after a failed submit: transition `scheduling -> todo`.
pub async fn revert_scheduling(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskState::Scheduling, TaskState::Todo).await
}

/// Re-enqueue a failed attempt: transition `in_progress -> scheduling`.
pub async fn requeue_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskState::InProgress, TaskState::Scheduling)
        .await
}

/// Finish a task: transition `in_progress -> completed`.
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, TaskState::InProgress, TaskState::Completed)
        .await
}

/// Fail a task from an explicit prior state.
pub async fn fail_task(pool: &PgPool, task_id: Uuid, from: TaskState) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskState::Failed).await
}

/// Cancel a task from an explicit prior state.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid, from: TaskState) -> Result<()> {
    TaskStateMachine::transition(pool, task_id, from, TaskState::Cancelled).await
}

/// Park a task on user input: transition `in_progress -> waiting_for_input`.
pub async fn request_input(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskState::InProgress,
        TaskState::WaitingForInput,
    )
    .await
}

/// Resume after input: transition `waiting_for_input -> in_progress`.
pub async fn resume_task(pool: &PgPool, task_id: Uuid) -> Result<()> {
    TaskStateMachine::transition(
        pool,
        task_id,
        TaskState::WaitingForInput,
        TaskState::InProgress,
    )
    .await
}
