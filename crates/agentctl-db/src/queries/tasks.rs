//! Database query functions for the `tasks` table.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Task, TaskRepository, TaskState};

/// Insert a new task row.
#[allow(clippy::too_many_arguments)]
pub async fn insert_task(
    pool: &PgPool,
    workspace_id: Uuid,
    board_id: Uuid,
    title: &str,
    description: &str,
    priority: i32,
    profile_id: Option<&str>,
    repositories: &[TaskRepository],
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (id, workspace_id, board_id, title, description, priority, profile_id, repositories) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
         RETURNING *",
    )
    .bind(Uuid::new_v4())
    .bind(workspace_id)
    .bind(board_id)
    .bind(title)
    .bind(description)
    .bind(priority)
    .bind(profile_id)
    .bind(sqlx::types::Json(repositories))
    .fetch_one(pool)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all tasks currently in a given state, ordered by priority then age.
///
/// Used on startup to replay pending work into the in-memory queue.
pub async fn list_tasks_in_state(pool: &PgPool, state: TaskState) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE state = $1 \
         ORDER BY priority DESC, created_at ASC",
    )
    .bind(state)
    .fetch_all(pool)
    .await
    .context("failed to list tasks in state")?;

    Ok(tasks)
}

/// Atomically transition a task from one state to another.
///
/// The `WHERE state = $from` clause makes this an optimistic lock: if the
/// task was concurrently moved to a different state, zero rows are
/// affected and the caller must decide how to proceed.
///
/// Returns the number of rows affected (0 or 1).
pub async fn transition_task_state(
    pool: &PgPool,
    id: Uuid,
    from: TaskState,
    to: TaskState,
    updated_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET state = $1, updated_at = $2 \
         WHERE id = $3 AND state = $4",
    )
    .bind(to)
    .bind(updated_at)
    .bind(id)
    .bind(from)
    .execute(pool)
    .await
    .with_context(|| format!("failed to transition task {id} from {from} to {to}"))?;

    Ok(result.rows_affected())
}

/// Force a task into a state regardless of its current state.
///
/// Reserved for operator overrides and error recovery; normal transitions
/// go through [`transition_task_state`].
pub async fn set_task_state(pool: &PgPool, id: Uuid, state: TaskState) -> Result<()> {
    let result = sqlx::query("UPDATE tasks SET state = $1, updated_at = now() WHERE id = $2")
        .bind(state)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set task state")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("task {id} not found");
    }

    Ok(())
}
