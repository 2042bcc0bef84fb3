//! Database query functions for the `agent_executions` table.
//!
//! The engine owns these rows: it inserts one per launch attempt and
//! updates status, runtime reference, session id and outcome fields as the
//! execution progresses. Everything else in storage belongs to external
//! collaborators.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AgentExecution, ExecutionStatus};

/// Parameters for inserting a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub profile_id: String,
    pub backend: String,
}

/// Insert a new execution in `pending` status.
///
/// The partial unique index on live executions makes this fail if the task
/// already has a non-terminal execution.
pub async fn insert_execution(pool: &PgPool, new: &NewExecution) -> Result<AgentExecution> {
    let execution = sqlx::query_as::<_, AgentExecution>(
        "INSERT INTO agent_executions (id, task_id, profile_id, backend) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.id)
    .bind(new.task_id)
    .bind(&new.profile_id)
    .bind(&new.backend)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert execution for task {}", new.task_id))?;

    Ok(execution)
}

/// Fetch a single execution by ID.
pub async fn get_execution(pool: &PgPool, id: Uuid) -> Result<Option<AgentExecution>> {
    let execution =
        sqlx::query_as::<_, AgentExecution>("SELECT * FROM agent_executions WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch execution")?;

    Ok(execution)
}

/// List executions that are not in a terminal status.
///
/// Used by recovery on startup to find sessions worth reattaching.
pub async fn list_live_executions(pool: &PgPool) -> Result<Vec<AgentExecution>> {
    let executions = sqlx::query_as::<_, AgentExecution>(
        "SELECT * FROM agent_executions \
         WHERE status NOT IN ('completed', 'failed', 'stopped') \
         ORDER BY created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list live executions")?;

    Ok(executions)
}

/// Update the status of an execution, setting `started_at` on the first
/// transition into `starting`.
pub async fn update_execution_status(
    pool: &PgPool,
    id: Uuid,
    status: ExecutionStatus,
) -> Result<()> {
    let started_at: Option<DateTime<Utc>> = if status == ExecutionStatus::Starting {
        Some(Utc::now())
    } else {
        None
    };

    let result = sqlx::query(
        "UPDATE agent_executions \
         SET status = $1, started_at = COALESCE(started_at, $2) \
         WHERE id = $3",
    )
    .bind(status)
    .bind(started_at)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to update execution {id} status to {status}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution {id} not found");
    }

    Ok(())
}

/// Record the runtime reference (container id or host pid) and workspace
/// path once the backend has provisioned them.
pub async fn set_execution_runtime(
    pool: &PgPool,
    id: Uuid,
    runtime_ref: &str,
    workspace_path: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "UPDATE agent_executions SET runtime_ref = $1, workspace_path = $2 WHERE id = $3",
    )
    .bind(runtime_ref)
    .bind(workspace_path)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set runtime ref for execution {id}"))?;

    Ok(())
}

/// Record the ACP session id assigned by the agent on `session/new`.
///
/// The id is set exactly once; a second write with a different value fails.
pub async fn set_execution_session(pool: &PgPool, id: Uuid, session_id: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE agent_executions SET acp_session_id = $1 \
         WHERE id = $2 AND (acp_session_id IS NULL OR acp_session_id = $1)",
    )
    .bind(session_id)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to set session id for execution {id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution {id} already has a different session id");
    }

    Ok(())
}

/// Finish an execution: terminal status, stop timestamp, exit code, and the
/// classified error (if any).
pub async fn finish_execution(
    pool: &PgPool,
    id: Uuid,
    status: ExecutionStatus,
    exit_code: Option<i32>,
    error_kind: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE agent_executions \
         SET status = $1, stopped_at = now(), exit_code = $2, error_kind = $3, error_message = $4 \
         WHERE id = $5",
    )
    .bind(status)
    .bind(exit_code)
    .bind(error_kind)
    .bind(error_message)
    .bind(id)
    .execute(pool)
    .await
    .with_context(|| format!("failed to finish execution {id}"))?;

    if result.rows_affected() == 0 {
        anyhow::bail!("execution {id} not found");
    }

    Ok(())
}
