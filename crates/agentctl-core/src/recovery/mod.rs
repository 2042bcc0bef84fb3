//! Startup recovery: reattach to executions that were live when the
//! previous orchestrator process died.
//!
//! For every non-terminal execution record, probe the backend for
//! liveness. Alive: reattach stdio (demuxed for framed backends),
//! rebuild the protocol adapter, and resume the ACP session from the
//! stored session id. Dead: the execution fails with
//! `backend_unreachable`.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::json;
use sqlx::PgPool;
use tracing::{Instrument, info, info_span, warn};
use uuid::Uuid;

use agentctl_db::models::{AgentExecution, ExecutionStatus};
use agentctl_db::queries::executions;

use crate::backend::{BackendMap, attach_io};
use crate::bus::EventBus;
use crate::error::ErrorKind;
use crate::event::{Event, EventType, subjects};
use crate::profile::ProfileRegistry;
use crate::session::SessionManager;

const SOURCE: &str = "agentctl-core";
const UNREACHABLE: &str = "backend_unreachable";

/// What recovery did on startup.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub reattached: Vec<Uuid>,
    pub failed: Vec<Uuid>,
}

/// Scan non-terminal executions and reattach or fail each one.
pub async fn recover_executions(
    pool: &PgPool,
    bus: &EventBus,
    backends: &BackendMap,
    sessions: &Arc<SessionManager>,
    profiles: &ProfileRegistry,
) -> Result<RecoveryReport> {
    let live = executions::list_live_executions(pool).await?;
    let mut report = RecoveryReport::default();

    for execution in live {
        let execution_id = execution.id;
        let span = info_span!("session.recover", execution_id = %execution_id, task_id = %execution.task_id);
        let result = reattach(pool, bus, backends, sessions, profiles, &execution)
            .instrument(span)
            .await;

        match result {
            Ok(()) => {
                info!(execution_id = %execution_id, "execution reattached");
                report.reattached.push(execution_id);
            }
            Err(e) => {
                warn!(
                    execution_id = %execution_id,
                    error = %format!("{e:#}"),
                    "reattach failed, marking execution failed"
                );
                let _ = executions::finish_execution(
                    pool,
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(ErrorKind::Transport.as_str()),
                    Some(UNREACHABLE),
                )
                .await;
                bus.publish(Event::new(
                    EventType::AgentLifecycle,
                    subjects::AGENT_FAILED,
                    SOURCE,
                    json!({
                        "task_id": execution.task_id.to_string(),
                        "execution_id": execution_id.to_string(),
                        "kind": ErrorKind::Transport.as_str(),
                        "message": UNREACHABLE,
                    }),
                ));
                report.failed.push(execution_id);
            }
        }
    }

    Ok(report)
}

async fn reattach(
    pool: &PgPool,
    bus: &EventBus,
    backends: &BackendMap,
    sessions: &Arc<SessionManager>,
    profiles: &ProfileRegistry,
    execution: &AgentExecution,
) -> Result<()> {
    let backend = backends
        .get(&execution.backend)
        .with_context(|| format!("no backend registered for {}", execution.backend))?;

    if !backend.is_alive(execution).await {
        bail!("backend reports the execution is gone");
    }

    let session_id = execution
        .acp_session_id
        .as_deref()
        .context("execution has no stored session id")?;

    let profile = profiles
        .resolve(Some(&execution.profile_id))
        .with_context(|| format!("unknown profile {}", execution.profile_id))?;

    let workspace_root = execution
        .workspace_path
        .as_deref()
        .map(std::path::PathBuf::from)
        .context("execution has no stored workspace path")?;

    let io = backend
        .attach(execution)
        .await
        .context("failed to reattach stdio")?;
    let io = attach_io(backend.as_ref(), io);

    sessions
        .create_session(execution.id, execution.task_id, profile.protocol, io, &workspace_root)
        .await?;
    sessions.initialize(execution.id).await?;
    sessions
        .load_session(execution.id, session_id)
        .await
        .with_context(|| format!("session/load failed for {session_id}"))?;

    executions::update_execution_status(pool, execution.id, ExecutionStatus::Running).await?;

    bus.publish(Event::new(
        EventType::AgentLifecycle,
        subjects::AGENT_READY,
        SOURCE,
        json!({
            "task_id": execution.task_id.to_string(),
            "execution_id": execution.id.to_string(),
            "session_id": session_id,
            "recovered": true,
        }),
    ));

    Ok(())
}
