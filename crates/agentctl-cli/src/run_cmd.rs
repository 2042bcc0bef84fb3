//! The orchestrator process: wire the engine together and run until
//! interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use agentctl_core::backend::default_backends;
use agentctl_core::bus::EventBus;
use agentctl_core::executor::Executor;
use agentctl_core::recovery::recover_executions;
use agentctl_core::scheduler::Scheduler;
use agentctl_core::session::SessionManager;
use agentctl_core::session::permission::PermissionBroker;
use agentctl_core::watcher::Watcher;
use agentctl_db::pool;

use crate::config::{self, ResolvedConfig};
use crate::control::{self, ControlState};

/// How long to wait for storage before giving up with exit code 2.
const DB_READY_DEADLINE: Duration = Duration::from_secs(30);

/// Failures the process maps to exit codes.
#[derive(Debug, Error)]
pub enum RunError {
    /// Exit code 1.
    #[error(transparent)]
    Init(#[from] anyhow::Error),

    /// Exit code 2: storage never became healthy.
    #[error("database was not ready within {}s", DB_READY_DEADLINE.as_secs())]
    HealthTimeout,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Transport port (WebSocket/API collaborator binds it; logged here).
    pub port: u16,
    /// Control API port.
    pub control_port: u16,
    pub mode: String,
}

/// Poll the database until it answers, within the deadline.
async fn wait_for_database(resolved: &ResolvedConfig) -> Result<sqlx::PgPool, RunError> {
    let deadline = tokio::time::Instant::now() + DB_READY_DEADLINE;
    let mut backoff = Duration::from_millis(500);

    loop {
        // connect() pings the database, so an Ok pool is a healthy pool.
        match pool::connect(&resolved.db_config).await {
            Ok(db_pool) => return Ok(db_pool),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "database not ready, retrying");
            }
        }

        if tokio::time::Instant::now() + backoff >= deadline {
            return Err(RunError::HealthTimeout);
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(Duration::from_secs(5));
    }
}

/// Run the orchestrator until Ctrl-C.
pub async fn run(resolved: ResolvedConfig, options: RunOptions) -> Result<(), RunError> {
    if options.mode != "standalone" {
        return Err(anyhow!("unsupported mode {:?} (expected standalone)", options.mode).into());
    }

    let db_pool = wait_for_database(&resolved).await?;
    pool::run_migrations(&db_pool).await.map_err(RunError::Init)?;

    let profiles = resolved.profile_registry().map_err(RunError::Init)?;
    if profiles.is_empty() {
        return Err(anyhow!(
            "no agent profiles configured; add [profiles.*] sections to {}",
            config::config_path().display()
        )
        .into());
    }

    let workspace_root = resolved.workspace_root();
    std::fs::create_dir_all(&workspace_root)
        .with_context(|| format!("failed to create {}", workspace_root.display()))
        .map_err(RunError::Init)?;

    let bus = EventBus::new();
    let auto_approve = config::auto_approve_permissions();
    let broker = PermissionBroker::new(bus.clone(), None, auto_approve);
    let sessions = SessionManager::new(bus.clone(), broker);

    let backends = default_backends(workspace_root);
    let executor = Executor::new(
        db_pool.clone(),
        bus.clone(),
        backends.clone(),
        profiles.clone(),
        Arc::clone(&sessions),
        resolved.executor_config(),
    );
    let scheduler = Scheduler::new(
        db_pool.clone(),
        bus.clone(),
        Arc::clone(&executor),
        resolved.scheduler_config(),
    );
    let watcher = Watcher::new(db_pool.clone(), bus.clone(), Arc::clone(&scheduler));

    // Reattach whatever survived the previous process.
    let report = recover_executions(&db_pool, &bus, &backends, &sessions, &profiles)
        .await
        .map_err(RunError::Init)?;
    if !report.reattached.is_empty() || !report.failed.is_empty() {
        info!(
            reattached = report.reattached.len(),
            failed = report.failed.len(),
            "recovery pass finished"
        );
    }

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));
    let watcher_task = tokio::spawn(Arc::clone(&watcher).run(cancel.clone()));

    info!(
        mode = %options.mode,
        transport_port = options.port,
        control_port = options.control_port,
        auto_approve,
        "agentctl orchestrator running"
    );

    let state = ControlState {
        pool: db_pool.clone(),
        scheduler,
        executor: Arc::clone(&executor),
        sessions,
        watcher,
    };
    let control_cancel = cancel.clone();
    let control_task = tokio::spawn(async move {
        control::serve(state, options.control_port, control_cancel).await
    });

    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")
        .map_err(RunError::Init)?;
    info!("shutting down");

    cancel.cancel();
    executor.stop_all();

    let _ = tokio::time::timeout(Duration::from_secs(15), async {
        let _ = scheduler_task.await;
        let _ = watcher_task.await;
        let _ = control_task.await;
    })
    .await;

    db_pool.close().await;
    Ok(())
}
