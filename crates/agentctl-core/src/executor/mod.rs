//! Executor: launches, tracks and stops agent executions within a
//! concurrency budget.
//!
//! One supervision worker per execution drives the whole pipeline:
//! provision workspace -> launch process (health-gated) -> bind adapter
//! -> initialize -> session/new -> prompt -> finalize. Lifecycle events
//! (`agent.started|ready|completed|failed|stopped`) are published on the
//! bus and mirrored into the execution record.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::json;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn};
use tracing::Instrument;
use uuid::Uuid;

use agentctl_db::models::{ExecutionStatus, Task};
use agentctl_db::queries::executions::{self, NewExecution};

use crate::backend::{Backend, BackendMap, Workspace};
use crate::bus::EventBus;
use crate::error::{ErrorKind, classify};
use crate::event::{Event, EventType, subjects};
use crate::launcher::{HealthGate, Launcher, LauncherConfig, StdioMode};
use crate::profile::{AgentProfile, ProfileRegistry};
use crate::protocol::ContentBlock;
use crate::session::SessionManager;

const SOURCE: &str = "agentctl-core";

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrency budget; admission is refused beyond it.
    pub max_concurrent: usize,
    /// Grace for SIGTERM before SIGKILL on stop.
    pub graceful_stop_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            graceful_stop_timeout: Duration::from_secs(10),
        }
    }
}

struct ActiveExecution {
    task_id: Uuid,
    cancel: CancellationToken,
    force: Arc<AtomicBool>,
}

/// Launches and tracks per-task executions.
pub struct Executor {
    pool: PgPool,
    bus: EventBus,
    backends: BackendMap,
    profiles: ProfileRegistry,
    sessions: Arc<SessionManager>,
    active: Mutex<HashMap<Uuid, ActiveExecution>>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        pool: PgPool,
        bus: EventBus,
        backends: BackendMap,
        profiles: ProfileRegistry,
        sessions: Arc<SessionManager>,
        config: ExecutorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            backends,
            profiles,
            sessions,
            active: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().expect("active mutex poisoned").len()
    }

    pub fn can_execute(&self) -> bool {
        self.active_count() < self.config.max_concurrent
    }

    /// Resolve an agent profile (delegated to the settings registry).
    pub fn resolve(&self, profile_id: Option<&str>) -> Result<AgentProfile> {
        self.profiles.resolve(profile_id).cloned()
    }

    /// Launch an execution for a task. Admission check and active-set
    /// insert happen under one mutex, so the concurrency cap holds under
    /// concurrent calls.
    pub fn execute(self: &Arc<Self>, task: &Task) -> Result<Uuid> {
        let profile = self.resolve(task.profile_id.as_deref())?;
        let backend_name = profile.executor.backend_name();
        let backend = self
            .backends
            .get(backend_name)
            .cloned()
            .with_context(|| format!("no backend registered for {backend_name}"))?;

        let execution_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let force = Arc::new(AtomicBool::new(false));

        {
            let mut active = self.active.lock().expect("active mutex poisoned");
            if active.len() >= self.config.max_concurrent {
                bail!(
                    "executor at capacity ({}/{})",
                    active.len(),
                    self.config.max_concurrent
                );
            }
            active.insert(
                execution_id,
                ActiveExecution {
                    task_id: task.id,
                    cancel: cancel.clone(),
                    force: Arc::clone(&force),
                },
            );
        }

        let executor = Arc::clone(self);
        let task = task.clone();
        let span = info_span!("execution", execution_id = %execution_id, task_id = %task.id);
        tokio::spawn(
            async move {
                executor
                    .supervise(execution_id, task, profile, backend, cancel)
                    .await;
            }
            .instrument(span),
        );

        Ok(execution_id)
    }

    /// Stop an execution. `force` skips the SIGTERM grace.
    pub fn stop(&self, execution_id: Uuid, force: bool) -> Result<()> {
        let active = self.active.lock().expect("active mutex poisoned");
        let entry = active
            .get(&execution_id)
            .with_context(|| format!("execution {execution_id} is not active"))?;
        if force {
            entry.force.store(true, Ordering::Relaxed);
        }
        entry.cancel.cancel();
        Ok(())
    }

    /// Stop every active execution (shutdown path).
    pub fn stop_all(&self) {
        let active = self.active.lock().expect("active mutex poisoned");
        for entry in active.values() {
            info!(task_id = %entry.task_id, "stopping execution");
            entry.cancel.cancel();
        }
    }

    fn publish_lifecycle(&self, subject: &str, data: serde_json::Value) {
        self.bus
            .publish(Event::new(EventType::AgentLifecycle, subject, SOURCE, data));
    }

    /// The supervision worker: one per execution.
    async fn supervise(
        self: Arc<Self>,
        execution_id: Uuid,
        task: Task,
        profile: AgentProfile,
        backend: Arc<dyn Backend>,
        cancel: CancellationToken,
    ) {
        let record = NewExecution {
            id: execution_id,
            task_id: task.id,
            profile_id: profile.id.clone(),
            backend: backend.name().to_string(),
        };
        if let Err(e) = executions::insert_execution(&self.pool, &record).await {
            warn!(error = %e, "failed to insert execution record");
            self.publish_lifecycle(
                subjects::AGENT_FAILED,
                json!({
                    "task_id": task.id.to_string(),
                    "execution_id": execution_id.to_string(),
                    "kind": ErrorKind::Resource.as_str(),
                    "message": format!("{e:#}"),
                }),
            );
            self.active
                .lock()
                .expect("active mutex poisoned")
                .remove(&execution_id);
            return;
        }

        self.publish_lifecycle(
            subjects::AGENT_STARTED,
            json!({
                "task_id": task.id.to_string(),
                "execution_id": execution_id.to_string(),
                "profile_id": profile.id.as_str(),
                "backend": backend.name(),
            }),
        );

        let outcome = self
            .drive(execution_id, &task, &profile, backend.as_ref(), &cancel)
            .await;

        match outcome {
            Ok(exit_code) => {
                let _ = executions::finish_execution(
                    &self.pool,
                    execution_id,
                    ExecutionStatus::Completed,
                    Some(exit_code),
                    None,
                    None,
                )
                .await;
                self.publish_lifecycle(
                    subjects::AGENT_COMPLETED,
                    json!({
                        "task_id": task.id.to_string(),
                        "execution_id": execution_id.to_string(),
                        "exit_code": exit_code,
                    }),
                );
            }
            Err(e) if cancel.is_cancelled() => {
                let _ = executions::finish_execution(
                    &self.pool,
                    execution_id,
                    ExecutionStatus::Stopped,
                    None,
                    Some(ErrorKind::Cancelled.as_str()),
                    Some(&format!("{e:#}")),
                )
                .await;
                self.publish_lifecycle(
                    subjects::AGENT_STOPPED,
                    json!({
                        "task_id": task.id.to_string(),
                        "execution_id": execution_id.to_string(),
                    }),
                );
            }
            Err(e) => {
                let kind = classify(&e);
                warn!(error = %format!("{e:#}"), kind = %kind, "execution failed");
                let _ = executions::finish_execution(
                    &self.pool,
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(kind.as_str()),
                    Some(&format!("{e:#}")),
                )
                .await;
                self.publish_lifecycle(
                    subjects::AGENT_FAILED,
                    json!({
                        "task_id": task.id.to_string(),
                        "execution_id": execution_id.to_string(),
                        "kind": kind.as_str(),
                        "message": format!("{e:#}"),
                    }),
                );
            }
        }

        let _ = self.sessions.close_session(execution_id).await;
        self.active
            .lock()
            .expect("active mutex poisoned")
            .remove(&execution_id);
    }

    /// The execution pipeline. Returns the agent's exit code.
    async fn drive(
        &self,
        execution_id: Uuid,
        task: &Task,
        profile: &AgentProfile,
        backend: &dyn Backend,
        cancel: &CancellationToken,
    ) -> Result<i32> {
        executions::update_execution_status(&self.pool, execution_id, ExecutionStatus::Starting)
            .await?;

        // 1. Workspace.
        let workspace = tokio::select! {
            workspace = backend.provision(task) => {
                workspace.context("failed to provision workspace")?
            }
            _ = cancel.cancelled() => bail!("cancelled during provisioning"),
        };

        // 2. Process, health-gated.
        let launch = backend.launch_command(&workspace, &profile.binary, &profile.command_args());
        let mut launcher = Launcher::new(LauncherConfig {
            binary: launch.binary,
            args: launch.args,
            env: profile.env.clone(),
            // Container workspaces only exist inside the container; the
            // wrapper command (docker exec) runs from our own cwd.
            working_dir: workspace
                .host_path
                .clone()
                .or_else(|| workspace.path.is_dir().then(|| workspace.path.clone()))
                .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
            port: profile.port,
            health: if profile.port.is_some() {
                HealthGate::Http
            } else {
                HealthGate::Disabled
            },
            stdio: StdioMode::Protocol,
            health_deadline: crate::launcher::DEFAULT_HEALTH_DEADLINE,
        });

        let result = self
            .run_session(execution_id, task, profile, backend, &workspace, &mut launcher, cancel)
            .await;

        // Cleanup happens on every path; force skips the SIGTERM grace.
        let graceful = if self
            .active
            .lock()
            .expect("active mutex poisoned")
            .get(&execution_id)
            .map(|entry| entry.force.load(Ordering::Relaxed))
            .unwrap_or(false)
        {
            Duration::ZERO
        } else {
            self.config.graceful_stop_timeout
        };
        let stop_result = launcher.stop(graceful).await;

        if let Err(e) = backend.teardown(&workspace).await {
            warn!(error = %e, "workspace teardown failed");
        }

        let exit_code = result?;
        // Prefer the agent's own exit code over the one stop() observed.
        Ok(exit_code.or(stop_result.ok().flatten()).unwrap_or(0))
    }

    /// Launch and converse. Returns the exit code when the process ended
    /// on its own.
    #[allow(clippy::too_many_arguments)]
    async fn run_session(
        &self,
        execution_id: Uuid,
        task: &Task,
        profile: &AgentProfile,
        backend: &dyn Backend,
        workspace: &Workspace,
        launcher: &mut Launcher,
        cancel: &CancellationToken,
    ) -> Result<Option<i32>> {
        launcher.start(cancel).await.context("agent launch failed")?;

        let runtime_ref = workspace
            .container_id
            .clone()
            .or_else(|| launcher.pid().map(|pid| pid.to_string()))
            .unwrap_or_default();
        executions::set_execution_runtime(
            &self.pool,
            execution_id,
            &runtime_ref,
            Some(&workspace.path.to_string_lossy()),
        )
        .await?;
        executions::update_execution_status(&self.pool, execution_id, ExecutionStatus::Running)
            .await?;

        let io = launcher
            .take_io()
            .context("launcher did not expose protocol stdio")?;

        let _session = self
            .sessions
            .create_session(execution_id, task.id, profile.protocol, io, &workspace.path)
            .await?;

        let run = async {
            self.sessions.initialize(execution_id).await?;

            let session_id = self
                .sessions
                .new_session(execution_id, &workspace.path, &[])
                .await?;
            executions::set_execution_session(&self.pool, execution_id, &session_id).await?;

            executions::update_execution_status(&self.pool, execution_id, ExecutionStatus::Ready)
                .await?;
            self.publish_lifecycle(
                subjects::AGENT_READY,
                json!({
                    "task_id": task.id.to_string(),
                    "execution_id": execution_id.to_string(),
                    "session_id": session_id,
                }),
            );

            let prompt = if task.description.is_empty() {
                task.title.clone()
            } else {
                format!("{}\n\n{}", task.title, task.description)
            };
            let outcome = self
                .sessions
                .prompt(execution_id, vec![ContentBlock::text(prompt)])
                .await?;

            if outcome.is_error {
                bail!("agent ended the turn with an error ({})", outcome.stop_reason);
            }
            info!(stop_reason = %outcome.stop_reason, "prompt turn completed");
            Ok::<(), anyhow::Error>(())
        };

        tokio::select! {
            result = run => {
                result?;
                // Stdio agents usually exit right after the turn; give
                // them a moment, then fall through to stop().
                let exit = tokio::time::timeout(Duration::from_secs(5), launcher.wait()).await;
                Ok(exit.ok().flatten())
            }
            _ = cancel.cancelled() => {
                // Best-effort cancel notification; the launcher shutdown
                // follows in drive().
                let _ = self.sessions.cancel(execution_id, "stopped by user").await;
                bail!("cancelled");
            }
        }
    }
}
