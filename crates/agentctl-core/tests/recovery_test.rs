//! Startup recovery: live executions are reattached (including demux of
//! framed backend streams), dead ones are failed with
//! `backend_unreachable`.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use uuid::Uuid;

use agentctl_db::models::{AgentExecution, ExecutionStatus, Task};
use agentctl_db::queries::{executions, tasks as task_db};
use agentctl_test_utils::TestDb;

use agentctl_core::backend::{Backend, BackendMap, LaunchCommand, Workspace};
use agentctl_core::bus::EventBus;
use agentctl_core::event::subjects;
use agentctl_core::profile::{AgentProfile, ExecutorKind, ProfileRegistry};
use agentctl_core::protocol::framing::encode_log_frame;
use agentctl_core::protocol::{AdapterKind, AgentIo};
use agentctl_core::recovery::recover_executions;
use agentctl_core::session::SessionManager;
use agentctl_core::session::permission::PermissionBroker;

// ===========================================================================
// A fake containerised backend
// ===========================================================================

/// Backend whose attach hands out one side of a duplex pair; the other
/// side is driven by a scripted agent task. `framed` wraps every agent
/// line in the container log framing to exercise the demux path.
struct FakeBackend {
    alive: bool,
    framed: bool,
}

#[async_trait]
impl Backend for FakeBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn framed_logs(&self) -> bool {
        self.framed
    }

    async fn provision(&self, _task: &Task) -> Result<Workspace> {
        bail!("recovery tests never provision")
    }

    fn launch_command(
        &self,
        _workspace: &Workspace,
        binary: &str,
        args: &[String],
    ) -> LaunchCommand {
        LaunchCommand {
            binary: binary.to_string(),
            args: args.to_vec(),
        }
    }

    async fn is_alive(&self, _execution: &AgentExecution) -> bool {
        self.alive
    }

    async fn attach(&self, _execution: &AgentExecution) -> Result<AgentIo> {
        let (engine_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);

        let framed = self.framed;
        tokio::spawn(async move {
            run_fake_agent(agent_read, agent_write, framed).await;
        });

        Ok(AgentIo {
            stdin: Box::new(engine_write) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
            stdout: Box::new(engine_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
        })
    }

    async fn teardown(&self, _workspace: &Workspace) -> Result<()> {
        Ok(())
    }
}

/// Scripted agent: answers `initialize` and `session/load`. Writes raw
/// lines or framed chunks depending on the backend flavour.
async fn run_fake_agent(
    read_half: tokio::io::ReadHalf<tokio::io::DuplexStream>,
    mut write_half: tokio::io::WriteHalf<tokio::io::DuplexStream>,
    framed: bool,
) {
    let mut lines = BufReader::new(read_half).lines();

    let send = |value: Value| {
        let line = format!("{value}\n");
        if framed {
            encode_log_frame(1, line.as_bytes())
        } else {
            line.into_bytes()
        }
    };

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(msg) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        let id = msg["id"].clone();
        match msg["method"].as_str() {
            Some("initialize") => {
                let reply = send(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"protocolVersion": 1, "agentCapabilities": {"loadSession": true}},
                }));
                if write_half.write_all(&reply).await.is_err() {
                    return;
                }
            }
            Some("session/load") => {
                let reply = send(json!({"jsonrpc": "2.0", "id": id, "result": {}}));
                if write_half.write_all(&reply).await.is_err() {
                    return;
                }
            }
            _ => {}
        }
    }
}

// ===========================================================================
// Harness
// ===========================================================================

struct Rig {
    pool: sqlx::PgPool,
    db: TestDb,
    bus: EventBus,
    sessions: Arc<SessionManager>,
    profiles: ProfileRegistry,
    task: Task,
}

async fn rig() -> Rig {
    let db = TestDb::new().await;
    let pool = db.pool_owned();
    let bus = EventBus::new();
    let broker = PermissionBroker::new(bus.clone(), None, true);
    let sessions = SessionManager::new(bus.clone(), broker);

    let mut profiles = ProfileRegistry::new();
    profiles.register(AgentProfile {
        id: "recoverable".to_string(),
        name: "Recoverable agent".to_string(),
        binary: "unused".to_string(),
        args: vec![],
        model: None,
        protocol: AdapterKind::Acp,
        executor: ExecutorKind::LocalDocker,
        env: HashMap::new(),
        port: None,
    });

    let task = task_db::insert_task(
        &pool,
        Uuid::new_v4(),
        Uuid::new_v4(),
        "recover me",
        "",
        5,
        Some("recoverable"),
        &[],
    )
    .await
    .expect("insert_task");

    Rig {
        pool,
        db,
        bus,
        sessions,
        profiles,
        task,
    }
}

async fn insert_live_execution(rig: &Rig, session_id: Option<&str>) -> AgentExecution {
    let execution = executions::insert_execution(
        &rig.pool,
        &executions::NewExecution {
            id: Uuid::new_v4(),
            task_id: rig.task.id,
            profile_id: "recoverable".to_string(),
            backend: "docker".to_string(),
        },
    )
    .await
    .expect("insert_execution");

    executions::set_execution_runtime(&rig.pool, execution.id, "container-1", Some("/tmp"))
        .await
        .unwrap();
    if let Some(session_id) = session_id {
        executions::set_execution_session(&rig.pool, execution.id, session_id)
            .await
            .unwrap();
    }
    executions::update_execution_status(&rig.pool, execution.id, ExecutionStatus::Running)
        .await
        .unwrap();

    executions::get_execution(&rig.pool, execution.id)
        .await
        .unwrap()
        .unwrap()
}

fn backends(alive: bool, framed: bool) -> BackendMap {
    let mut backends: BackendMap = HashMap::new();
    backends.insert("docker".to_string(), Arc::new(FakeBackend { alive, framed }));
    backends
}

async fn teardown(rig: Rig) {
    rig.db.close().await;
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn live_execution_is_reattached() {
    let rig = rig().await;
    let execution = insert_live_execution(&rig, Some("sess-re-1")).await;

    let mut ready = rig.bus.subscribe(subjects::AGENT_READY);

    let report = recover_executions(
        &rig.pool,
        &rig.bus,
        &backends(true, false),
        &rig.sessions,
        &rig.profiles,
    )
    .await
    .unwrap();

    assert_eq!(report.reattached, vec![execution.id]);
    assert!(report.failed.is_empty());

    let event = ready.recv().await.unwrap();
    assert_eq!(event.data["recovered"], true);
    assert_eq!(event.data["session_id"], "sess-re-1");

    let session = rig.sessions.get_session(execution.id).expect("session exists");
    assert_eq!(session.acp_session_id().as_deref(), Some("sess-re-1"));

    let refreshed = executions::get_execution(&rig.pool, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Running);

    teardown(rig).await;
}

#[tokio::test]
async fn framed_backend_stream_is_demuxed_during_recovery() {
    let rig = rig().await;
    let execution = insert_live_execution(&rig, Some("sess-re-2")).await;

    let report = recover_executions(
        &rig.pool,
        &rig.bus,
        &backends(true, true),
        &rig.sessions,
        &rig.profiles,
    )
    .await
    .unwrap();

    assert_eq!(
        report.reattached,
        vec![execution.id],
        "the framed stream must demux into parseable JSON-RPC"
    );

    teardown(rig).await;
}

#[tokio::test]
async fn dead_backend_fails_the_execution() {
    let rig = rig().await;
    let execution = insert_live_execution(&rig, Some("sess-re-3")).await;

    let mut failures = rig.bus.subscribe(subjects::AGENT_FAILED);

    let report = recover_executions(
        &rig.pool,
        &rig.bus,
        &backends(false, false),
        &rig.sessions,
        &rig.profiles,
    )
    .await
    .unwrap();

    assert!(report.reattached.is_empty());
    assert_eq!(report.failed, vec![execution.id]);

    let event = failures.recv().await.unwrap();
    assert_eq!(event.data["message"], "backend_unreachable");

    let refreshed = executions::get_execution(&rig.pool, execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.status, ExecutionStatus::Failed);
    assert_eq!(refreshed.error_message.as_deref(), Some("backend_unreachable"));

    teardown(rig).await;
}

#[tokio::test]
async fn missing_session_id_cannot_be_recovered() {
    let rig = rig().await;
    let execution = insert_live_execution(&rig, None).await;

    let report = recover_executions(
        &rig.pool,
        &rig.bus,
        &backends(true, false),
        &rig.sessions,
        &rig.profiles,
    )
    .await
    .unwrap();

    assert_eq!(report.failed, vec![execution.id]);

    teardown(rig).await;
}

#[tokio::test]
async fn terminal_executions_are_left_alone() {
    let rig = rig().await;
    let execution = insert_live_execution(&rig, Some("sess-done")).await;
    executions::finish_execution(
        &rig.pool,
        execution.id,
        ExecutionStatus::Completed,
        Some(0),
        None,
        None,
    )
    .await
    .unwrap();

    let report = recover_executions(
        &rig.pool,
        &rig.bus,
        &backends(true, false),
        &rig.sessions,
        &rig.profiles,
    )
    .await
    .unwrap();

    assert!(report.reattached.is_empty());
    assert!(report.failed.is_empty());

    teardown(rig).await;
}
