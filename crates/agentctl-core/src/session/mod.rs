//! Session manager: owns the live ACP-level sessions keyed by execution
//! id, pumps their normalised updates onto the bus, and fronts the
//! permission broker.

pub mod permission;

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

use crate::bus::EventBus;
use crate::event::{Event, EventType, subjects};
use crate::protocol::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PromptOutcome, ProtocolAdapter, SessionPhase, SessionUpdate, create_adapter,
};
use self::permission::{PendingPermission, PermissionBroker, PermissionDecision, PermissionError};

const SOURCE: &str = "agentctl-core";

/// One live session.
pub struct Session {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub adapter: Arc<dyn ProtocolAdapter>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Current phase of the session state machine.
    pub fn status(&self) -> SessionPhase {
        self.adapter.phase()
    }

    pub fn acp_session_id(&self) -> Option<String> {
        self.adapter.session_id()
    }
}

/// Publish one normalised update as a bus event.
fn publish_update(
    bus: &EventBus,
    task_id: Uuid,
    session_id: &str,
    update: SessionUpdate,
) {
    let event = match update {
        SessionUpdate::MessageChunk { text } => Event::new(
            EventType::MessageChunk,
            subjects::acp_message(task_id),
            SOURCE,
            json!({"task_id": task_id.to_string(), "session_id": session_id, "text": text}),
        ),
        SessionUpdate::Reasoning { text } => Event::new(
            EventType::Reasoning,
            subjects::acp_message(task_id),
            SOURCE,
            json!({"task_id": task_id.to_string(), "session_id": session_id, "text": text}),
        ),
        SessionUpdate::Plan { entries } => Event::new(
            EventType::Plan,
            subjects::acp_message(task_id),
            SOURCE,
            json!({"task_id": task_id.to_string(), "session_id": session_id, "entries": entries}),
        ),
        SessionUpdate::ToolCall {
            tool_call_id,
            title,
            status,
            args,
        } => Event::new(
            EventType::ToolCall,
            subjects::tool_call_started(session_id),
            SOURCE,
            json!({
                "task_id": task_id.to_string(),
                "session_id": session_id,
                "tool_call_id": tool_call_id,
                "title": title,
                "status": status,
                "args": args,
            }),
        ),
        SessionUpdate::ToolCallUpdate {
            tool_call_id,
            status,
            result,
        } => Event::new(
            EventType::ToolCallUpdate,
            subjects::tool_call_complete(session_id),
            SOURCE,
            json!({
                "task_id": task_id.to_string(),
                "session_id": session_id,
                "tool_call_id": tool_call_id,
                "status": status,
                "result": result,
            }),
        ),
        SessionUpdate::Complete {
            stop_reason,
            is_error,
        } => Event::new(
            EventType::Complete,
            subjects::prompt_complete(session_id),
            SOURCE,
            json!({
                "task_id": task_id.to_string(),
                "session_id": session_id,
                "stop_reason": stop_reason,
                "is_error": is_error,
            }),
        ),
        SessionUpdate::Error { kind, message } => Event::new(
            EventType::SessionError,
            subjects::acp_message(task_id),
            SOURCE,
            json!({
                "task_id": task_id.to_string(),
                "session_id": session_id,
                "kind": kind,
                "message": message,
            }),
        ),
    };
    bus.publish(event);
}

/// The collection of live sessions.
pub struct SessionManager {
    bus: EventBus,
    broker: Arc<PermissionBroker>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(bus: EventBus, broker: Arc<PermissionBroker>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            broker,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn broker(&self) -> Arc<PermissionBroker> {
        Arc::clone(&self.broker)
    }

    /// Bind an adapter over the agent's transport and register the
    /// session. One session per execution.
    pub async fn create_session(
        &self,
        instance_id: Uuid,
        task_id: Uuid,
        kind: AdapterKind,
        io: AgentIo,
        workspace_root: &Path,
    ) -> Result<Arc<Session>> {
        {
            let sessions = self.sessions.read().expect("sessions lock poisoned");
            if sessions.contains_key(&instance_id) {
                bail!("execution {instance_id} already has a session");
            }
        }

        let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
        let ctx = AdapterContext {
            instance_id,
            task_id,
            workspace_root: workspace_root.to_path_buf(),
            updates: updates_tx,
            permissions: self.broker.clone(),
        };

        let adapter = create_adapter(kind, io, ctx)
            .await
            .with_context(|| format!("failed to create {kind:?} adapter"))?;

        // Pump: every normalised update becomes a bus event. The session
        // id may not exist yet; fall back to the instance id.
        let pump = {
            let bus = self.bus.clone();
            let adapter = Arc::clone(&adapter);
            tokio::spawn(async move {
                while let Some(update) = updates_rx.recv().await {
                    let session_id = adapter
                        .session_id()
                        .unwrap_or_else(|| instance_id.to_string());
                    publish_update(&bus, task_id, &session_id, update);
                }
            })
        };

        let session = Arc::new(Session {
            instance_id,
            task_id,
            adapter,
            pump: Mutex::new(Some(pump)),
        });

        self.sessions
            .write()
            .expect("sessions lock poisoned")
            .insert(instance_id, Arc::clone(&session));

        Ok(session)
    }

    fn require(&self, instance_id: Uuid) -> Result<Arc<Session>> {
        self.get_session(instance_id)
            .with_context(|| format!("no session for execution {instance_id}"))
    }

    pub fn get_session(&self, instance_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .expect("sessions lock poisoned")
            .get(&instance_id)
            .cloned()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("sessions lock poisoned").len()
    }

    pub async fn initialize(&self, instance_id: Uuid) -> Result<AgentCapabilities> {
        let session = self.require(instance_id)?;
        session.adapter.initialize().await
    }

    /// Create the agent-side session; publishes
    /// `agent.acp_session_created` so the id can be persisted for
    /// recovery.
    pub async fn new_session(
        &self,
        instance_id: Uuid,
        cwd: &Path,
        mcp_servers: &[McpServerConfig],
    ) -> Result<String> {
        let session = self.require(instance_id)?;
        let session_id = session.adapter.new_session(cwd, mcp_servers).await?;

        self.bus.publish(Event::new(
            EventType::AgentLifecycle,
            subjects::AGENT_SESSION_CREATED,
            SOURCE,
            json!({
                "task_id": session.task_id.to_string(),
                "instance_id": instance_id.to_string(),
                "session_id": session_id,
            }),
        ));

        Ok(session_id)
    }

    pub async fn load_session(&self, instance_id: Uuid, session_id: &str) -> Result<()> {
        let session = self.require(instance_id)?;
        session.adapter.load_session(session_id).await
    }

    pub async fn prompt(
        &self,
        instance_id: Uuid,
        blocks: Vec<ContentBlock>,
    ) -> Result<PromptOutcome> {
        let session = self.require(instance_id)?;
        session.adapter.prompt(blocks).await
    }

    /// Fire-and-forget cancellation; callers await a `complete` event or
    /// read-loop exit.
    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<()> {
        let session = self.require(instance_id)?;
        session.adapter.cancel(reason).await
    }

    /// Close the adapter and drop the session.
    pub async fn close_session(&self, instance_id: Uuid) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().expect("sessions lock poisoned");
            sessions.remove(&instance_id)
        };
        let Some(session) = session else {
            debug!(instance_id = %instance_id, "close for unknown session");
            return Ok(());
        };

        session.adapter.close().await?;
        let pump = session.pump.lock().expect("pump lock poisoned").take();
        if let Some(pump) = pump {
            // Let queued updates drain before the pump dies.
            tokio::spawn(async move {
                let _ = tokio::time::timeout(std::time::Duration::from_secs(1), pump).await;
            });
        }
        Ok(())
    }

    pub fn respond_to_permission(
        &self,
        pending_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), PermissionError> {
        self.broker.respond(pending_id, decision)
    }

    pub fn get_pending_permissions_for_task(&self, task_id: Uuid) -> Vec<PendingPermission> {
        self.broker.pending_for_task(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

    struct Rig {
        manager: Arc<SessionManager>,
        bus: EventBus,
        instance_id: Uuid,
        task_id: Uuid,
        agent_read: BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        agent_write: tokio::io::WriteHalf<tokio::io::DuplexStream>,
        workspace: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let bus = EventBus::new();
        let broker = PermissionBroker::new(bus.clone(), None, true);
        let manager = SessionManager::new(bus.clone(), broker);

        let (engine_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let (agent_read, agent_write) = tokio::io::split(agent_side);

        let workspace = tempfile::tempdir().unwrap();
        let instance_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();

        manager
            .create_session(
                instance_id,
                task_id,
                AdapterKind::Acp,
                AgentIo {
                    stdin: Box::new(engine_write) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
                    stdout: Box::new(engine_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
                },
                workspace.path(),
            )
            .await
            .unwrap();

        Rig {
            manager,
            bus,
            instance_id,
            task_id,
            agent_read: BufReader::new(agent_read),
            agent_write,
            workspace,
        }
    }

    async fn next_request(rig: &mut Rig) -> Value {
        let mut line = String::new();
        rig.agent_read.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn agent_send(rig: &mut Rig, value: Value) {
        rig.agent_write
            .write_all(format!("{value}\n").as_bytes())
            .await
            .unwrap();
    }

    async fn handshake(rig: &mut Rig) {
        let init = tokio::spawn({
            let manager = Arc::clone(&rig.manager);
            let id = rig.instance_id;
            async move { manager.initialize(id).await }
        });
        let request = next_request(rig).await;
        let id = request["id"].clone();
        agent_send(
            rig,
            json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": 1}}),
        )
        .await;
        init.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn duplicate_session_is_rejected() {
        let mut rig = rig().await;
        handshake(&mut rig).await;

        let (engine_side, _agent_side) = tokio::io::duplex(4096);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let result = rig
            .manager
            .create_session(
                rig.instance_id,
                rig.task_id,
                AdapterKind::Acp,
                AgentIo {
                    stdin: Box::new(engine_write),
                    stdout: Box::new(engine_read),
                },
                rig.workspace.path(),
            )
            .await;
        assert!(result.is_err());
        assert_eq!(rig.manager.session_count(), 1);
    }

    #[tokio::test]
    async fn session_created_event_is_published() {
        let mut rig = rig().await;
        let mut lifecycle = rig.bus.subscribe(subjects::AGENT_SESSION_CREATED);
        handshake(&mut rig).await;

        let new_session = tokio::spawn({
            let manager = Arc::clone(&rig.manager);
            let id = rig.instance_id;
            let cwd = rig.workspace.path().to_path_buf();
            async move { manager.new_session(id, &cwd, &[]).await }
        });
        let request = next_request(&mut rig).await;
        let id = request["id"].clone();
        agent_send(
            &mut rig,
            json!({"jsonrpc": "2.0", "id": id, "result": {"sessionId": "sess-9"}}),
        )
        .await;
        assert_eq!(new_session.await.unwrap().unwrap(), "sess-9");

        let event = lifecycle.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::AgentLifecycle);
        assert_eq!(event.data["session_id"], "sess-9");
        assert_eq!(event.data["task_id"], rig.task_id.to_string());
    }

    #[tokio::test]
    async fn updates_flow_to_their_subjects() {
        let mut rig = rig().await;
        let mut messages = rig.bus.subscribe(subjects::ACP_MESSAGE_ALL);
        let mut tool_calls = rig.bus.subscribe(subjects::TOOL_CALL_ALL);
        let mut prompt_complete = rig.bus.subscribe(subjects::PROMPT_COMPLETE_ALL);

        handshake(&mut rig).await;

        // session/new
        let new_session = tokio::spawn({
            let manager = Arc::clone(&rig.manager);
            let id = rig.instance_id;
            let cwd = rig.workspace.path().to_path_buf();
            async move { manager.new_session(id, &cwd, &[]).await }
        });
        let request = next_request(&mut rig).await;
        let id = request["id"].clone();
        agent_send(
            &mut rig,
            json!({"jsonrpc": "2.0", "id": id, "result": {"sessionId": "sess-2"}}),
        )
        .await;
        new_session.await.unwrap().unwrap();

        // prompt with one message chunk and one tool call
        let prompt = tokio::spawn({
            let manager = Arc::clone(&rig.manager);
            let id = rig.instance_id;
            async move { manager.prompt(id, vec![ContentBlock::text("go")]).await }
        });
        let request = next_request(&mut rig).await;
        let id = request["id"].clone();
        agent_send(
            &mut rig,
            json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "sess-2",
                    "update": {
                        "sessionUpdate": "agent_message_chunk",
                        "content": {"type": "text", "text": "hi"},
                    },
                },
            }),
        )
        .await;
        agent_send(
            &mut rig,
            json!({
                "jsonrpc": "2.0",
                "method": "session/update",
                "params": {
                    "sessionId": "sess-2",
                    "update": {
                        "sessionUpdate": "tool_call",
                        "toolCallId": "tc-1",
                        "title": "Bash",
                        "status": "running",
                    },
                },
            }),
        )
        .await;
        agent_send(
            &mut rig,
            json!({"jsonrpc": "2.0", "id": id, "result": {"stopReason": "end_turn"}}),
        )
        .await;
        prompt.await.unwrap().unwrap();

        let message = messages.recv().await.unwrap();
        assert_eq!(message.event_type, EventType::MessageChunk);
        assert_eq!(message.subject, subjects::acp_message(rig.task_id));
        assert_eq!(message.data["text"], "hi");
        assert_eq!(message.task_id(), Some(rig.task_id));

        let tool_call = tool_calls.recv().await.unwrap();
        assert_eq!(tool_call.event_type, EventType::ToolCall);
        assert_eq!(tool_call.subject, "tool_call.started.sess-2");

        let complete = prompt_complete.recv().await.unwrap();
        assert_eq!(complete.event_type, EventType::Complete);
        assert_eq!(complete.subject, "prompt.complete.sess-2");
        assert_eq!(complete.data["stop_reason"], "end_turn");
    }

    #[tokio::test]
    async fn close_session_removes_it() {
        let mut rig = rig().await;
        handshake(&mut rig).await;

        rig.manager.close_session(rig.instance_id).await.unwrap();
        assert_eq!(rig.manager.session_count(), 0);
        assert!(rig.manager.get_session(rig.instance_id).is_none());

        // Closing twice is a no-op.
        rig.manager.close_session(rig.instance_id).await.unwrap();
    }

    #[tokio::test]
    async fn operations_on_unknown_sessions_fail() {
        let bus = EventBus::new();
        let broker = PermissionBroker::new(bus.clone(), None, true);
        let manager = SessionManager::new(bus, broker);

        let unknown = Uuid::new_v4();
        assert!(manager.initialize(unknown).await.is_err());
        assert!(manager.prompt(unknown, vec![]).await.is_err());
        assert!(manager.cancel(unknown, "x").await.is_err());
    }
}
