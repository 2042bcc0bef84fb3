//! ACP: JSON-RPC 2.0 over newline-delimited stdio.
//!
//! Methods `initialize`, `session/new`, `session/load`, `session/prompt`;
//! notification `session/update`; server-initiated requests
//! `session/request_permission`, `fs/read_text_file`, `fs/write_text_file`
//! and `terminal/*`; client notification `session/cancel`.
//!
//! Several CLIs speak dialects of the same protocol; [`AcpFlavor`]
//! captures the per-agent differences in the handshake.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::jsonrpc::{JsonRpcClient, RpcErrorObject, ServerRequestHandler};
use super::framing::{FrameReader, FrameWriter};
use super::workspace_fs;
use super::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PermissionOption, PermissionRequest, PermissionRequestHandler, PlanEntry, PromptOutcome,
    ProtocolAdapter, SessionPhase, SessionUpdate,
};

/// Dialect variations of the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcpFlavor {
    Standard,
    Auggie,
    Gemini,
    Opencode,
}

impl AcpFlavor {
    fn adapter_kind(&self) -> AdapterKind {
        match self {
            Self::Standard => AdapterKind::Acp,
            Self::Auggie => AdapterKind::Auggie,
            Self::Gemini => AdapterKind::Gemini,
            Self::Opencode => AdapterKind::OpencodeAcp,
        }
    }

    fn initialize_params(&self) -> Value {
        let mut params = json!({
            "protocolVersion": 1,
            "clientCapabilities": {
                "fs": {"readTextFile": true, "writeTextFile": true},
            },
        });
        match self {
            Self::Gemini | Self::Auggie => {
                params["clientInfo"] = json!({
                    "name": "agentctl",
                    "version": env!("CARGO_PKG_VERSION"),
                });
            }
            Self::Opencode => {
                params["clientCapabilities"]["terminal"] = json!(false);
            }
            Self::Standard => {}
        }
        params
    }
}

struct AcpState {
    phase: SessionPhase,
    session_id: Option<String>,
    capabilities: Option<AgentCapabilities>,
}

/// Shared between the adapter facade and the server-request handler.
struct AcpShared {
    instance_id: Uuid,
    task_id: Uuid,
    workspace_root: std::path::PathBuf,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    permissions: Arc<dyn PermissionRequestHandler>,
    state: Mutex<AcpState>,
}

impl AcpShared {
    fn phase(&self) -> SessionPhase {
        self.state.lock().expect("acp state poisoned").phase
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state.lock().expect("acp state poisoned").phase = phase;
    }

    fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("acp state poisoned")
            .session_id
            .clone()
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Normalise one `session/update` notification payload.
///
/// Returns `None` for update kinds we do not carry.
fn parse_session_update(params: &Value) -> Option<SessionUpdate> {
    let update = params.get("update")?;
    let kind = update.get("sessionUpdate").and_then(|k| k.as_str())?;

    match kind {
        "agent_message_chunk" => {
            let text = update
                .get("content")
                .and_then(|c| c.get("text"))
                .and_then(|t| t.as_str())?
                .to_string();
            Some(SessionUpdate::MessageChunk { text })
        }
        "agent_thought_chunk" => {
            let text = update
                .get("content")
                .and_then(|c| c.get("text"))
                .and_then(|t| t.as_str())?
                .to_string();
            Some(SessionUpdate::Reasoning { text })
        }
        "tool_call" => Some(SessionUpdate::ToolCall {
            tool_call_id: update
                .get("toolCallId")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            title: update
                .get("title")
                .and_then(|t| t.as_str())
                .unwrap_or("tool call")
                .to_string(),
            status: update
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("running")
                .to_string(),
            args: update.get("rawInput").cloned().unwrap_or(Value::Null),
        }),
        "tool_call_update" => Some(SessionUpdate::ToolCallUpdate {
            tool_call_id: update
                .get("toolCallId")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            status: update
                .get("status")
                .and_then(|s| s.as_str())
                .unwrap_or("completed")
                .to_string(),
            result: update.get("rawOutput").cloned(),
        }),
        "plan" => {
            let entries = update
                .get("entries")
                .and_then(|e| serde_json::from_value::<Vec<PlanEntry>>(e.clone()).ok())
                .unwrap_or_default();
            Some(SessionUpdate::Plan { entries })
        }
        "complete" => Some(SessionUpdate::Complete {
            stop_reason: update
                .get("stopReason")
                .and_then(|s| s.as_str())
                .unwrap_or("end_turn")
                .to_string(),
            is_error: update
                .get("isError")
                .and_then(|e| e.as_bool())
                .unwrap_or(false),
        }),
        "error" => Some(SessionUpdate::Error {
            kind: "remote".to_string(),
            message: update
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("agent error")
                .to_string(),
        }),
        other => {
            debug!(kind = other, "ignoring unrecognised session update kind");
            None
        }
    }
}

/// Parse a `session/request_permission` params payload.
fn parse_permission_request(
    shared: &AcpShared,
    params: &Value,
) -> Result<PermissionRequest, RpcErrorObject> {
    let options: Vec<PermissionOption> = params
        .get("options")
        .map(|o| serde_json::from_value(o.clone()))
        .transpose()
        .map_err(|e| RpcErrorObject::invalid_params(format!("bad options: {e}")))?
        .unwrap_or_default();

    let tool_call = params.get("toolCall");
    Ok(PermissionRequest {
        instance_id: shared.instance_id,
        task_id: shared.task_id,
        session_id: params
            .get("sessionId")
            .and_then(|s| s.as_str())
            .map(str::to_owned)
            .or_else(|| shared.session_id())
            .unwrap_or_default(),
        tool_call_id: tool_call
            .and_then(|t| t.get("toolCallId"))
            .and_then(|i| i.as_str())
            .map(str::to_owned),
        title: tool_call
            .and_then(|t| t.get("title"))
            .and_then(|t| t.as_str())
            .unwrap_or("permission request")
            .to_string(),
        options,
        rpc_id: Value::Null,
    })
}

struct AcpHandler {
    shared: Arc<AcpShared>,
}

#[async_trait]
impl ServerRequestHandler for AcpHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match method {
            "session/request_permission" => {
                let request = parse_permission_request(&self.shared, &params)?;
                let outcome = self.shared.permissions.request_permission(request).await;
                Ok(outcome.to_result_value())
            }
            "fs/read_text_file" => {
                workspace_fs::read_text_file(&self.shared.workspace_root, &params)
            }
            "fs/write_text_file" => {
                workspace_fs::write_text_file(&self.shared.workspace_root, &params)
            }
            // Minimal compliant stubs; no terminal backend is wired.
            "terminal/create" => Ok(json!({"terminalId": format!("term-{}", Uuid::new_v4())})),
            "terminal/output" => Ok(json!({"output": "", "truncated": false})),
            "terminal/wait_for_exit" => Ok(json!({"exitCode": 0})),
            "terminal/kill" | "terminal/release" => Ok(Value::Null),
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "session/update" => {
                if let Some(update) = parse_session_update(&params) {
                    if let SessionUpdate::Complete { .. } = update {
                        // Some dialects announce turn end as an update
                        // before the prompt response lands.
                        self.shared.set_phase(SessionPhase::Ready);
                    }
                    self.shared.emit(update);
                }
            }
            other => {
                debug!(method = other, "ignoring unrecognised notification");
            }
        }
    }
}

/// The ACP adapter: JSON-RPC client plus the session state machine.
pub struct AcpAdapter {
    client: Arc<JsonRpcClient>,
    shared: Arc<AcpShared>,
    flavor: AcpFlavor,
}

impl AcpAdapter {
    /// Bind the adapter to an agent's stdio and start its read loop.
    pub fn spawn(io: AgentIo, ctx: AdapterContext, flavor: AcpFlavor) -> Arc<dyn ProtocolAdapter> {
        let shared = Arc::new(AcpShared {
            instance_id: ctx.instance_id,
            task_id: ctx.task_id,
            workspace_root: ctx.workspace_root,
            updates: ctx.updates,
            permissions: ctx.permissions,
            state: Mutex::new(AcpState {
                phase: SessionPhase::Fresh,
                session_id: None,
                capabilities: None,
            }),
        });

        let handler = Arc::new(AcpHandler {
            shared: Arc::clone(&shared),
        });

        let client = JsonRpcClient::spawn(
            FrameReader::newline(io.stdout),
            FrameWriter::newline(io.stdin),
            handler,
        );

        // Watch for transport closure: anything but a deliberate close
        // degrades the session to `error`.
        {
            let shared = Arc::clone(&shared);
            let mut closed = client.closed();
            tokio::spawn(async move {
                if !*closed.borrow() && closed.changed().await.is_err() {
                    return;
                }
                let phase = shared.phase();
                if !matches!(phase, SessionPhase::Complete | SessionPhase::Error) {
                    shared.set_phase(SessionPhase::Error);
                    shared.emit(SessionUpdate::Error {
                        kind: "transport".to_string(),
                        message: "transport_closed".to_string(),
                    });
                }
            });
        }

        Arc::new(Self {
            client,
            shared,
            flavor,
        })
    }
}

#[async_trait]
impl ProtocolAdapter for AcpAdapter {
    fn kind(&self) -> AdapterKind {
        self.flavor.adapter_kind()
    }

    async fn initialize(&self) -> Result<AgentCapabilities> {
        {
            let state = self.shared.state.lock().expect("acp state poisoned");
            if let Some(caps) = &state.capabilities {
                return Ok(caps.clone());
            }
            if state.phase == SessionPhase::Error {
                bail!("session is in error state");
            }
        }
        self.shared.set_phase(SessionPhase::Initializing);

        let result = self
            .client
            .call("initialize", self.flavor.initialize_params())
            .await
            .context("initialize failed")
            .inspect_err(|_| self.shared.set_phase(SessionPhase::Error))?;

        let capabilities = AgentCapabilities {
            protocol_version: result
                .get("protocolVersion")
                .and_then(|v| v.as_i64())
                .unwrap_or(1),
            load_session: result
                .get("agentCapabilities")
                .and_then(|c| c.get("loadSession"))
                .and_then(|l| l.as_bool())
                .unwrap_or(false),
            raw: result,
        };

        let mut state = self.shared.state.lock().expect("acp state poisoned");
        state.capabilities = Some(capabilities.clone());
        state.phase = SessionPhase::Ready;
        Ok(capabilities)
    }

    async fn new_session(&self, cwd: &Path, mcp_servers: &[McpServerConfig]) -> Result<String> {
        {
            let state = self.shared.state.lock().expect("acp state poisoned");
            if state.capabilities.is_none() {
                bail!("new_session before initialize");
            }
            if state.session_id.is_some() {
                bail!("session id is already assigned");
            }
        }

        let result = self
            .client
            .call(
                "session/new",
                json!({
                    "cwd": cwd.to_string_lossy(),
                    "mcpServers": mcp_servers,
                }),
            )
            .await
            .context("session/new failed")?;

        let session_id = result
            .get("sessionId")
            .and_then(|s| s.as_str())
            .context("session/new response is missing sessionId")?
            .to_string();

        let mut state = self.shared.state.lock().expect("acp state poisoned");
        // The id is set exactly once, here, and never changes.
        state.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    async fn load_session(&self, session_id: &str) -> Result<()> {
        {
            let state = self.shared.state.lock().expect("acp state poisoned");
            if state.capabilities.is_none() {
                bail!("load_session before initialize");
            }
            if let Some(existing) = &state.session_id {
                if existing != session_id {
                    bail!("session id is already assigned");
                }
            }
        }

        self.client
            .call("session/load", json!({"sessionId": session_id}))
            .await
            .with_context(|| format!("session/load failed for {session_id}"))?;

        let mut state = self.shared.state.lock().expect("acp state poisoned");
        state.session_id = Some(session_id.to_string());
        state.phase = SessionPhase::Ready;
        Ok(())
    }

    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome> {
        let session_id = {
            let state = self.shared.state.lock().expect("acp state poisoned");
            if state.phase != SessionPhase::Ready {
                bail!("prompt in phase {:?}, expected ready", state.phase);
            }
            state
                .session_id
                .clone()
                .context("prompt before a session was created")?
        };
        self.shared.set_phase(SessionPhase::Prompting);

        let result = self
            .client
            .call(
                "session/prompt",
                json!({"sessionId": session_id, "prompt": blocks}),
            )
            .await;

        match result {
            Ok(value) => {
                let stop_reason = value
                    .get("stopReason")
                    .and_then(|s| s.as_str())
                    .unwrap_or("end_turn")
                    .to_string();
                // The response is observed strictly after every update
                // notification of this turn (same stream, FIFO).
                if self.shared.phase() == SessionPhase::Prompting {
                    self.shared.set_phase(SessionPhase::Ready);
                }
                let outcome = PromptOutcome {
                    stop_reason: stop_reason.clone(),
                    is_error: false,
                };
                self.shared.emit(SessionUpdate::Complete {
                    stop_reason,
                    is_error: false,
                });
                Ok(outcome)
            }
            Err(err) => {
                self.shared.set_phase(SessionPhase::Error);
                self.shared.emit(SessionUpdate::Error {
                    kind: "remote".to_string(),
                    message: err.to_string(),
                });
                Err(anyhow::Error::new(err)).context("session/prompt failed")
            }
        }
    }

    async fn cancel(&self, reason: &str) -> Result<()> {
        let session_id = self.shared.session_id().unwrap_or_default();
        self.client
            .notify(
                "session/cancel",
                json!({"sessionId": session_id, "reason": reason}),
            )
            .await
            .context("session/cancel failed")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let phase = self.shared.phase();
        if phase != SessionPhase::Error {
            self.shared.set_phase(SessionPhase::Complete);
        }
        self.client.close().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    fn phase(&self) -> SessionPhase {
        self.shared.phase()
    }
}
