//! Codex-style app-server: JSON-RPC with 4-byte big-endian length
//! prefixes instead of newline delimiters.
//!
//! The conversation surface differs from ACP: sessions are
//! "conversations", updates arrive as `codex/event` notifications, and
//! approvals come in as dedicated server requests
//! (`execCommandApproval`, `applyPatchApproval`) rather than a generic
//! permission method.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::framing::{FrameReader, FrameWriter};
use super::jsonrpc::{JsonRpcClient, RpcErrorObject, ServerRequestHandler};
use super::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PermissionOption, PermissionOptionKind, PermissionOutcome, PermissionRequest,
    PermissionRequestHandler, PromptOutcome, ProtocolAdapter, SessionPhase, SessionUpdate,
};

struct AppServerState {
    phase: SessionPhase,
    conversation_id: Option<String>,
    capabilities: Option<AgentCapabilities>,
}

struct AppServerShared {
    instance_id: Uuid,
    task_id: Uuid,
    updates: mpsc::UnboundedSender<SessionUpdate>,
    permissions: Arc<dyn PermissionRequestHandler>,
    state: Mutex<AppServerState>,
}

impl AppServerShared {
    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn conversation_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("app-server state poisoned")
            .conversation_id
            .clone()
    }
}

/// Map one `codex/event` notification payload into the vocabulary.
fn parse_event(params: &Value) -> Option<SessionUpdate> {
    let msg = params.get("msg")?;
    let event_type = msg.get("type").and_then(|t| t.as_str())?;

    match event_type {
        "agent_message_delta" => Some(SessionUpdate::MessageChunk {
            text: msg.get("delta").and_then(|d| d.as_str())?.to_string(),
        }),
        "agent_message" => Some(SessionUpdate::MessageChunk {
            text: msg.get("message").and_then(|m| m.as_str())?.to_string(),
        }),
        "agent_reasoning_delta" => Some(SessionUpdate::Reasoning {
            text: msg.get("delta").and_then(|d| d.as_str())?.to_string(),
        }),
        "exec_command_begin" => Some(SessionUpdate::ToolCall {
            tool_call_id: msg
                .get("call_id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            title: msg
                .get("command")
                .map(|c| match c {
                    Value::Array(parts) => parts
                        .iter()
                        .filter_map(|p| p.as_str())
                        .collect::<Vec<_>>()
                        .join(" "),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "command".to_string()),
            status: "running".to_string(),
            args: msg.clone(),
        }),
        "exec_command_end" => Some(SessionUpdate::ToolCallUpdate {
            tool_call_id: msg
                .get("call_id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string(),
            status: if msg.get("exit_code").and_then(|c| c.as_i64()) == Some(0) {
                "completed".to_string()
            } else {
                "failed".to_string()
            },
            result: msg.get("stdout").cloned(),
        }),
        "task_complete" => Some(SessionUpdate::Complete {
            stop_reason: "end_turn".to_string(),
            is_error: false,
        }),
        "error" => Some(SessionUpdate::Error {
            kind: "remote".to_string(),
            message: msg
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("agent error")
                .to_string(),
        }),
        other => {
            debug!(event_type = other, "ignoring unrecognised app-server event");
            None
        }
    }
}

struct AppServerHandler {
    shared: Arc<AppServerShared>,
}

impl AppServerHandler {
    /// Approval requests carry no option list; synthesize the standard
    /// allow/reject pair so the broker sees a uniform shape.
    fn approval_request(&self, title: String, call_id: Option<String>) -> PermissionRequest {
        PermissionRequest {
            instance_id: self.shared.instance_id,
            task_id: self.shared.task_id,
            session_id: self.shared.conversation_id().unwrap_or_default(),
            tool_call_id: call_id,
            title,
            options: vec![
                PermissionOption {
                    option_id: "approved".to_string(),
                    name: "Approve".to_string(),
                    kind: PermissionOptionKind::AllowOnce,
                },
                PermissionOption {
                    option_id: "denied".to_string(),
                    name: "Deny".to_string(),
                    kind: PermissionOptionKind::RejectOnce,
                },
            ],
            rpc_id: Value::Null,
        }
    }
}

#[async_trait]
impl ServerRequestHandler for AppServerHandler {
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject> {
        match method {
            "execCommandApproval" | "applyPatchApproval" => {
                let title = params
                    .get("command")
                    .map(|c| format!("Run {c}"))
                    .unwrap_or_else(|| "Apply changes".to_string());
                let call_id = params
                    .get("call_id")
                    .and_then(|i| i.as_str())
                    .map(str::to_owned);
                let request = self.approval_request(title, call_id);
                let outcome = self.shared.permissions.request_permission(request).await;
                let decision = match outcome {
                    PermissionOutcome::Selected { option_id } => option_id,
                    PermissionOutcome::Cancelled => "denied".to_string(),
                };
                Ok(json!({"decision": decision}))
            }
            other => Err(RpcErrorObject::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Value) {
        match method {
            "codex/event" => {
                if let Some(update) = parse_event(&params) {
                    if matches!(update, SessionUpdate::Complete { .. }) {
                        let mut state =
                            self.shared.state.lock().expect("app-server state poisoned");
                        if state.phase == SessionPhase::Prompting {
                            state.phase = SessionPhase::Ready;
                        }
                    }
                    self.shared.emit(update);
                }
            }
            other => {
                debug!(method = other, "ignoring unrecognised app-server notification");
            }
        }
    }
}

/// Adapter for app-server agents.
pub struct AppServerAdapter {
    client: Arc<JsonRpcClient>,
    shared: Arc<AppServerShared>,
}

impl AppServerAdapter {
    pub fn spawn(io: AgentIo, ctx: AdapterContext) -> Arc<dyn ProtocolAdapter> {
        let shared = Arc::new(AppServerShared {
            instance_id: ctx.instance_id,
            task_id: ctx.task_id,
            updates: ctx.updates,
            permissions: ctx.permissions,
            state: Mutex::new(AppServerState {
                phase: SessionPhase::Fresh,
                conversation_id: None,
                capabilities: None,
            }),
        });

        let handler = Arc::new(AppServerHandler {
            shared: Arc::clone(&shared),
        });

        let client = JsonRpcClient::spawn(
            FrameReader::length_prefixed(io.stdout),
            FrameWriter::length_prefixed(io.stdin),
            handler,
        );

        {
            let shared = Arc::clone(&shared);
            let mut closed = client.closed();
            tokio::spawn(async move {
                if !*closed.borrow() && closed.changed().await.is_err() {
                    return;
                }
                let mut state = shared.state.lock().expect("app-server state poisoned");
                if !matches!(state.phase, SessionPhase::Complete | SessionPhase::Error) {
                    state.phase = SessionPhase::Error;
                    drop(state);
                    shared.emit(SessionUpdate::Error {
                        kind: "transport".to_string(),
                        message: "transport_closed".to_string(),
                    });
                }
            });
        }

        Arc::new(Self { client, shared })
    }
}

#[async_trait]
impl ProtocolAdapter for AppServerAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::AppServer
    }

    async fn initialize(&self) -> Result<AgentCapabilities> {
        {
            let state = self.shared.state.lock().expect("app-server state poisoned");
            if let Some(caps) = &state.capabilities {
                return Ok(caps.clone());
            }
        }
        {
            let mut state = self.shared.state.lock().expect("app-server state poisoned");
            state.phase = SessionPhase::Initializing;
        }

        let result = self
            .client
            .call(
                "initialize",
                json!({
                    "clientInfo": {
                        "name": "agentctl",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await
            .context("initialize failed")?;

        let capabilities = AgentCapabilities {
            protocol_version: 1,
            load_session: true,
            raw: result,
        };

        let mut state = self.shared.state.lock().expect("app-server state poisoned");
        state.capabilities = Some(capabilities.clone());
        state.phase = SessionPhase::Ready;
        Ok(capabilities)
    }

    async fn new_session(&self, cwd: &Path, _mcp_servers: &[McpServerConfig]) -> Result<String> {
        {
            let state = self.shared.state.lock().expect("app-server state poisoned");
            if state.capabilities.is_none() {
                bail!("new_session before initialize");
            }
            if state.conversation_id.is_some() {
                bail!("session id is already assigned");
            }
        }

        let result = self
            .client
            .call(
                "newConversation",
                json!({"cwd": cwd.to_string_lossy()}),
            )
            .await
            .context("newConversation failed")?;

        let conversation_id = result
            .get("conversationId")
            .and_then(|s| s.as_str())
            .context("newConversation response is missing conversationId")?
            .to_string();

        let mut state = self.shared.state.lock().expect("app-server state poisoned");
        state.conversation_id = Some(conversation_id.clone());
        Ok(conversation_id)
    }

    async fn load_session(&self, session_id: &str) -> Result<()> {
        {
            let state = self.shared.state.lock().expect("app-server state poisoned");
            if state.capabilities.is_none() {
                bail!("load_session before initialize");
            }
        }

        self.client
            .call(
                "resumeConversation",
                json!({"conversationId": session_id}),
            )
            .await
            .with_context(|| format!("resumeConversation failed for {session_id}"))?;

        let mut state = self.shared.state.lock().expect("app-server state poisoned");
        state.conversation_id = Some(session_id.to_string());
        state.phase = SessionPhase::Ready;
        Ok(())
    }

    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome> {
        let conversation_id = {
            let mut state = self.shared.state.lock().expect("app-server state poisoned");
            if state.phase != SessionPhase::Ready {
                bail!("prompt in phase {:?}, expected ready", state.phase);
            }
            let id = state
                .conversation_id
                .clone()
                .context("prompt before a conversation was created")?;
            state.phase = SessionPhase::Prompting;
            id
        };

        let items: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            })
            .collect();

        let result = self
            .client
            .call(
                "sendUserTurn",
                json!({"conversationId": conversation_id, "items": items}),
            )
            .await;

        match result {
            Ok(_) => {
                let mut state = self.shared.state.lock().expect("app-server state poisoned");
                if state.phase == SessionPhase::Prompting {
                    state.phase = SessionPhase::Ready;
                }
                drop(state);
                Ok(PromptOutcome {
                    stop_reason: "end_turn".to_string(),
                    is_error: false,
                })
            }
            Err(err) => {
                let mut state = self.shared.state.lock().expect("app-server state poisoned");
                state.phase = SessionPhase::Error;
                drop(state);
                self.shared.emit(SessionUpdate::Error {
                    kind: "remote".to_string(),
                    message: err.to_string(),
                });
                Err(anyhow::Error::new(err)).context("sendUserTurn failed")
            }
        }
    }

    async fn cancel(&self, _reason: &str) -> Result<()> {
        let conversation_id = self.shared.conversation_id().unwrap_or_default();
        self.client
            .notify(
                "interruptConversation",
                json!({"conversationId": conversation_id}),
            )
            .await
            .context("interruptConversation failed")?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("app-server state poisoned");
            if state.phase != SessionPhase::Error {
                state.phase = SessionPhase::Complete;
            }
        }
        self.client.close().await;
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.shared.conversation_id()
    }

    fn phase(&self) -> SessionPhase {
        self.shared.state.lock().expect("app-server state poisoned").phase
    }
}
