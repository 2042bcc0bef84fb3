//! Protocol adapters: one module per agent dialect, all exposing the same
//! session API and emitting the same normalised update vocabulary.
//!
//! ```text
//! AdapterKind --create_adapter--> Arc<dyn ProtocolAdapter>
//!      |                                |
//!      |   initialize / new_session / load_session
//!      |   prompt / cancel / close
//!      |                                |
//!      |        SessionUpdate channel --+--> SessionManager --> EventBus
//!      |        server-initiated requests --> PermissionRequestHandler
//! ```

pub mod acp;
pub mod app_server;
pub mod copilot;
pub mod framing;
pub mod jsonrpc;
pub mod opencode;
pub mod stream_json;
pub mod workspace_fs;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use uuid::Uuid;

/// The agent's side of a stdio (or attached) transport.
pub struct AgentIo {
    pub stdin: Box<dyn AsyncWrite + Send + Sync + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Sync + Unpin>,
}

/// Which protocol dialect an agent speaks.
///
/// Each variant is a compile-time module; `auggie`, `gemini` and
/// `opencode_acp` are ACP flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Acp,
    StreamJson,
    AppServer,
    Copilot,
    Opencode,
    OpencodeAcp,
    Auggie,
    Gemini,
}

impl AdapterKind {
    /// The ACP flavour behind this kind, when it is one.
    pub fn acp_flavor(&self) -> Option<acp::AcpFlavor> {
        match self {
            Self::Acp => Some(acp::AcpFlavor::Standard),
            Self::Auggie => Some(acp::AcpFlavor::Auggie),
            Self::Gemini => Some(acp::AcpFlavor::Gemini),
            Self::OpencodeAcp => Some(acp::AcpFlavor::Opencode),
            _ => None,
        }
    }
}

/// Session phase state machine.
///
/// `fresh -> initializing -> ready -> prompting -> ready | complete |
/// error`; `error` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Fresh,
    Initializing,
    Ready,
    Prompting,
    Complete,
    Error,
}

/// Capabilities advertised by the agent on `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapabilities {
    #[serde(default)]
    pub protocol_version: i64,
    #[serde(default)]
    pub load_session: bool,
    /// The raw capabilities object, preserved for collaborators.
    #[serde(default)]
    pub raw: Value,
}

/// MCP server configuration forwarded on `session/new`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Prompt content blocks. Only text today; the enum leaves room for the
/// rest of the ACP block vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Result of a prompt turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptOutcome {
    pub stop_reason: String,
    pub is_error: bool,
}

/// One entry of an agent-published plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

/// Normalised update emitted by every adapter, whatever the native shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    MessageChunk {
        text: String,
    },
    Reasoning {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        title: String,
        status: String,
        args: Value,
    },
    ToolCallUpdate {
        tool_call_id: String,
        status: String,
        result: Option<Value>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    Complete {
        stop_reason: String,
        is_error: bool,
    },
    Error {
        kind: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// Permissions
// ---------------------------------------------------------------------------

/// Kind of a permission option, as presented by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionOptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
    RejectAlways,
}

impl PermissionOptionKind {
    pub fn is_allow(&self) -> bool {
        matches!(self, Self::AllowOnce | Self::AllowAlways)
    }
}

/// One selectable option of a permission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionOption {
    #[serde(alias = "optionId")]
    pub option_id: String,
    pub name: String,
    pub kind: PermissionOptionKind,
}

/// A server-initiated permission request, decoupled from its transport.
///
/// The rpc id stays with the adapter that received the request; it is kept
/// here opaquely for diagnostics only.
#[derive(Debug, Clone)]
pub struct PermissionRequest {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub session_id: String,
    pub tool_call_id: Option<String>,
    pub title: String,
    pub options: Vec<PermissionOption>,
    pub rpc_id: Value,
}

/// Terminal outcome of a permission request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionOutcome {
    Selected { option_id: String },
    Cancelled,
}

impl PermissionOutcome {
    /// Wire shape: `{"outcome": {"outcome": "selected", "optionId": ...}}`
    /// or `{"outcome": {"outcome": "cancelled"}}`.
    pub fn to_result_value(&self) -> Value {
        match self {
            Self::Selected { option_id } => serde_json::json!({
                "outcome": {"outcome": "selected", "optionId": option_id}
            }),
            Self::Cancelled => serde_json::json!({
                "outcome": {"outcome": "cancelled"}
            }),
        }
    }
}

/// The engine-side handler adapters forward permission requests to.
///
/// Implemented by the session manager's broker. The call may take up to
/// the configured timeout; adapters therefore invoke it from a spawned
/// task, never from the read loop.
#[async_trait]
pub trait PermissionRequestHandler: Send + Sync {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome;
}

// ---------------------------------------------------------------------------
// The adapter trait
// ---------------------------------------------------------------------------

/// Context every adapter is constructed with.
pub struct AdapterContext {
    pub instance_id: Uuid,
    pub task_id: Uuid,
    /// Root the agent's fs requests are confined to.
    pub workspace_root: PathBuf,
    pub updates: mpsc::UnboundedSender<SessionUpdate>,
    pub permissions: Arc<dyn PermissionRequestHandler>,
}

/// Uniform session API over an agent's native protocol.
///
/// Object-safe so executions can hold `Arc<dyn ProtocolAdapter>` whatever
/// the dialect.
#[async_trait]
pub trait ProtocolAdapter: Send + Sync {
    fn kind(&self) -> AdapterKind;

    /// Exchange capabilities. Idempotent: repeated calls return the cached
    /// capabilities.
    async fn initialize(&self) -> Result<AgentCapabilities>;

    /// Create a session; returns the agent-assigned session id. Fails if
    /// the adapter is not initialised. The id is set exactly once.
    async fn new_session(
        &self,
        cwd: &Path,
        mcp_servers: &[McpServerConfig],
    ) -> Result<String>;

    /// Resume a previously created session.
    async fn load_session(&self, session_id: &str) -> Result<()>;

    /// Send a prompt turn. Updates stream out through the update channel
    /// while this call is in flight; on return the session is `ready`
    /// again.
    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome>;

    /// Fire-and-forget cancellation notification. Never blocks on the
    /// agent; callers await a `complete` update or read-loop exit.
    async fn cancel(&self, reason: &str) -> Result<()>;

    /// Terminate the read loop and close the agent's stdin.
    async fn close(&self) -> Result<()>;

    /// The assigned session id, if any.
    fn session_id(&self) -> Option<String>;

    /// Current phase of the session state machine.
    fn phase(&self) -> SessionPhase;
}

/// Construct the adapter for a protocol kind over the given transport.
pub async fn create_adapter(
    kind: AdapterKind,
    io: AgentIo,
    ctx: AdapterContext,
) -> Result<Arc<dyn ProtocolAdapter>> {
    if let Some(flavor) = kind.acp_flavor() {
        return Ok(acp::AcpAdapter::spawn(io, ctx, flavor));
    }
    match kind {
        AdapterKind::StreamJson => Ok(stream_json::StreamJsonAdapter::spawn(io, ctx)),
        AdapterKind::AppServer => Ok(app_server::AppServerAdapter::spawn(io, ctx)),
        AdapterKind::Copilot => copilot::CopilotAdapter::connect(io, ctx).await,
        AdapterKind::Opencode => opencode::OpenCodeAdapter::connect(io, ctx).await,
        // Covered by acp_flavor above.
        AdapterKind::Acp
        | AdapterKind::Auggie
        | AdapterKind::Gemini
        | AdapterKind::OpencodeAcp => unreachable!("acp flavours handled above"),
    }
}
