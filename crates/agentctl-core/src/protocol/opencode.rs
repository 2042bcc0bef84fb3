//! OpenCode: HTTP against a local listener the agent binds on startup
//! (bind-to-0, the chosen port announced on stdout), with updates
//! streamed over SSE from `/event`.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PromptOutcome, ProtocolAdapter, SessionPhase, SessionUpdate,
};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Extract the server's base URL from one stdout line.
fn parse_base_url(line: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(line) {
        if let Some(port) = value.get("port").and_then(|p| p.as_u64()) {
            return Some(format!("http://127.0.0.1:{port}"));
        }
        if let Some(url) = value.get("url").and_then(|u| u.as_str()) {
            return Some(url.trim_end_matches('/').to_string());
        }
    }
    if let Some(idx) = line.find("http://") {
        let url = line[idx..].split_whitespace().next()?;
        return Some(url.trim_end_matches('/').to_string());
    }
    None
}

// ---------------------------------------------------------------------------
// SSE
// ---------------------------------------------------------------------------

/// One server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

/// Incremental SSE frame parser. Frames are separated by blank lines;
/// `data:` lines within a frame are joined with newlines.
#[derive(Default)]
pub(crate) struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn push(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(boundary) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..boundary + 2).collect();
            let mut event_name = None;
            let mut data_lines = Vec::new();
            for line in frame.lines() {
                if let Some(rest) = line.strip_prefix("event:") {
                    event_name = Some(rest.trim().to_string());
                } else if let Some(rest) = line.strip_prefix("data:") {
                    data_lines.push(rest.trim_start().to_string());
                }
            }
            if !data_lines.is_empty() {
                events.push(SseEvent {
                    event: event_name,
                    data: data_lines.join("\n"),
                });
            }
        }
        events
    }
}

/// Map one OpenCode event payload into the vocabulary.
fn parse_opencode_event(value: &Value) -> Option<SessionUpdate> {
    let event_type = value.get("type").and_then(|t| t.as_str())?;

    match event_type {
        "message.part.updated" => {
            let part = value.get("properties").and_then(|p| p.get("part"))?;
            let part_type = part.get("type").and_then(|t| t.as_str())?;
            match part_type {
                "text" => Some(SessionUpdate::MessageChunk {
                    text: part.get("text").and_then(|t| t.as_str())?.to_string(),
                }),
                "reasoning" => Some(SessionUpdate::Reasoning {
                    text: part.get("text").and_then(|t| t.as_str())?.to_string(),
                }),
                "tool" => {
                    let status = part
                        .get("state")
                        .and_then(|s| s.get("status"))
                        .and_then(|s| s.as_str())
                        .unwrap_or("running");
                    let tool_call_id = part
                        .get("callID")
                        .or_else(|| part.get("id"))
                        .and_then(|i| i.as_str())
                        .unwrap_or_default()
                        .to_string();
                    match status {
                        "pending" | "running" => Some(SessionUpdate::ToolCall {
                            tool_call_id,
                            title: part
                                .get("tool")
                                .and_then(|t| t.as_str())
                                .unwrap_or("tool")
                                .to_string(),
                            status: "running".to_string(),
                            args: part
                                .get("state")
                                .and_then(|s| s.get("input"))
                                .cloned()
                                .unwrap_or(Value::Null),
                        }),
                        done => Some(SessionUpdate::ToolCallUpdate {
                            tool_call_id,
                            status: if done == "error" {
                                "failed".to_string()
                            } else {
                                "completed".to_string()
                            },
                            result: part.get("state").and_then(|s| s.get("output")).cloned(),
                        }),
                    }
                }
                _ => None,
            }
        }
        "session.idle" => Some(SessionUpdate::Complete {
            stop_reason: "end_turn".to_string(),
            is_error: false,
        }),
        "session.error" => Some(SessionUpdate::Error {
            kind: "remote".to_string(),
            message: value
                .get("properties")
                .and_then(|p| p.get("error"))
                .map(|e| e.to_string())
                .unwrap_or_else(|| "agent error".to_string()),
        }),
        other => {
            debug!(event_type = other, "ignoring unrecognised opencode event");
            None
        }
    }
}

struct OpenCodeState {
    phase: SessionPhase,
    session_id: Option<String>,
    capabilities: Option<AgentCapabilities>,
}

/// State the `/event` pump shares with the adapter facade.
struct OpenCodeShared {
    state: Mutex<OpenCodeState>,
    updates: mpsc::UnboundedSender<SessionUpdate>,
}

impl OpenCodeShared {
    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }
}

/// Adapter for OpenCode servers.
pub struct OpenCodeAdapter {
    http: reqwest::Client,
    base_url: String,
    shared: Arc<OpenCodeShared>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl OpenCodeAdapter {
    pub async fn connect(io: AgentIo, ctx: AdapterContext) -> Result<Arc<dyn ProtocolAdapter>> {
        Self::connect_with_timeout(io, ctx, DISCOVERY_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        io: AgentIo,
        ctx: AdapterContext,
        timeout: Duration,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        let mut stdout = BufReader::new(io.stdout);

        let base_url = tokio::time::timeout(timeout, async {
            let mut line = String::new();
            loop {
                line.clear();
                let n = stdout.read_line(&mut line).await?;
                if n == 0 {
                    return Ok::<Option<String>, std::io::Error>(None);
                }
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if let Some(url) = parse_base_url(trimmed) {
                    return Ok(Some(url));
                }
                debug!(line = trimmed, "opencode stdout banner");
            }
        })
        .await
        .context("timed out waiting for the opencode server url")?
        .context("error reading opencode stdout")?
        .context("opencode process closed stdout before announcing its url")?;

        info!(base_url = %base_url, "connected to opencode server");

        // Keep draining stdout as log lines.
        tokio::spawn(async move {
            let mut lines = stdout.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(line = %line, "opencode stdout");
            }
        });

        let adapter = Arc::new(Self {
            http: reqwest::Client::new(),
            base_url,
            shared: Arc::new(OpenCodeShared {
                state: Mutex::new(OpenCodeState {
                    phase: SessionPhase::Fresh,
                    session_id: None,
                    capabilities: None,
                }),
                updates: ctx.updates,
            }),
            event_task: Mutex::new(None),
        });

        Ok(adapter)
    }

    /// Subscribe to `/event` and pump normalised updates until the stream
    /// ends.
    fn start_event_stream(&self) {
        let shared = Arc::clone(&self.shared);
        let http = self.http.clone();
        let url = format!("{}/event", self.base_url);

        let task = tokio::spawn(async move {
            let response = match http.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(error = %e, "failed to subscribe to opencode events");
                    shared.emit(SessionUpdate::Error {
                        kind: "transport".to_string(),
                        message: e.to_string(),
                    });
                    return;
                }
            };

            let mut parser = SseParser::default();
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "opencode event stream broke");
                        shared.emit(SessionUpdate::Error {
                            kind: "transport".to_string(),
                            message: e.to_string(),
                        });
                        break;
                    }
                };
                for sse in parser.push(&String::from_utf8_lossy(&chunk)) {
                    match serde_json::from_str::<Value>(&sse.data) {
                        Ok(value) => {
                            if let Some(update) = parse_opencode_event(&value) {
                                if matches!(update, SessionUpdate::Complete { .. }) {
                                    let mut state =
                                        shared.state.lock().expect("opencode state poisoned");
                                    if state.phase == SessionPhase::Prompting {
                                        state.phase = SessionPhase::Ready;
                                    }
                                }
                                shared.emit(update);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "skipping malformed opencode event");
                        }
                    }
                }
            }
        });

        *self.event_task.lock().expect("event task poisoned") = Some(task);
    }
}

#[async_trait]
impl ProtocolAdapter for OpenCodeAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Opencode
    }

    async fn initialize(&self) -> Result<AgentCapabilities> {
        {
            let state = self.shared.state.lock().expect("opencode state poisoned");
            if let Some(caps) = &state.capabilities {
                return Ok(caps.clone());
            }
        }
        {
            let mut state = self.shared.state.lock().expect("opencode state poisoned");
            state.phase = SessionPhase::Initializing;
        }

        let app: Value = self
            .http
            .get(format!("{}/app", self.base_url))
            .send()
            .await
            .context("GET /app failed")?
            .error_for_status()
            .context("GET /app returned an error status")?
            .json()
            .await
            .context("GET /app returned invalid JSON")?;

        let capabilities = AgentCapabilities {
            protocol_version: 1,
            load_session: true,
            raw: app,
        };

        let mut state = self.shared.state.lock().expect("opencode state poisoned");
        state.capabilities = Some(capabilities.clone());
        state.phase = SessionPhase::Ready;
        Ok(capabilities)
    }

    async fn new_session(&self, _cwd: &Path, _mcp_servers: &[McpServerConfig]) -> Result<String> {
        {
            let state = self.shared.state.lock().expect("opencode state poisoned");
            if state.capabilities.is_none() {
                bail!("new_session before initialize");
            }
            if state.session_id.is_some() {
                bail!("session id is already assigned");
            }
        }

        let session: Value = self
            .http
            .post(format!("{}/session", self.base_url))
            .json(&json!({}))
            .send()
            .await
            .context("POST /session failed")?
            .error_for_status()
            .context("POST /session returned an error status")?
            .json()
            .await
            .context("POST /session returned invalid JSON")?;

        let session_id = session
            .get("id")
            .and_then(|i| i.as_str())
            .context("POST /session response is missing id")?
            .to_string();

        {
            let mut state = self.shared.state.lock().expect("opencode state poisoned");
            state.session_id = Some(session_id.clone());
        }

        // Updates for this session flow over the event stream.
        self.start_event_stream();

        Ok(session_id)
    }

    async fn load_session(&self, session_id: &str) -> Result<()> {
        {
            let state = self.shared.state.lock().expect("opencode state poisoned");
            if state.capabilities.is_none() {
                bail!("load_session before initialize");
            }
        }

        self.http
            .get(format!("{}/session/{session_id}", self.base_url))
            .send()
            .await
            .context("GET /session failed")?
            .error_for_status()
            .with_context(|| format!("unknown session {session_id}"))?;

        let mut state = self.shared.state.lock().expect("opencode state poisoned");
        state.session_id = Some(session_id.to_string());
        state.phase = SessionPhase::Ready;
        Ok(())
    }

    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome> {
        let session_id = {
            let mut state = self.shared.state.lock().expect("opencode state poisoned");
            if state.phase != SessionPhase::Ready {
                bail!("prompt in phase {:?}, expected ready", state.phase);
            }
            let id = state
                .session_id
                .clone()
                .context("prompt before a session was created")?;
            state.phase = SessionPhase::Prompting;
            id
        };

        let parts: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({"type": "text", "text": text}),
            })
            .collect();

        let result = self
            .http
            .post(format!("{}/session/{session_id}/message", self.base_url))
            .json(&json!({"parts": parts}))
            .send()
            .await
            .context("POST message failed")
            .and_then(|r| r.error_for_status().context("message returned an error status"));

        match result {
            Ok(_) => {
                let mut state = self.shared.state.lock().expect("opencode state poisoned");
                if state.phase == SessionPhase::Prompting {
                    state.phase = SessionPhase::Ready;
                }
                drop(state);
                self.shared.emit(SessionUpdate::Complete {
                    stop_reason: "end_turn".to_string(),
                    is_error: false,
                });
                Ok(PromptOutcome {
                    stop_reason: "end_turn".to_string(),
                    is_error: false,
                })
            }
            Err(err) => {
                let mut state = self.shared.state.lock().expect("opencode state poisoned");
                state.phase = SessionPhase::Error;
                drop(state);
                self.shared.emit(SessionUpdate::Error {
                    kind: "remote".to_string(),
                    message: err.to_string(),
                });
                Err(err)
            }
        }
    }

    async fn cancel(&self, _reason: &str) -> Result<()> {
        let session_id = {
            let state = self.shared.state.lock().expect("opencode state poisoned");
            state.session_id.clone().unwrap_or_default()
        };
        // Fire and forget; a failed abort only means the turn ends on its
        // own.
        let _ = self
            .http
            .post(format!("{}/session/{session_id}/abort", self.base_url))
            .send()
            .await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.shared.state.lock().expect("opencode state poisoned");
            if state.phase != SessionPhase::Error {
                state.phase = SessionPhase::Complete;
            }
        }
        let task = self.event_task.lock().expect("event task poisoned").take();
        if let Some(task) = task {
            task.abort();
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.shared
            .state
            .lock()
            .expect("opencode state poisoned")
            .session_id
            .clone()
    }

    fn phase(&self) -> SessionPhase {
        self.shared.state.lock().expect("opencode state poisoned").phase
    }
}
