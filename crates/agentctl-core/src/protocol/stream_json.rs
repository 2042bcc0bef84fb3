//! Claude-style stream-json: line-delimited typed records on stdout, the
//! prompt written to stdin.
//!
//! This dialect has no request/response layer. The adapter writes the
//! prompt text to the agent's stdin, closes it, and parses each JSONL
//! record into the unified vocabulary until the terminal `result` record
//! (or EOF) ends the turn.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::framing::FrameReader;
use super::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PromptOutcome, ProtocolAdapter, SessionPhase, SessionUpdate,
};

/// Parse a single stream-json record into zero or more updates.
///
/// Callers treat `Err` as a warning and continue reading.
fn parse_record(line: &str) -> Result<Vec<SessionUpdate>> {
    let value: Value = serde_json::from_str(line).context("malformed JSON in stream output")?;
    let mut updates = Vec::new();

    let record_type = value.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match record_type {
        // assistant -- a message with content blocks
        "assistant" => {
            if let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in content {
                    let block_type = block.get("type").and_then(|t| t.as_str()).unwrap_or("");
                    match block_type {
                        "text" => {
                            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                                updates.push(SessionUpdate::MessageChunk {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "thinking" => {
                            if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                                updates.push(SessionUpdate::Reasoning {
                                    text: text.to_string(),
                                });
                            }
                        }
                        "tool_use" => {
                            updates.push(SessionUpdate::ToolCall {
                                tool_call_id: block
                                    .get("id")
                                    .and_then(|i| i.as_str())
                                    .unwrap_or_default()
                                    .to_string(),
                                title: block
                                    .get("name")
                                    .and_then(|n| n.as_str())
                                    .unwrap_or("unknown")
                                    .to_string(),
                                status: "running".to_string(),
                                args: block.get("input").cloned().unwrap_or(Value::Null),
                            });
                        }
                        _ => {}
                    }
                }
            }
        }

        // user -- carries tool_result blocks echoed back to the model
        "user" => {
            if let Some(content) = value
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array())
            {
                for block in content {
                    if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
                        updates.push(SessionUpdate::ToolCallUpdate {
                            tool_call_id: block
                                .get("tool_use_id")
                                .and_then(|i| i.as_str())
                                .unwrap_or_default()
                                .to_string(),
                            status: if block
                                .get("is_error")
                                .and_then(|e| e.as_bool())
                                .unwrap_or(false)
                            {
                                "failed".to_string()
                            } else {
                                "completed".to_string()
                            },
                            result: block.get("content").cloned(),
                        });
                    }
                }
            }
        }

        // result -- the terminal record of a turn
        "result" => {
            let is_error = value
                .get("is_error")
                .and_then(|e| e.as_bool())
                .unwrap_or_else(|| {
                    value
                        .get("subtype")
                        .and_then(|s| s.as_str())
                        .is_some_and(|s| s.starts_with("error"))
                });
            if let Some(text) = value.get("result").and_then(|r| r.as_str()) {
                if !text.is_empty() {
                    updates.push(SessionUpdate::MessageChunk {
                        text: text.to_string(),
                    });
                }
            }
            updates.push(SessionUpdate::Complete {
                stop_reason: "end_turn".to_string(),
                is_error,
            });
        }

        "error" => {
            let message = value
                .get("error")
                .and_then(|e| e.get("message").and_then(|m| m.as_str()))
                .or_else(|| value.get("message").and_then(|m| m.as_str()))
                .unwrap_or("unknown error")
                .to_string();
            updates.push(SessionUpdate::Error {
                kind: "remote".to_string(),
                message,
            });
        }

        // system -- init metadata; carries the agent-side session id
        "system" => {}

        other => {
            debug!(record_type = other, "ignoring unrecognised stream-json record type");
        }
    }

    Ok(updates)
}

struct StreamJsonState {
    phase: SessionPhase,
    session_id: Option<String>,
    /// Session id announced by the agent's `system` init record, used in
    /// preference to a generated one.
    agent_session_id: Option<String>,
}

/// Adapter for stream-json agents.
pub struct StreamJsonAdapter {
    stdin: tokio::sync::Mutex<Option<Box<dyn tokio::io::AsyncWrite + Send + Sync + Unpin>>>,
    state: Mutex<StreamJsonState>,
    turn_done: watch::Receiver<Option<PromptOutcome>>,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamJsonAdapter {
    pub fn spawn(io: AgentIo, ctx: AdapterContext) -> Arc<dyn ProtocolAdapter> {
        let (done_tx, done_rx) = watch::channel(None);

        let adapter = Arc::new(Self {
            stdin: tokio::sync::Mutex::new(Some(io.stdin)),
            state: Mutex::new(StreamJsonState {
                phase: SessionPhase::Fresh,
                session_id: None,
                agent_session_id: None,
            }),
            turn_done: done_rx,
            read_task: Mutex::new(None),
        });

        let reader_adapter = Arc::clone(&adapter);
        let updates = ctx.updates;
        let task = tokio::spawn(async move {
            let mut reader = FrameReader::newline(io.stdout);
            loop {
                match reader.read_message().await {
                    Ok(Some(line)) => {
                        // Capture the agent's own session id when announced.
                        if let Ok(value) = serde_json::from_str::<Value>(&line) {
                            if let Some(sid) =
                                value.get("session_id").and_then(|s| s.as_str())
                            {
                                let mut state = reader_adapter
                                    .state
                                    .lock()
                                    .expect("stream-json state poisoned");
                                state.agent_session_id.get_or_insert(sid.to_string());
                            }
                        }
                        match parse_record(&line) {
                            Ok(parsed) => {
                                for update in parsed {
                                    if let SessionUpdate::Complete {
                                        stop_reason,
                                        is_error,
                                    } = &update
                                    {
                                        reader_adapter.finish_turn(PromptOutcome {
                                            stop_reason: stop_reason.clone(),
                                            is_error: *is_error,
                                        });
                                        let _ = done_tx.send(Some(PromptOutcome {
                                            stop_reason: stop_reason.clone(),
                                            is_error: *is_error,
                                        }));
                                    }
                                    let _ = updates.send(update);
                                }
                            }
                            Err(e) => {
                                warn!(line = %line, error = %e, "skipping malformed stream-json line");
                            }
                        }
                    }
                    Ok(None) => {
                        // EOF without a result record: the turn ends with
                        // whatever the process produced.
                        let already_done = done_tx.borrow().is_some();
                        if !already_done {
                            let outcome = PromptOutcome {
                                stop_reason: "end_turn".to_string(),
                                is_error: false,
                            };
                            reader_adapter.finish_turn(outcome.clone());
                            let _ = updates.send(SessionUpdate::Complete {
                                stop_reason: outcome.stop_reason.clone(),
                                is_error: outcome.is_error,
                            });
                            let _ = done_tx.send(Some(outcome));
                        }
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "stream-json read error");
                        reader_adapter.set_phase(SessionPhase::Error);
                        let _ = updates.send(SessionUpdate::Error {
                            kind: "transport".to_string(),
                            message: e.to_string(),
                        });
                        let _ = done_tx.send(Some(PromptOutcome {
                            stop_reason: "error".to_string(),
                            is_error: true,
                        }));
                        break;
                    }
                }
            }
        });
        *adapter.read_task.lock().expect("read task poisoned") = Some(task);

        adapter
    }

    fn set_phase(&self, phase: SessionPhase) {
        self.state.lock().expect("stream-json state poisoned").phase = phase;
    }

    fn finish_turn(&self, outcome: PromptOutcome) {
        let mut state = self.state.lock().expect("stream-json state poisoned");
        state.phase = if outcome.is_error {
            SessionPhase::Error
        } else {
            SessionPhase::Complete
        };
    }
}

#[async_trait]
impl ProtocolAdapter for StreamJsonAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::StreamJson
    }

    async fn initialize(&self) -> Result<AgentCapabilities> {
        // Nothing to exchange; the dialect has no handshake.
        let mut state = self.state.lock().expect("stream-json state poisoned");
        if state.phase == SessionPhase::Fresh {
            state.phase = SessionPhase::Ready;
        }
        Ok(AgentCapabilities {
            protocol_version: 0,
            load_session: false,
            raw: Value::Null,
        })
    }

    async fn new_session(&self, _cwd: &Path, _mcp_servers: &[McpServerConfig]) -> Result<String> {
        let mut state = self.state.lock().expect("stream-json state poisoned");
        if state.phase == SessionPhase::Fresh {
            bail!("new_session before initialize");
        }
        if state.session_id.is_some() {
            bail!("session id is already assigned");
        }
        let session_id = state
            .agent_session_id
            .clone()
            .unwrap_or_else(|| format!("stream-{}", Uuid::new_v4()));
        state.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    async fn load_session(&self, _session_id: &str) -> Result<()> {
        bail!("stream-json agents do not support session resume")
    }

    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome> {
        {
            let mut state = self.state.lock().expect("stream-json state poisoned");
            if state.phase != SessionPhase::Ready {
                bail!("prompt in phase {:?}, expected ready", state.phase);
            }
            if state.session_id.is_none() {
                bail!("prompt before a session was created");
            }
            state.phase = SessionPhase::Prompting;
        }

        // Write the prompt and close stdin so the agent starts its turn.
        let text = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut stdin_slot = self.stdin.lock().await;
        let mut stdin = stdin_slot
            .take()
            .context("agent stdin was already consumed")?;
        stdin
            .write_all(text.as_bytes())
            .await
            .context("failed to write prompt to agent stdin")?;
        stdin
            .shutdown()
            .await
            .context("failed to close agent stdin")?;
        drop(stdin_slot);

        // Await the terminal record (or EOF).
        let mut done = self.turn_done.clone();
        loop {
            if let Some(outcome) = done.borrow().clone() {
                return Ok(outcome);
            }
            done.changed().await.context("stream-json reader vanished")?;
        }
    }

    async fn cancel(&self, reason: &str) -> Result<()> {
        // No cancellation channel in this dialect; the executor kills the
        // process instead.
        debug!(reason, "cancel requested for stream-json session");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("stream-json state poisoned");
            if state.phase != SessionPhase::Error {
                state.phase = SessionPhase::Complete;
            }
        }
        let task = self.read_task.lock().expect("read task poisoned").take();
        if let Some(task) = task {
            task.abort();
        }
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("stream-json state poisoned")
            .session_id
            .clone()
    }

    fn phase(&self) -> SessionPhase {
        self.state.lock().expect("stream-json state poisoned").phase
    }
}
