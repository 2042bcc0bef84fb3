//! JSON-RPC 2.0 client with bidirectional dispatch.
//!
//! Outbound calls generate monotonically increasing ids and register a
//! one-shot continuation before writing; the write side is serialised
//! under a mutex so interleaved writes cannot corrupt framing. The read
//! loop classifies every inbound message:
//!
//! - `id` and `method`: server-initiated request, dispatched to the
//!   handler from a spawned task (permission waits must never block the
//!   loop); the response is sent carrying the same id.
//! - `id` without `method`: response, delivered to the registered
//!   continuation; unmatched responses are logged and dropped.
//! - `method` without `id`: notification, handled inline so per-session
//!   update order is preserved.
//!
//! Malformed messages are logged and skipped; a burst of more than 16
//! inside 10 seconds closes the connection with a protocol error.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::framing::{FrameReader, FrameWriter};

/// Method-not-found, per JSON-RPC 2.0.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid params.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error.
pub const INTERNAL_ERROR: i64 = -32603;

/// Malformed-message burst threshold: more than this many inside
/// [`PROTOCOL_BURST_WINDOW`] fails the connection.
const PROTOCOL_BURST_LIMIT: usize = 16;
const PROTOCOL_BURST_WINDOW: Duration = Duration::from_secs(10);

/// Errors surfaced by the client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The underlying stream failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection closed (EOF or explicit close).
    #[error("connection closed")]
    Closed,

    /// A message could not be parsed or violated the protocol.
    #[error("malformed message: {detail}")]
    Malformed { detail: String },

    /// A message exceeded the 1 MiB cap.
    #[error("message of {size} bytes exceeds the size cap")]
    OversizedMessage { size: usize },

    /// The remote returned a JSON-RPC error object.
    #[error("remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// Wire-level error object `{code, message, data?}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: METHOD_NOT_FOUND,
            message: format!("method not found: {method}"),
            data: None,
        }
    }

    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: detail.into(),
            data: None,
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: detail.into(),
            data: None,
        }
    }
}

/// Receiver side of the bidirectional dialogue.
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    /// Handle a server-initiated request. The returned value (or error
    /// object) is written back carrying the request's id.
    async fn handle_request(&self, method: &str, params: Value) -> Result<Value, RpcErrorObject>;

    /// Handle a notification. No response is expected.
    async fn handle_notification(&self, method: &str, params: Value);
}

type Pending = Arc<Mutex<HashMap<i64, oneshot::Sender<Result<Value, RpcError>>>>>;
type SharedWriter = Arc<tokio::sync::Mutex<FrameWriter<Box<dyn AsyncWrite + Send + Sync + Unpin>>>>;

/// The JSON-RPC client. One per agent connection; shared via `Arc`.
pub struct JsonRpcClient {
    writer: SharedWriter,
    pending: Pending,
    next_id: AtomicI64,
    read_task: Mutex<Option<JoinHandle<()>>>,
    closed_tx: watch::Sender<bool>,
}

impl JsonRpcClient {
    /// Spawn a client over a framed transport. The read loop runs until
    /// EOF, a transport error, a protocol burst, or `close`.
    pub fn spawn(
        reader: FrameReader<Box<dyn AsyncRead + Send + Sync + Unpin>>,
        writer: FrameWriter<Box<dyn AsyncWrite + Send + Sync + Unpin>>,
        handler: Arc<dyn ServerRequestHandler>,
    ) -> Arc<Self> {
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (closed_tx, _) = watch::channel(false);

        let client = Arc::new(Self {
            writer: Arc::clone(&writer),
            pending: Arc::clone(&pending),
            next_id: AtomicI64::new(1),
            read_task: Mutex::new(None),
            closed_tx,
        });

        let loop_client = Arc::clone(&client);
        let task = tokio::spawn(async move {
            let reason = read_loop(reader, loop_client.clone(), handler).await;
            loop_client.shutdown_pending(reason);
        });
        *client.read_task.lock().expect("read task mutex poisoned") = Some(task);

        client
    }

    /// Observe connection closure. The value flips to `true` exactly once.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    /// Issue a request and await its response.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        // Register before writing so a fast response cannot race us.
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(id, tx);

        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        if let Err(err) = self.write(&message).await {
            self.pending
                .lock()
                .expect("pending mutex poisoned")
                .remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(result) => result,
            // Sender dropped: the read loop exited.
            Err(_) => Err(RpcError::Closed),
        }
    }

    /// Send a notification. Never blocks waiting on the agent.
    pub async fn notify(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let message = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
        });
        self.write(&message).await
    }

    /// Send a response to a server-initiated request, echoing its id.
    pub async fn respond(
        &self,
        id: Value,
        result: Result<Value, RpcErrorObject>,
    ) -> Result<(), RpcError> {
        let message = match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err(err) => json!({"jsonrpc": "2.0", "id": id, "error": err}),
        };
        self.write(&message).await
    }

    /// Terminate the read loop and close the write side.
    pub async fn close(&self) {
        let task = self
            .read_task
            .lock()
            .expect("read task mutex poisoned")
            .take();
        if let Some(task) = task {
            task.abort();
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        self.shutdown_pending(RpcError::Closed);
    }

    async fn write(&self, message: &Value) -> Result<(), RpcError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| RpcError::Malformed { detail: e.to_string() })?;
        let mut writer = self.writer.lock().await;
        writer.write_message(&payload).await.map_err(RpcError::from)
    }

    /// Fail every pending continuation and mark the connection closed.
    fn shutdown_pending(&self, reason: RpcError) {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        for (_, tx) in pending.drain() {
            let err = match &reason {
                RpcError::Transport(msg) => RpcError::Transport(msg.clone()),
                RpcError::Malformed { detail } => RpcError::Malformed {
                    detail: detail.clone(),
                },
                _ => RpcError::Closed,
            };
            let _ = tx.send(Err(err));
        }
        let _ = self.closed_tx.send(true);
    }
}

/// The read loop. Returns the reason it exited.
async fn read_loop(
    mut reader: FrameReader<Box<dyn AsyncRead + Send + Sync + Unpin>>,
    client: Arc<JsonRpcClient>,
    handler: Arc<dyn ServerRequestHandler>,
) -> RpcError {
    let mut malformed_at: VecDeque<Instant> = VecDeque::new();

    loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => return RpcError::Closed,
            Err(err) => return RpcError::Transport(err.to_string()),
        };

        let value: Value = match serde_json::from_str(&message) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, line = %truncate_for_log(&message), "skipping malformed message");
                let now = Instant::now();
                malformed_at.push_back(now);
                while let Some(front) = malformed_at.front() {
                    if now.duration_since(*front) > PROTOCOL_BURST_WINDOW {
                        malformed_at.pop_front();
                    } else {
                        break;
                    }
                }
                if malformed_at.len() > PROTOCOL_BURST_LIMIT {
                    return RpcError::Malformed {
                        detail: format!(
                            "more than {PROTOCOL_BURST_LIMIT} malformed messages in 10s"
                        ),
                    };
                }
                continue;
            }
        };

        let id = value.get("id").cloned();
        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .map(str::to_owned);
        let params = value.get("params").cloned().unwrap_or(Value::Null);

        match (id, method) {
            // Server-initiated request: handle off-loop, respond with the
            // same id.
            (Some(id), Some(method)) => {
                let handler = Arc::clone(&handler);
                let client = Arc::clone(&client);
                tokio::spawn(async move {
                    let result = handler.handle_request(&method, params).await;
                    if let Err(err) = client.respond(id, result).await {
                        warn!(method = %method, error = %err, "failed to respond to server request");
                    }
                });
            }
            // Response: deliver to the registered continuation.
            (Some(id), None) => {
                let Some(id) = id.as_i64() else {
                    warn!(id = %id, "dropping response with non-integer id");
                    continue;
                };
                let continuation = client
                    .pending
                    .lock()
                    .expect("pending mutex poisoned")
                    .remove(&id);
                match continuation {
                    Some(tx) => {
                        let outcome = if let Some(err) = value.get("error") {
                            Err(RpcError::Remote {
                                code: err.get("code").and_then(|c| c.as_i64()).unwrap_or(0),
                                message: err
                                    .get("message")
                                    .and_then(|m| m.as_str())
                                    .unwrap_or("unknown error")
                                    .to_string(),
                                data: err.get("data").cloned(),
                            })
                        } else {
                            Ok(value.get("result").cloned().unwrap_or(Value::Null))
                        };
                        let _ = tx.send(outcome);
                    }
                    None => {
                        warn!(id, "dropping unmatched response");
                    }
                }
            }
            // Notification: handled inline so ordering is preserved.
            (None, Some(method)) => {
                handler.handle_notification(&method, params).await;
            }
            (None, None) => {
                debug!("skipping message with neither id nor method");
            }
        }
    }
}

fn truncate_for_log(message: &str) -> &str {
    &message[..message.len().min(200)]
}
