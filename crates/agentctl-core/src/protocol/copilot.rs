//! Copilot CLI server: JSON-RPC over TCP to an already-listening server,
//! whose address is announced on the process's stdout. Falls back to
//! plain stdio when the process starts speaking JSON-RPC directly.
//!
//! The conversation surface is the ACP machinery; only the transport
//! bootstrap differs.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info};

use super::acp::{AcpAdapter, AcpFlavor};
use super::{
    AdapterContext, AdapterKind, AgentCapabilities, AgentIo, ContentBlock, McpServerConfig,
    PromptOutcome, ProtocolAdapter, SessionPhase,
};

/// How long to watch stdout for a listen address before giving up.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Extract a listen address from one stdout line.
///
/// Understands `... listening on <host:port>` banners and JSON lines with
/// a top-level `port` field.
fn parse_listen_address(line: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<Value>(line) {
        if let Some(port) = value.get("port").and_then(|p| p.as_u64()) {
            return Some(format!("127.0.0.1:{port}"));
        }
    }

    let lowered = line.to_lowercase();
    if let Some(idx) = lowered.find("listening on ") {
        let tail = line[idx + "listening on ".len()..].trim();
        let addr = tail.split_whitespace().next()?;
        let addr = addr.trim_start_matches("http://").trim_end_matches('/');
        if addr.contains(':') {
            return Some(addr.to_string());
        }
    }
    None
}

enum Discovered {
    /// The server announced a TCP address.
    Tcp(String),
    /// The process began speaking JSON-RPC on stdout; the consumed bytes
    /// must be replayed ahead of the stream.
    Stdio(Vec<u8>),
    /// Stdout closed before either happened.
    Eof,
}

async fn discover<R: AsyncRead + Unpin>(stdout: &mut BufReader<R>) -> std::io::Result<Discovered> {
    let mut line_buf = Vec::new();
    loop {
        line_buf.clear();
        let n = stdout.read_until(b'\n', &mut line_buf).await?;
        if n == 0 {
            return Ok(Discovered::Eof);
        }
        let line = String::from_utf8_lossy(&line_buf);
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(addr) = parse_listen_address(trimmed) {
            return Ok(Discovered::Tcp(addr));
        }
        if trimmed.starts_with('{') {
            return Ok(Discovered::Stdio(line_buf.clone()));
        }
        debug!(line = trimmed, "copilot stdout banner");
    }
}

/// Adapter for the Copilot CLI server. Delegates the session API to the
/// ACP machinery once the transport is established.
pub struct CopilotAdapter {
    inner: Arc<dyn ProtocolAdapter>,
}

impl CopilotAdapter {
    pub async fn connect(io: AgentIo, ctx: AdapterContext) -> Result<Arc<dyn ProtocolAdapter>> {
        Self::connect_with_timeout(io, ctx, DISCOVERY_TIMEOUT).await
    }

    pub async fn connect_with_timeout(
        io: AgentIo,
        ctx: AdapterContext,
        timeout: Duration,
    ) -> Result<Arc<dyn ProtocolAdapter>> {
        let mut stdout = BufReader::new(io.stdout);
        let stdin = io.stdin;

        let discovered = tokio::time::timeout(timeout, discover(&mut stdout))
            .await
            .context("timed out waiting for the copilot server address")?
            .context("error reading copilot stdout")?;

        let inner: Arc<dyn ProtocolAdapter> = match discovered {
            Discovered::Tcp(addr) => {
                info!(addr = %addr, "connecting to copilot server");
                let stream = TcpStream::connect(&addr)
                    .await
                    .with_context(|| format!("failed to connect to copilot server at {addr}"))?;
                let (read_half, write_half) = stream.into_split();

                // Keep draining process stdout as log lines.
                tokio::spawn(async move {
                    let mut lines = stdout.lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        debug!(line = %line, "copilot stdout");
                    }
                });

                AcpAdapter::spawn(
                    AgentIo {
                        stdin: Box::new(write_half) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
                        stdout: Box::new(read_half) as Box<dyn AsyncRead + Send + Sync + Unpin>,
                    },
                    ctx,
                    AcpFlavor::Standard,
                )
            }
            Discovered::Stdio(replay) => {
                debug!("copilot speaking JSON-RPC on stdio, no TCP server");
                let chained = std::io::Cursor::new(replay).chain(stdout);
                AcpAdapter::spawn(
                    AgentIo {
                        stdin,
                        stdout: Box::new(chained) as Box<dyn AsyncRead + Send + Sync + Unpin>,
                    },
                    ctx,
                    AcpFlavor::Standard,
                )
            }
            Discovered::Eof => {
                bail!("copilot process closed stdout before announcing an address");
            }
        };

        Ok(Arc::new(Self { inner }))
    }
}

#[async_trait]
impl ProtocolAdapter for CopilotAdapter {
    fn kind(&self) -> AdapterKind {
        AdapterKind::Copilot
    }

    async fn initialize(&self) -> Result<AgentCapabilities> {
        self.inner.initialize().await
    }

    async fn new_session(&self, cwd: &Path, mcp_servers: &[McpServerConfig]) -> Result<String> {
        self.inner.new_session(cwd, mcp_servers).await
    }

    async fn load_session(&self, session_id: &str) -> Result<()> {
        self.inner.load_session(session_id).await
    }

    async fn prompt(&self, blocks: Vec<ContentBlock>) -> Result<PromptOutcome> {
        self.inner.prompt(blocks).await
    }

    async fn cancel(&self, reason: &str) -> Result<()> {
        self.inner.cancel(reason).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn session_id(&self) -> Option<String> {
        self.inner.session_id()
    }

    fn phase(&self) -> SessionPhase {
        self.inner.phase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        PermissionOutcome, PermissionRequest, PermissionRequestHandler, SessionUpdate,
    };
    use serde_json::json;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    struct NoPermissions;

    #[async_trait]
    impl PermissionRequestHandler for NoPermissions {
        async fn request_permission(&self, _request: PermissionRequest) -> PermissionOutcome {
            PermissionOutcome::Cancelled
        }
    }

    fn ctx() -> (AdapterContext, mpsc::UnboundedReceiver<SessionUpdate>) {
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        (
            AdapterContext {
                instance_id: Uuid::new_v4(),
                task_id: Uuid::new_v4(),
                workspace_root: std::env::temp_dir(),
                updates: updates_tx,
                permissions: Arc::new(NoPermissions),
            },
            updates_rx,
        )
    }

    #[test]
    fn parse_banner_addresses() {
        assert_eq!(
            parse_listen_address("Copilot server listening on 127.0.0.1:8923"),
            Some("127.0.0.1:8923".to_string())
        );
        assert_eq!(
            parse_listen_address("Listening on http://127.0.0.1:9000/"),
            Some("127.0.0.1:9000".to_string())
        );
        assert_eq!(
            parse_listen_address(r#"{"port": 7070}"#),
            Some("127.0.0.1:7070".to_string())
        );
        assert_eq!(parse_listen_address("starting up..."), None);
        assert_eq!(parse_listen_address("listening on stdio"), None);
    }

    #[tokio::test]
    async fn connects_over_tcp_from_banner() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // The "server" accepts one connection and answers initialize.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            let mut lines = BufReader::new(read_half).lines();

            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(request["method"], "initialize");
            let reply = json!({
                "jsonrpc": "2.0",
                "id": request["id"],
                "result": {"protocolVersion": 1},
            });
            write_half
                .write_all(format!("{reply}\n").as_bytes())
                .await
                .unwrap();
        });

        // Process stdout announces the address, then stays open.
        let (mut stdout_write, stdout_read) = {
            let (a, b) = tokio::io::duplex(4096);
            let (read, _unused_write) = tokio::io::split(b);
            (a, read)
        };
        stdout_write
            .write_all(format!("server listening on {addr}\n").as_bytes())
            .await
            .unwrap();

        let (stdin_write, _stdin_read) = {
            let (a, b) = tokio::io::duplex(4096);
            let (read, _w) = tokio::io::split(b);
            (a, read)
        };

        let (context, _updates) = ctx();
        let adapter = CopilotAdapter::connect_with_timeout(
            AgentIo {
                stdin: Box::new(stdin_write) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
                stdout: Box::new(stdout_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
            },
            context,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        assert_eq!(adapter.kind(), AdapterKind::Copilot);
        let caps = adapter.initialize().await.unwrap();
        assert_eq!(caps.protocol_version, 1);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn falls_back_to_stdio_on_json_line() {
        let (engine_side, agent_side) = tokio::io::duplex(64 * 1024);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        let (agent_read, mut agent_write) = tokio::io::split(agent_side);

        // First stdout line is already JSON-RPC: stdio mode. Using a
        // notification means the replayed line is consumed harmlessly.
        let first = json!({"jsonrpc": "2.0", "method": "server/status", "params": {}});
        agent_write
            .write_all(format!("{first}\n").as_bytes())
            .await
            .unwrap();

        let (context, _updates) = ctx();
        let adapter = CopilotAdapter::connect_with_timeout(
            AgentIo {
                stdin: Box::new(engine_write) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
                stdout: Box::new(engine_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
            },
            context,
            Duration::from_secs(5),
        )
        .await
        .unwrap();

        // Handshake over the same stdio pipes.
        let init = tokio::spawn({
            let adapter = Arc::clone(&adapter);
            async move { adapter.initialize().await }
        });

        let mut lines = BufReader::new(agent_read).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let request: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(request["method"], "initialize");
        let reply = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": {"protocolVersion": 1},
        });
        agent_write
            .write_all(format!("{reply}\n").as_bytes())
            .await
            .unwrap();

        init.await.unwrap().unwrap();
        assert_eq!(adapter.kind(), AdapterKind::Copilot);
    }

    #[tokio::test]
    async fn eof_before_address_fails() {
        let (engine_side, agent_side) = tokio::io::duplex(4096);
        let (engine_read, engine_write) = tokio::io::split(engine_side);
        drop(agent_side);

        let (context, _updates) = ctx();
        let result = CopilotAdapter::connect_with_timeout(
            AgentIo {
                stdin: Box::new(engine_write) as Box<dyn AsyncWrite + Send + Sync + Unpin>,
                stdout: Box::new(engine_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
            },
            context,
            Duration::from_secs(5),
        )
        .await;
        assert!(result.is_err());
    }
}
