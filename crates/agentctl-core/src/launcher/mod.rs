//! Subprocess lifecycle with health-gated startup.
//!
//! Locates the agent binary, secures a TCP port when one is required,
//! spawns the process in its own process group (with parent-death SIGTERM
//! on Linux), pumps its log streams, and gates readiness on an HTTP
//! `/health` poll with exponential backoff. Shutdown escalates SIGTERM to
//! SIGKILL.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::AgentIo;

/// Poll backoff floor, doubled each attempt.
const HEALTH_BACKOFF_START: Duration = Duration::from_millis(100);
/// Poll backoff cap.
const HEALTH_BACKOFF_CAP: Duration = Duration::from_secs(1);
/// Default readiness deadline.
pub const DEFAULT_HEALTH_DEADLINE: Duration = Duration::from_secs(30);
/// Grace after SIGKILL before giving up on the waiter.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Errors from process launch and supervision.
#[derive(Debug, Error)]
pub enum LauncherError {
    #[error("binary not found: {binary}")]
    BinaryNotFound { binary: String },

    #[error("port {port} unavailable: {detail}")]
    PortUnavailable { port: u16, detail: String },

    #[error("process exited unexpectedly during startup (exit code {exit_code:?})")]
    ExitedDuringStartup { exit_code: Option<i32> },

    #[error("health check timed out after {seconds}s")]
    HealthTimeout { seconds: u64 },

    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// How readiness is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthGate {
    /// Poll `http://127.0.0.1:{port}/health` until it answers 200.
    Http,
    /// Pure-stdio agents: a live process is a ready process.
    Disabled,
}

/// What the process's stdout is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdioMode {
    /// Stdout/stdin carry the wire protocol; only stderr is logged.
    Protocol,
    /// Both streams are log pipes (server-style agents).
    Logs,
}

/// Launch configuration.
///
/// `{port}` in args and env values is substituted with the secured port.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: PathBuf,
    /// Requested TCP port; `None` when the agent does not listen.
    pub port: Option<u16>,
    pub health: HealthGate,
    pub stdio: StdioMode,
    pub health_deadline: Duration,
}

impl LauncherConfig {
    pub fn stdio_agent(binary: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: working_dir.into(),
            port: None,
            health: HealthGate::Disabled,
            stdio: StdioMode::Protocol,
            health_deadline: DEFAULT_HEALTH_DEADLINE,
        }
    }
}

/// Locate a binary: absolute path, same directory as the orchestrator,
/// `$PATH`, then conventional development locations.
pub fn locate_binary(binary: &str) -> Option<PathBuf> {
    let direct = Path::new(binary);
    if direct.is_absolute() {
        return direct.is_file().then(|| direct.to_path_buf());
    }
    if direct.components().count() > 1 {
        // Relative path with directories: resolve against cwd only.
        return direct.is_file().then(|| direct.to_path_buf());
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    for dev_dir in ["target/debug", "target/release", "bin", "node_modules/.bin"] {
        let candidate = Path::new(dev_dir).join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    None
}

/// Best-effort identification of whatever holds a port, and a single
/// force-kill attempt when the holder is not the current process.
async fn evict_port_holder(port: u16) {
    let holder = port_holder_pid(port).await;
    match holder {
        Some(pid) if pid != std::process::id() => {
            warn!(port, holder = pid, "port is held by another process, attempting force-kill");
            #[cfg(unix)]
            {
                // SAFETY: signalling a pid we just observed; at worst the
                // signal is delivered to a recycled pid and fails.
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }
        Some(pid) => {
            debug!(port, holder = pid, "port is held by this process, not killing");
        }
        None => {
            debug!(port, "could not identify the port holder");
        }
    }
}

/// Ask `lsof` (then `netstat`) who listens on a port.
async fn port_holder_pid(port: u16) -> Option<u32> {
    if let Ok(output) = Command::new("lsof")
        .args(["-t", "-i", &format!(":{port}")])
        .output()
        .await
    {
        if output.status.success() {
            let text = String::from_utf8_lossy(&output.stdout);
            if let Some(pid) = text.lines().next().and_then(|l| l.trim().parse().ok()) {
                return Some(pid);
            }
        }
    }

    if let Ok(output) = Command::new("netstat").args(["-tlnp"]).output().await {
        let text = String::from_utf8_lossy(&output.stdout);
        for line in text.lines() {
            if line.contains(&format!(":{port} ")) {
                // Last column looks like "1234/progname".
                if let Some(pid) = line
                    .split_whitespace()
                    .last()
                    .and_then(|col| col.split('/').next())
                    .and_then(|p| p.parse().ok())
                {
                    return Some(pid);
                }
            }
        }
    }

    None
}

/// Secure a TCP port: verify the requested one is free, otherwise evict
/// the holder (best-effort) and fall back to an OS-assigned port.
async fn secure_port(requested: u16) -> Result<u16, LauncherError> {
    if requested == 0 {
        // Port 0 is an explicit request for an OS-assigned port.
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(LauncherError::Io)?;
        let port = listener.local_addr().map_err(LauncherError::Io)?.port();
        drop(listener);
        return Ok(port);
    }

    match std::net::TcpListener::bind(("127.0.0.1", requested)) {
        Ok(listener) => {
            drop(listener);
            Ok(requested)
        }
        Err(bind_err) => {
            warn!(port = requested, error = %bind_err, "requested port is not free");
            evict_port_holder(requested).await;

            // Fall back to an OS-assigned port regardless of whether the
            // eviction worked.
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).map_err(|e| {
                LauncherError::PortUnavailable {
                    port: requested,
                    detail: format!("fallback bind failed: {e}"),
                }
            })?;
            let port = listener
                .local_addr()
                .map_err(LauncherError::Io)?
                .port();
            drop(listener);
            info!(requested, fallback = port, "using OS-assigned port");
            Ok(port)
        }
    }
}

/// A supervised agent subprocess.
pub struct Launcher {
    config: LauncherConfig,
    pid: Option<u32>,
    port: Option<u16>,
    io: Option<AgentIo>,
    /// `Some(code)` once the process has exited; closed channel means the
    /// monitor is gone too.
    exited: watch::Receiver<Option<i32>>,
    exited_seed: Option<watch::Sender<Option<i32>>>,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            config,
            pid: None,
            port: None,
            io: None,
            exited: rx,
            exited_seed: Some(tx),
        }
    }

    /// The port the agent actually listens on (after any fallback).
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the protocol stdio. Available once after a `Protocol`-mode
    /// start.
    pub fn take_io(&mut self) -> Option<AgentIo> {
        self.io.take()
    }

    /// Spawn the process and gate on readiness.
    pub async fn start(&mut self, cancel: &CancellationToken) -> Result<(), LauncherError> {
        let binary_path =
            locate_binary(&self.config.binary).ok_or_else(|| LauncherError::BinaryNotFound {
                binary: self.config.binary.clone(),
            })?;

        let port = match self.config.port {
            Some(requested) => Some(secure_port(requested).await?),
            None => None,
        };
        self.port = port;

        let substitute = |value: &str| -> String {
            match port {
                Some(port) => value.replace("{port}", &port.to_string()),
                None => value.to_string(),
            }
        };

        let mut command = Command::new(&binary_path);
        for arg in &self.config.args {
            command.arg(substitute(arg));
        }
        for (key, value) in &self.config.env {
            command.env(key, substitute(value));
        }
        command
            .current_dir(&self.config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);

        // New process group, so a Ctrl-C to the orchestrator is not
        // delivered to agents; on Linux the child additionally gets
        // SIGTERM when we die.
        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                libc::setpgid(0, 0);
                #[cfg(target_os = "linux")]
                libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                Ok(())
            });
        }

        let mut child = command.spawn().map_err(|source| LauncherError::Spawn {
            binary: self.config.binary.clone(),
            source,
        })?;

        let pid = child.id();
        self.pid = pid;
        info!(binary = %binary_path.display(), pid, port, "agent process started");

        // Stderr is always a log pipe; bind and permission errors surface
        // there.
        if let Some(stderr) = child.stderr.take() {
            let log_pid = pid.unwrap_or_default();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(pid = log_pid, line = %line, "agent stderr");
                }
            });
        }

        let stdout = child.stdout.take();
        let stdin = child.stdin.take();
        match self.config.stdio {
            StdioMode::Protocol => {
                if let (Some(stdout), Some(stdin)) = (stdout, stdin) {
                    self.io = Some(AgentIo {
                        stdin: Box::new(stdin),
                        stdout: Box::new(stdout),
                    });
                }
            }
            StdioMode::Logs => {
                if let Some(stdout) = stdout {
                    let log_pid = pid.unwrap_or_default();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stdout).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!(pid = log_pid, line = %line, "agent stdout");
                        }
                    });
                }
                // Server-style agents do not read stdin.
                drop(stdin);
            }
        }

        // Monitor: wait on the child and publish the exit status so every
        // waiter (stop, health loop, wait) can observe it.
        let exited_tx = self
            .exited_seed
            .take()
            .expect("start called twice on one launcher");
        tokio::spawn(async move {
            let status = child.wait().await;
            let code = status.ok().and_then(|s| s.code());
            debug!(pid, exit_code = code, "agent process exited");
            let _ = exited_tx.send(Some(code.unwrap_or(-1)));
        });

        // Readiness gate.
        match (self.config.health, port) {
            (HealthGate::Http, Some(port)) => {
                self.poll_health(port, cancel).await?;
            }
            _ => {
                // A process that died between spawn and here is not ready.
                if let Some(code) = *self.exited.borrow() {
                    return Err(LauncherError::ExitedDuringStartup {
                        exit_code: Some(code),
                    });
                }
            }
        }

        Ok(())
    }

    /// Poll `/health` with exponential backoff until 200, exit, deadline,
    /// or cancellation.
    async fn poll_health(
        &mut self,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), LauncherError> {
        let url = format!("http://127.0.0.1:{port}/health");
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(1))
            .build()
            .map_err(|e| LauncherError::Io(std::io::Error::other(e)))?;

        let deadline = tokio::time::Instant::now() + self.config.health_deadline;
        let mut backoff = HEALTH_BACKOFF_START;
        let mut exited = self.exited.clone();

        loop {
            if let Some(code) = *exited.borrow() {
                return Err(LauncherError::ExitedDuringStartup {
                    exit_code: Some(code),
                });
            }

            if let Ok(response) = client.get(&url).send().await {
                if response.status().is_success() {
                    debug!(port, "agent healthy");
                    return Ok(());
                }
            }

            if tokio::time::Instant::now() + backoff >= deadline {
                return Err(LauncherError::HealthTimeout {
                    seconds: self.config.health_deadline.as_secs(),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = exited.changed() => {}
                _ = cancel.cancelled() => {
                    return Err(LauncherError::Io(std::io::Error::new(
                        std::io::ErrorKind::Interrupted,
                        "startup cancelled",
                    )));
                }
            }

            backoff = (backoff * 2).min(HEALTH_BACKOFF_CAP);
        }
    }

    /// Graceful shutdown: SIGTERM, wait out the timeout, then SIGKILL.
    ///
    /// Returns the exit code when the process ends inside the grace
    /// windows.
    pub async fn stop(&self, graceful_timeout: Duration) -> Result<Option<i32>, LauncherError> {
        let Some(pid) = self.pid else {
            return Ok(None);
        };

        if self.exited.borrow().is_some() {
            return Ok(*self.exited.borrow());
        }

        #[cfg(unix)]
        {
            // SAFETY: pid belongs to a child we spawned.
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                debug!(pid, "SIGTERM delivery failed (process already gone?)");
            }
        }

        let mut exited = self.exited.clone();
        let graceful = tokio::time::timeout(graceful_timeout, async {
            while exited.borrow().is_none() {
                if exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;

        if graceful.is_err() {
            warn!(pid, "process ignored SIGTERM, sending SIGKILL");
            #[cfg(unix)]
            {
                // SAFETY: as above.
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
            let mut exited = self.exited.clone();
            let _ = tokio::time::timeout(KILL_GRACE, async {
                while exited.borrow().is_none() {
                    if exited.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
        }

        Ok(*self.exited.borrow())
    }

    /// Block until the process exits; returns its exit code.
    pub async fn wait(&self) -> Option<i32> {
        let mut exited = self.exited.clone();
        loop {
            if let Some(code) = *exited.borrow() {
                return Some(code);
            }
            if exited.changed().await.is_err() {
                return *exited.borrow();
            }
        }
    }

    /// Whether the process is still running.
    pub fn is_running(&self) -> bool {
        self.pid.is_some() && self.exited.borrow().is_none()
    }
}
