//! Execution backends -- the environments agents run in.
//!
//! The engine consumes this interface only; the heavyweight drivers
//! (remote Docker transports, Sprites VMs) live outside this repository.
//! Two drivers ship here: `standalone` (host processes) and `docker`
//! (containers driven through the docker CLI and Engine API).

pub mod docker;
pub mod local;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use agentctl_db::models::{AgentExecution, Task};

use crate::protocol::AgentIo;
use crate::protocol::framing::demux_container_stream;

/// A provisioned writable tree for one task.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// The path the agent sees.
    pub path: PathBuf,
    /// Host-side path, when it differs from `path` (container backends).
    pub host_path: Option<PathBuf>,
    /// Container id, when the backend is containerised.
    pub container_id: Option<String>,
}

/// How the agent command is spawned for a backend.
#[derive(Debug, Clone)]
pub struct LaunchCommand {
    pub binary: String,
    pub args: Vec<String>,
}

/// Interface the engine consumes from execution-environment drivers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name (`standalone`, `docker`, `remote_docker`, `sprites`).
    fn name(&self) -> &str;

    /// Whether streams returned by [`Backend::attach`] arrive in the
    /// container log framing and must be demultiplexed.
    fn framed_logs(&self) -> bool {
        false
    }

    /// Provision a writable workspace for a task.
    async fn provision(&self, task: &Task) -> Result<Workspace>;

    /// Wrap an agent command line for this environment.
    fn launch_command(&self, workspace: &Workspace, binary: &str, args: &[String])
    -> LaunchCommand;

    /// Probe a recorded execution for liveness.
    async fn is_alive(&self, execution: &AgentExecution) -> bool;

    /// Reattach to a live execution's stdio.
    async fn attach(&self, execution: &AgentExecution) -> Result<AgentIo>;

    /// Tear a workspace down.
    async fn teardown(&self, workspace: &Workspace) -> Result<()>;
}

/// Backends keyed by name.
pub type BackendMap = HashMap<String, Arc<dyn Backend>>;

/// The drivers this process ships with. `remote_docker` and `sprites`
/// reuse the docker driver shape under their own names; their transports
/// are wired by external collaborators.
pub fn default_backends(workspace_root: PathBuf) -> BackendMap {
    let mut backends: BackendMap = HashMap::new();
    backends.insert(
        "standalone".to_string(),
        Arc::new(local::StandaloneBackend::new(workspace_root)),
    );
    backends.insert(
        "docker".to_string(),
        Arc::new(docker::DockerBackend::new(docker::DockerConfig::default())),
    );
    backends
}

/// Apply the container log demux to an attached stream when the backend
/// says its logs are framed.
pub fn demuxed_io(io: AgentIo) -> AgentIo {
    let (demuxed_read, demuxed_write) = tokio::io::duplex(64 * 1024);
    let source = io.stdout;
    tokio::spawn(async move {
        if let Err(e) = demux_container_stream(source, demuxed_write).await {
            tracing::warn!(error = %e, "container log demux ended with error");
        }
    });
    AgentIo {
        stdin: io.stdin,
        stdout: Box::new(demuxed_read) as Box<dyn AsyncRead + Send + Sync + Unpin>,
    }
}

/// Build the engine-facing io for an attach, demuxing when required.
pub fn attach_io(backend: &dyn Backend, io: AgentIo) -> AgentIo {
    if backend.framed_logs() { demuxed_io(io) } else { io }
}

// Object safety: the engine stores `Arc<dyn Backend>`.
const _: () = {
    fn _assert_object_safe(_: &dyn Backend) {}
    fn _assert_send_write(_: Box<dyn AsyncWrite + Send + Sync + Unpin>) {}
};
