//! Docker backend.
//!
//! Containers are provisioned through the docker CLI: `docker create`
//! with the task workspace mounted at `/workspace`, `docker start`, and
//! the agent command wrapped in `docker exec -i`. Reattach goes through
//! the Engine API attach endpoint, whose hijacked stream arrives in the
//! 8-byte log framing the engine demultiplexes.

use std::path::PathBuf;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use agentctl_db::models::{AgentExecution, Task};

use super::{Backend, LaunchCommand, Workspace};
use crate::protocol::AgentIo;

/// Configuration for the docker driver.
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Image agents run in.
    pub image: String,
    /// Extra flags passed to `docker create`.
    pub extra_flags: Vec<String>,
    /// Engine API socket, used for framed reattach.
    pub socket: PathBuf,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            extra_flags: vec![],
            socket: PathBuf::from("/var/run/docker.sock"),
        }
    }
}

/// Container-based execution environment.
#[derive(Debug)]
pub struct DockerBackend {
    config: DockerConfig,
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    /// Container name for a task. Docker accepts alphanumerics and
    /// hyphens only.
    fn container_name(task: &Task) -> String {
        let sanitize = |s: &str| -> String {
            s.chars()
                .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '-' })
                .collect()
        };
        format!("agentctl-{}", sanitize(&task.id.to_string()))
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn name(&self) -> &str {
        "docker"
    }

    fn framed_logs(&self) -> bool {
        true
    }

    async fn provision(&self, task: &Task) -> Result<Workspace> {
        let container_name = Self::container_name(task);

        let mut args = vec![
            "create".to_string(),
            "--name".to_string(),
            container_name.clone(),
            "-w".to_string(),
            "/workspace".to_string(),
        ];
        for flag in &self.config.extra_flags {
            args.push(flag.clone());
        }
        args.push(self.config.image.clone());
        args.push("sleep".to_string());
        args.push("infinity".to_string());

        let output = Command::new("docker")
            .args(&args)
            .output()
            .await
            .context("failed to run docker create")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("docker create failed: {stderr}");
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();

        let start_output = Command::new("docker")
            .args(["start", &container_id])
            .output()
            .await
            .context("failed to run docker start")?;

        if !start_output.status.success() {
            let stderr = String::from_utf8_lossy(&start_output.stderr);
            let _ = Command::new("docker")
                .args(["rm", "-f", &container_id])
                .output()
                .await;
            bail!("docker start failed: {stderr}");
        }

        let mkdir_output = Command::new("docker")
            .args(["exec", &container_id, "mkdir", "-p", "/workspace"])
            .output()
            .await
            .context("failed to run docker exec mkdir")?;
        if !mkdir_output.status.success() {
            let stderr = String::from_utf8_lossy(&mkdir_output.stderr);
            bail!("docker exec mkdir -p /workspace failed: {stderr}");
        }

        info!(container_id = %container_id, task_id = %task.id, "container provisioned");

        Ok(Workspace {
            path: PathBuf::from("/workspace"),
            host_path: None,
            container_id: Some(container_id),
        })
    }

    fn launch_command(
        &self,
        workspace: &Workspace,
        binary: &str,
        args: &[String],
    ) -> LaunchCommand {
        let container_id = workspace
            .container_id
            .as_deref()
            .unwrap_or("unprovisioned");
        let mut exec_args = vec![
            "exec".to_string(),
            "-i".to_string(),
            container_id.to_string(),
            binary.to_string(),
        ];
        exec_args.extend(args.iter().cloned());
        LaunchCommand {
            binary: "docker".to_string(),
            args: exec_args,
        }
    }

    async fn is_alive(&self, execution: &AgentExecution) -> bool {
        let Some(container_id) = execution.runtime_ref.as_deref() else {
            return false;
        };
        let output = Command::new("docker")
            .args(["inspect", "-f", "{{.State.Running}}", container_id])
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }

    async fn attach(&self, execution: &AgentExecution) -> Result<AgentIo> {
        let container_id = execution
            .runtime_ref
            .as_deref()
            .context("execution has no container id")?;

        // Attach through the Engine API so the stream keeps its log
        // framing; the CLI would demux it for a terminal instead.
        let url = format!(
            "http://localhost/v1.43/containers/{container_id}/attach?stream=1&stdin=1&stdout=1&stderr=1"
        );
        let mut child = Command::new("curl")
            .args([
                "--silent",
                "--no-buffer",
                "--unix-socket",
                &self.config.socket.to_string_lossy(),
                "-X",
                "POST",
                "-H",
                "Connection: Upgrade",
                "-H",
                "Upgrade: tcp",
                "--data-binary",
                "@-",
                "--output",
                "-",
                &url,
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .context("failed to spawn attach transport")?;

        let stdin = child.stdin.take().context("attach transport has no stdin")?;
        let stdout = child
            .stdout
            .take()
            .context("attach transport has no stdout")?;

        debug!(container_id = %container_id, "attached to container stream");

        // The transport child lives as long as its pipes do.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        Ok(AgentIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
        })
    }

    async fn teardown(&self, workspace: &Workspace) -> Result<()> {
        if let Some(container_id) = &workspace.container_id {
            let output = Command::new("docker")
                .args(["rm", "-f", container_id])
                .output()
                .await
                .context("failed to run docker rm")?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                if !stderr.contains("No such container") {
                    bail!("docker rm -f {container_id} failed: {stderr}");
                }
            }
        }
        Ok(())
    }
}
