//! Standalone backend: agents run as host processes in plain directory
//! workspaces.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use agentctl_db::models::{AgentExecution, Task};

use super::{Backend, LaunchCommand, Workspace};
use crate::protocol::AgentIo;

/// Host-process backend. Workspaces are per-task directories under a
/// configured root.
#[derive(Debug)]
pub struct StandaloneBackend {
    workspace_root: PathBuf,
}

impl StandaloneBackend {
    pub fn new(workspace_root: PathBuf) -> Self {
        Self { workspace_root }
    }
}

#[async_trait]
impl Backend for StandaloneBackend {
    fn name(&self) -> &str {
        "standalone"
    }

    async fn provision(&self, task: &Task) -> Result<Workspace> {
        let path = self.workspace_root.join(format!("task-{}", task.id));
        tokio::fs::create_dir_all(&path)
            .await
            .with_context(|| format!("failed to create workspace at {}", path.display()))?;
        Ok(Workspace {
            path,
            host_path: None,
            container_id: None,
        })
    }

    fn launch_command(
        &self,
        _workspace: &Workspace,
        binary: &str,
        args: &[String],
    ) -> LaunchCommand {
        LaunchCommand {
            binary: binary.to_string(),
            args: args.to_vec(),
        }
    }

    async fn is_alive(&self, execution: &AgentExecution) -> bool {
        let Some(pid) = execution
            .runtime_ref
            .as_deref()
            .and_then(|r| r.parse::<i32>().ok())
        else {
            return false;
        };

        #[cfg(unix)]
        {
            // Signal 0 probes for existence without delivering anything.
            // SAFETY: plain existence probe.
            unsafe { libc::kill(pid, 0) == 0 }
        }
        #[cfg(not(unix))]
        {
            let _ = pid;
            false
        }
    }

    async fn attach(&self, _execution: &AgentExecution) -> Result<AgentIo> {
        // Host children die with the orchestrator (parent-death signal),
        // and their pipes die with them.
        bail!("standalone executions cannot be reattached")
    }

    async fn teardown(&self, workspace: &Workspace) -> Result<()> {
        tokio::fs::remove_dir_all(&workspace.path)
            .await
            .with_context(|| {
                format!("failed to remove workspace at {}", workspace.path.display())
            })?;
        Ok(())
    }
}
