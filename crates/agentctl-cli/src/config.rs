//! Configuration file handling and resolution.
//!
//! The config file lives at `~/.config/agentctl/config.toml` and carries
//! the database URL, orchestrator tuning, and the agent profile registry
//! (the settings collaborator's surface, consumed here).
//!
//! Resolution priority for the database URL: CLI flag, then
//! `AGENTCTL_DATABASE_URL`, then the config file, then the built-in
//! default.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use agentctl_core::executor::ExecutorConfig;
use agentctl_core::profile::{AgentProfile, ExecutorKind, ProfileRegistry};
use agentctl_core::protocol::AdapterKind;
use agentctl_core::scheduler::SchedulerConfig;
use agentctl_db::config::DbConfig;

/// Environment variable governing the default permission handler when no
/// user-side notifier is wired.
pub const AUTO_APPROVE_ENV: &str = "AGENTCTL_AUTO_APPROVE_PERMISSIONS";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,
    #[serde(default = "default_process_interval_secs")]
    pub process_interval_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Root for standalone task workspaces.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    /// Profile used when a task names none.
    #[serde(default)]
    pub default_profile: Option<String>,
}

fn default_max_concurrent() -> usize {
    3
}
fn default_retry_limit() -> u32 {
    2
}
fn default_retry_delay_secs() -> u64 {
    10
}
fn default_process_interval_secs() -> u64 {
    5
}
fn default_queue_capacity() -> usize {
    256
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retry_limit: default_retry_limit(),
            retry_delay_secs: default_retry_delay_secs(),
            process_interval_secs: default_process_interval_secs(),
            queue_capacity: default_queue_capacity(),
            workspace_root: None,
            default_profile: None,
        }
    }
}

/// One `[profiles.<id>]` block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSection {
    pub name: String,
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub protocol: AdapterKind,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    pub database: DatabaseSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileSection>,
}

/// Path of the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agentctl")
        .join("config.toml")
}

pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config at {}", path.display()))
}

pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let text = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, text)
        .with_context(|| format!("failed to write config at {}", path.display()))?;
    Ok(())
}

/// Everything the run command needs, resolved from flags, env and file.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub db_config: DbConfig,
    pub orchestrator: OrchestratorSection,
    pub profiles: HashMap<String, ProfileSection>,
}

impl ResolvedConfig {
    pub fn resolve(cli_db_url: Option<&str>) -> Result<Self> {
        let file = load_config().ok();

        let db_config = if let Some(url) = cli_db_url {
            DbConfig::parse(url).context("invalid --database-url")?
        } else if let Ok(url) = std::env::var(DbConfig::ENV_VAR) {
            DbConfig::parse(&url)
                .with_context(|| format!("invalid {} value", DbConfig::ENV_VAR))?
        } else if let Some(file) = &file {
            DbConfig::parse(&file.database.url).with_context(|| {
                format!("invalid database.url in {}", config_path().display())
            })?
        } else {
            DbConfig::default_local()
        };

        Ok(Self {
            db_config,
            orchestrator: file
                .as_ref()
                .map(|f| f.orchestrator.clone())
                .unwrap_or_default(),
            profiles: file.map(|f| f.profiles).unwrap_or_default(),
        })
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            process_interval: Duration::from_secs(self.orchestrator.process_interval_secs),
            retry_limit: self.orchestrator.retry_limit,
            retry_delay: Duration::from_secs(self.orchestrator.retry_delay_secs),
            queue_capacity: self.orchestrator.queue_capacity,
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrent: self.orchestrator.max_concurrent,
            ..ExecutorConfig::default()
        }
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.orchestrator.workspace_root.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("agentctl")
                .join("workspaces")
        })
    }

    pub fn profile_registry(&self) -> Result<ProfileRegistry> {
        let mut registry = ProfileRegistry::new();
        // Stable order so the implicit default is deterministic.
        let mut ids: Vec<&String> = self.profiles.keys().collect();
        ids.sort();
        for id in ids {
            let section = &self.profiles[id];
            registry.register(AgentProfile {
                id: id.clone(),
                name: section.name.clone(),
                binary: section.binary.clone(),
                args: section.args.clone(),
                model: section.model.clone(),
                protocol: section.protocol,
                executor: section.executor,
                env: section.env.clone(),
                port: section.port,
            });
        }
        if let Some(default) = &self.orchestrator.default_profile {
            registry.set_default(default)?;
        }
        Ok(registry)
    }
}

/// Whether headless permission requests are auto-approved.
pub fn auto_approve_permissions() -> bool {
    std::env::var(AUTO_APPROVE_ENV)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(false)
}
