//! Agent profiles -- which CLI to run, how to talk to it, and where.
//!
//! Profiles come from the settings collaborator (a `[profiles.*]` section
//! of the config file); the engine only resolves and consumes them.

use std::collections::HashMap;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::protocol::AdapterKind;

/// Where an agent executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    Local,
    Worktree,
    LocalDocker,
    RemoteDocker,
    Sprites,
}

impl ExecutorKind {
    /// Map an executor kind to the backend driver that serves it.
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Local | Self::Worktree => "standalone",
            Self::LocalDocker => "docker",
            Self::RemoteDocker => "remote_docker",
            Self::Sprites => "sprites",
        }
    }
}

/// A configured agent: binary, protocol dialect, and execution placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub name: String,
    /// Binary name or path; resolved by the launcher.
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    pub protocol: AdapterKind,
    pub executor: ExecutorKind,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// TCP port for server-style agents; `None` for pure-stdio agents.
    #[serde(default)]
    pub port: Option<u16>,
}

impl AgentProfile {
    /// Build the full command line: configured args plus the model flag.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = self.args.clone();
        if let Some(model) = &self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args
    }
}

/// Profiles keyed by id, with an optional default.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, AgentProfile>,
    default_id: Option<String>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a profile. The first registered profile becomes the
    /// default unless one is set explicitly.
    pub fn register(&mut self, profile: AgentProfile) {
        if self.default_id.is_none() {
            self.default_id = Some(profile.id.clone());
        }
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn set_default(&mut self, id: &str) -> Result<()> {
        if !self.profiles.contains_key(id) {
            bail!("unknown profile id: {id}");
        }
        self.default_id = Some(id.to_string());
        Ok(())
    }

    /// Resolve a profile by id, falling back to the default when `None`.
    pub fn resolve(&self, id: Option<&str>) -> Result<&AgentProfile> {
        match id {
            Some(id) => self
                .profiles
                .get(id)
                .ok_or_else(|| anyhow::anyhow!("unknown profile id: {id}")),
            None => {
                let default = self
                    .default_id
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("no profiles registered"))?;
                Ok(&self.profiles[default])
            }
        }
    }

    pub fn list(&self) -> Vec<&AgentProfile> {
        self.profiles.values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> AgentProfile {
        AgentProfile {
            id: id.to_string(),
            name: id.to_string(),
            binary: "mock-agent".to_string(),
            args: vec!["--acp".to_string()],
            model: None,
            protocol: AdapterKind::Acp,
            executor: ExecutorKind::Local,
            env: HashMap::new(),
            port: None,
        }
    }

    #[test]
    fn executor_backend_mapping() {
        assert_eq!(ExecutorKind::Local.backend_name(), "standalone");
        assert_eq!(ExecutorKind::Worktree.backend_name(), "standalone");
        assert_eq!(ExecutorKind::LocalDocker.backend_name(), "docker");
        assert_eq!(ExecutorKind::RemoteDocker.backend_name(), "remote_docker");
        assert_eq!(ExecutorKind::Sprites.backend_name(), "sprites");
    }

    #[test]
    fn first_registered_is_default() {
        let mut registry = ProfileRegistry::new();
        registry.register(profile("claude"));
        registry.register(profile("gemini"));

        assert_eq!(registry.resolve(None).unwrap().id, "claude");
        assert_eq!(registry.resolve(Some("gemini")).unwrap().id, "gemini");
    }

    #[test]
    fn set_default_overrides() {
        let mut registry = ProfileRegistry::new();
        registry.register(profile("claude"));
        registry.register(profile("gemini"));
        registry.set_default("gemini").unwrap();

        assert_eq!(registry.resolve(None).unwrap().id, "gemini");
    }

    #[test]
    fn unknown_profile_fails() {
        let mut registry = ProfileRegistry::new();
        registry.register(profile("claude"));

        assert!(registry.resolve(Some("nope")).is_err());
        assert!(registry.set_default("nope").is_err());
    }

    #[test]
    fn empty_registry_has_no_default() {
        let registry = ProfileRegistry::new();
        assert!(registry.resolve(None).is_err());
    }

    #[test]
    fn command_args_appends_model() {
        let mut p = profile("claude");
        p.model = Some("opus".to_string());
        assert_eq!(p.command_args(), vec!["--acp", "--model", "opus"]);
    }

    #[test]
    fn profile_serde_roundtrip() {
        let p = profile("claude");
        let json = serde_json::to_string(&p).unwrap();
        let back: AgentProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "claude");
        assert_eq!(back.protocol, AdapterKind::Acp);
        assert_eq!(back.executor, ExecutorKind::Local);
    }
}
