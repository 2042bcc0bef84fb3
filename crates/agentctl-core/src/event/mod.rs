//! The normalised event envelope and the pub/sub subject vocabulary.
//!
//! Every native agent protocol is translated into these events before it
//! reaches the bus. Every event carries its task id either directly in the
//! payload or via its subject; events with neither are dropped by the
//! watcher with a warning.

pub mod subjects;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Unified event vocabulary.
///
/// The first eleven variants are the normalised agent-update vocabulary;
/// `task_state_changed`, `agent_lifecycle` and `git_status_updated` cover
/// the `task.*`, `agent.*` and `git.*` subjects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MessageChunk,
    Reasoning,
    ToolCall,
    ToolCallUpdate,
    Plan,
    SessionStart,
    SessionIdle,
    SessionError,
    PermissionAsked,
    Complete,
    Error,
    TaskStateChanged,
    AgentLifecycle,
    GitStatusUpdated,
}

/// Envelope published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub subject: String,
    pub source: String,
    pub time: DateTime<Utc>,
    pub data: Value,
}

impl Event {
    /// Build an event with a fresh id and the current timestamp.
    pub fn new(
        event_type: EventType,
        subject: impl Into<String>,
        source: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            subject: subject.into(),
            source: source.into(),
            time: Utc::now(),
            data,
        }
    }

    /// Build the `task.state_changed` event for a transition.
    pub fn task_state_changed(
        task_id: Uuid,
        from: agentctl_db::models::TaskState,
        to: agentctl_db::models::TaskState,
    ) -> Self {
        Self::new(
            EventType::TaskStateChanged,
            subjects::TASK_STATE_CHANGED,
            "agentctl-core",
            serde_json::json!({
                "task_id": task_id.to_string(),
                "from": from.to_string(),
                "to": to.to_string(),
            }),
        )
    }

    /// Extract the task id, either from the payload (`task_id`) or from
    /// the trailing token of a `task.`/`acp.message.` style subject.
    pub fn task_id(&self) -> Option<Uuid> {
        if let Some(id) = self.data.get("task_id").and_then(|v| v.as_str()) {
            if let Ok(id) = Uuid::parse_str(id) {
                return Some(id);
            }
        }
        self.subject
            .rsplit('.')
            .next()
            .and_then(|tail| Uuid::parse_str(tail).ok())
    }
}
