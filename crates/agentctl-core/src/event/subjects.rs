//! Subject names published and consumed by the engine.
//!
//! Subjects are hierarchical, dot-separated, and match against NATS-style
//! patterns (`*` one token, `>` the remaining tail).

use uuid::Uuid;

pub const AGENT_STARTED: &str = "agent.started";
pub const AGENT_READY: &str = "agent.ready";
pub const AGENT_COMPLETED: &str = "agent.completed";
pub const AGENT_FAILED: &str = "agent.failed";
pub const AGENT_STOPPED: &str = "agent.stopped";
pub const AGENT_SESSION_CREATED: &str = "agent.acp_session_created";

pub const TASK_STATE_CHANGED: &str = "task.state_changed";

/// Wildcards the watcher subscribes with.
pub const AGENT_ALL: &str = "agent.>";
pub const TASK_ALL: &str = "task.>";
pub const ACP_MESSAGE_ALL: &str = "acp.message.>";
pub const PERMISSION_ALL: &str = "permission_request.>";
pub const TOOL_CALL_ALL: &str = "tool_call.>";
pub const PROMPT_COMPLETE_ALL: &str = "prompt.complete.>";
pub const GIT_STATUS_ALL: &str = "git.status.>";

pub fn acp_message(task_id: Uuid) -> String {
    format!("acp.message.{task_id}")
}

pub fn prompt_complete(session_id: &str) -> String {
    format!("prompt.complete.{session_id}")
}

pub fn tool_call_started(session_id: &str) -> String {
    format!("tool_call.started.{session_id}")
}

pub fn tool_call_complete(session_id: &str) -> String {
    format!("tool_call.complete.{session_id}")
}

pub fn permission_request_received(session_id: &str) -> String {
    format!("permission_request.received.{session_id}")
}

pub fn git_status_updated(session_id: &str) -> String {
    format!("git.status.updated.{session_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_builders() {
        let id = Uuid::nil();
        assert_eq!(
            acp_message(id),
            "acp.message.00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(prompt_complete("s1"), "prompt.complete.s1");
        assert_eq!(tool_call_started("s1"), "tool_call.started.s1");
        assert_eq!(tool_call_complete("s1"), "tool_call.complete.s1");
        assert_eq!(
            permission_request_received("s1"),
            "permission_request.received.s1"
        );
        assert_eq!(git_status_updated("s1"), "git.status.updated.s1");
    }
}
