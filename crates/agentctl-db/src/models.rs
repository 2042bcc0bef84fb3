use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Kanban state of a task.
///
/// `TODO -> SCHEDULING -> IN_PROGRESS` is the only automatic path; the
/// terminal states (`COMPLETED`, `FAILED`, `CANCELLED`) are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Todo,
    Scheduling,
    InProgress,
    WaitingForInput,
    Review,
    Blocked,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// Whether this state is absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Todo => "todo",
            Self::Scheduling => "scheduling",
            Self::InProgress => "in_progress",
            Self::WaitingForInput => "waiting_for_input",
            Self::Review => "review",
            Self::Blocked => "blocked",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "todo" => Ok(Self::Todo),
            "scheduling" => Ok(Self::Scheduling),
            "in_progress" => Ok(Self::InProgress),
            "waiting_for_input" => Ok(Self::WaitingForInput),
            "review" => Ok(Self::Review),
            "blocked" => Ok(Self::Blocked),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

// ---------------------------------------------------------------------------

/// Status of one agent execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Starting,
    Running,
    Ready,
    Completed,
    Failed,
    Stopped,
}

impl ExecutionStatus {
    /// Whether this status is terminal. At most one execution per task may
    /// be non-terminal at any time.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Ready => "ready",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

impl FromStr for ExecutionStatus {
    type Err = ExecutionStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "ready" => Ok(Self::Ready),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "stopped" => Ok(Self::Stopped),
            other => Err(ExecutionStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`ExecutionStatus`] string.
#[derive(Debug, Clone)]
pub struct ExecutionStatusParseError(pub String);

impl fmt::Display for ExecutionStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid execution status: {:?}", self.0)
    }
}

impl std::error::Error for ExecutionStatusParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A repository a task operates on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRepository {
    pub id: Uuid,
    pub base_branch: String,
}

/// A task filed on a board.
///
/// Created by the user; mutated only by the watcher in response to
/// lifecycle events.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub board_id: Uuid,
    pub title: String,
    pub description: String,
    /// Scheduling priority, 0..10 (higher first).
    pub priority: i32,
    pub state: TaskState,
    /// Agent profile to run this task with; `None` selects the default.
    pub profile_id: Option<String>,
    pub repositories: sqlx::types::Json<Vec<TaskRepository>>,
    pub metadata: sqlx::types::Json<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One live attempt at running an agent for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AgentExecution {
    pub id: Uuid,
    pub task_id: Uuid,
    pub profile_id: String,
    /// Backend name: `standalone | docker | local | remote_docker | sprites`.
    pub backend: String,
    /// Container id or host pid, depending on the backend.
    pub runtime_ref: Option<String>,
    /// ACP session id, set once the agent answers `session/new`.
    pub acp_session_id: Option<String>,
    pub workspace_path: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_state_display_roundtrip() {
        let variants = [
            TaskState::Todo,
            TaskState::Scheduling,
            TaskState::InProgress,
            TaskState::WaitingForInput,
            TaskState::Review,
            TaskState::Blocked,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Cancelled,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: TaskState = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn task_state_invalid() {
        let result = "bogus".parse::<TaskState>();
        assert!(result.is_err());
    }

    #[test]
    fn task_state_terminal() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Todo.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
    }

    #[test]
    fn execution_status_display_roundtrip() {
        let variants = [
            ExecutionStatus::Pending,
            ExecutionStatus::Starting,
            ExecutionStatus::Running,
            ExecutionStatus::Ready,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Stopped,
        ];
        for v in &variants {
            let s = v.to_string();
            let parsed: ExecutionStatus = s.parse().expect("should parse");
            assert_eq!(*v, parsed);
        }
    }

    #[test]
    fn execution_status_invalid() {
        let result = "warming_up".parse::<ExecutionStatus>();
        assert!(result.is_err());
    }

    #[test]
    fn execution_status_terminal() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Stopped.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(!ExecutionStatus::Ready.is_terminal());
    }

    #[test]
    fn task_repository_serde_roundtrip() {
        let repo = TaskRepository {
            id: Uuid::new_v4(),
            base_branch: "main".to_string(),
        };
        let json = serde_json::to_string(&repo).unwrap();
        let back: TaskRepository = serde_json::from_str(&json).unwrap();
        assert_eq!(repo, back);
    }
}
