//! End-to-end: one task through the full engine against a fake ACP agent.
//!
//! The fake agent is a python script speaking newline-delimited JSON-RPC
//! on stdio. Expected event order for the happy path: `agent.started`,
//! `agent.ready`, at least one `acp.message.<taskId>` chunk, a prompt
//! completion with `end_turn`, and `agent.completed` with exit 0.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentctl_db::models::{ExecutionStatus, Task, TaskState};
use agentctl_db::queries::{executions, tasks as task_db};
use agentctl_test_utils::TestDb;

use agentctl_core::backend::{BackendMap, local::StandaloneBackend};
use agentctl_core::bus::EventBus;
use agentctl_core::event::{Event, EventType, subjects};
use agentctl_core::executor::{Executor, ExecutorConfig};
use agentctl_core::profile::{AgentProfile, ExecutorKind, ProfileRegistry};
use agentctl_core::protocol::AdapterKind;
use agentctl_core::scheduler::{Scheduler, SchedulerConfig};
use agentctl_core::session::SessionManager;
use agentctl_core::session::permission::PermissionBroker;
use agentctl_core::watcher::Watcher;

// ===========================================================================
// Test harness
// ===========================================================================

struct TestHarness {
    pool: PgPool,
    db: TestDb,
    bus: EventBus,
    scheduler: Arc<Scheduler>,
    watcher: Arc<Watcher>,
    cancel: CancellationToken,
    workspace_dir: tempfile::TempDir,
}

impl TestHarness {
    async fn new(profile: AgentProfile) -> Self {
        let harness = Self::with_config(
            profile,
            SchedulerConfig {
                process_interval: Duration::from_millis(100),
                retry_limit: 2,
                retry_delay: Duration::from_millis(100),
                queue_capacity: 64,
            },
            3,
        )
        .await;
        harness.start_scheduler();
        harness
    }

    async fn with_config(
        profile: AgentProfile,
        scheduler_config: SchedulerConfig,
        max_concurrent: usize,
    ) -> Self {
        let db = TestDb::new().await;
        let pool = db.pool_owned();
        let bus = EventBus::new();
        let workspace_dir = tempfile::TempDir::new().expect("workspace dir");

        let broker = PermissionBroker::new(bus.clone(), None, true);
        let sessions = SessionManager::new(bus.clone(), broker);

        let mut backends: BackendMap = HashMap::new();
        backends.insert(
            "standalone".to_string(),
            Arc::new(StandaloneBackend::new(workspace_dir.path().to_path_buf())),
        );

        let mut profiles = ProfileRegistry::new();
        profiles.register(profile);

        let executor = Executor::new(
            pool.clone(),
            bus.clone(),
            backends,
            profiles,
            sessions,
            ExecutorConfig {
                max_concurrent,
                graceful_stop_timeout: Duration::from_secs(2),
            },
        );
        let scheduler = Scheduler::new(pool.clone(), bus.clone(), executor, scheduler_config);
        let watcher = Watcher::new(pool.clone(), bus.clone(), Arc::clone(&scheduler));

        let cancel = CancellationToken::new();
        // The scheduler driver is started separately so tests can seed
        // the queue first.
        tokio::spawn(Arc::clone(&watcher).run(cancel.clone()));

        Self {
            pool,
            db,
            bus,
            scheduler,
            watcher,
            cancel,
            workspace_dir,
        }
    }

    fn start_scheduler(&self) {
        tokio::spawn(Arc::clone(&self.scheduler).run(self.cancel.clone()));
    }

    async fn insert_task(&self, title: &str, priority: i32) -> Task {
        task_db::insert_task(
            &self.pool,
            Uuid::new_v4(),
            Uuid::new_v4(),
            title,
            "say hello",
            priority,
            None,
            &[],
        )
        .await
        .expect("insert_task")
    }

    /// File the task the way the kanban collaborator would: publish its
    /// arrival in `todo`.
    fn file_task(&self, task: &Task) {
        self.bus.publish(Event::new(
            EventType::TaskStateChanged,
            subjects::TASK_STATE_CHANGED,
            "test",
            serde_json::json!({"task_id": task.id.to_string(), "to": "todo"}),
        ));
    }

    async fn wait_for_state(&self, task_id: Uuid, state: TaskState) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        loop {
            let task = task_db::get_task(&self.pool, task_id)
                .await
                .expect("get_task")
                .expect("task exists");
            if task.state == state {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} stuck in {:?}, expected {state:?}",
                task.state
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn teardown(self) {
        self.cancel.cancel();
        self.db.close().await;
        drop(self.workspace_dir);
    }
}

// ===========================================================================
// Fake agents
// ===========================================================================

const HAPPY_AGENT: &str = r#"
import sys, json

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    msg = json.loads(line)
    method = msg.get("method")
    msg_id = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {
            "protocolVersion": 1,
            "agentCapabilities": {"loadSession": True},
        }})
    elif method == "session/new":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"sessionId": "fake-sess-1"}})
    elif method == "session/prompt":
        sid = msg["params"]["sessionId"]
        send({"jsonrpc": "2.0", "method": "session/update", "params": {
            "sessionId": sid,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text", "text": "hello from the fake agent"},
            },
        }})
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"stopReason": "end_turn"}})
        break
sys.exit(0)
"#;

const PERMISSION_AGENT: &str = r#"
import sys, json

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

for line in sys.stdin:
    msg = json.loads(line)
    method = msg.get("method")
    msg_id = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"protocolVersion": 1}})
    elif method == "session/new":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"sessionId": "fake-sess-2"}})
    elif method == "session/prompt":
        sid = msg["params"]["sessionId"]
        send({"jsonrpc": "2.0", "id": 777, "method": "session/request_permission", "params": {
            "sessionId": sid,
            "toolCall": {"toolCallId": "tc-1", "title": "Run tests"},
            "options": [
                {"optionId": "a", "name": "Allow", "kind": "allow_once"},
                {"optionId": "b", "name": "Reject", "kind": "reject_once"},
            ],
        }})
        reply = json.loads(sys.stdin.readline())
        outcome = reply["result"]["outcome"]
        send({"jsonrpc": "2.0", "method": "session/update", "params": {
            "sessionId": sid,
            "update": {
                "sessionUpdate": "agent_message_chunk",
                "content": {"type": "text",
                            "text": "perm:%s:%s" % (outcome["outcome"], outcome.get("optionId", ""))},
            },
        }})
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"stopReason": "end_turn"}})
        break
sys.exit(0)
"#;

fn write_agent_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write agent script");
    path
}

fn acp_profile(script: &Path) -> AgentProfile {
    AgentProfile {
        id: "fake-acp".to_string(),
        name: "Fake ACP agent".to_string(),
        binary: "python3".to_string(),
        args: vec![script.to_string_lossy().into_owned()],
        model: None,
        protocol: AdapterKind::Acp,
        executor: ExecutorKind::Local,
        env: HashMap::new(),
        port: None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn happy_path_acp_prompt() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let script = write_agent_script(script_dir.path(), "agent.py", HAPPY_AGENT);
    let harness = TestHarness::new(acp_profile(&script)).await;

    let mut lifecycle = harness.bus.subscribe(subjects::AGENT_ALL);
    let mut messages = harness.bus.subscribe(subjects::ACP_MESSAGE_ALL);
    let mut completions = harness.bus.subscribe(subjects::PROMPT_COMPLETE_ALL);

    let task = harness.insert_task("hello task", 5).await;
    harness.file_task(&task);

    harness.wait_for_state(task.id, TaskState::Completed).await;

    // Lifecycle order: started, ready, acp_session_created interleaves,
    // completed last.
    let mut seen = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !seen.contains(&subjects::AGENT_COMPLETED.to_string()) {
        let event = tokio::time::timeout_at(deadline, lifecycle.recv())
            .await
            .expect("lifecycle events should arrive")
            .expect("bus alive");
        seen.push(event.subject.clone());
    }
    let started = seen.iter().position(|s| s == subjects::AGENT_STARTED);
    let ready = seen.iter().position(|s| s == subjects::AGENT_READY);
    let completed = seen.iter().position(|s| s == subjects::AGENT_COMPLETED);
    assert!(started.is_some(), "agent.started missing from {seen:?}");
    assert!(ready.is_some(), "agent.ready missing from {seen:?}");
    assert!(started < ready && ready < completed, "order was {seen:?}");

    // At least one message chunk on acp.message.<taskId>.
    let message = messages.recv().await.expect("message chunk");
    assert_eq!(message.subject, subjects::acp_message(task.id));
    assert_eq!(message.event_type, EventType::MessageChunk);
    assert_eq!(message.data["text"], "hello from the fake agent");

    // Turn completion with the agent's stop reason.
    let complete = completions.recv().await.expect("prompt completion");
    assert_eq!(complete.data["stop_reason"], "end_turn");
    assert_eq!(complete.data["is_error"], false);

    // The execution record carries the session id and a clean exit.
    let live = executions::list_live_executions(&harness.pool).await.unwrap();
    assert!(live.is_empty(), "no live executions should remain");
    let all: Vec<(Uuid,)> = sqlx::query_as("SELECT id FROM agent_executions WHERE task_id = $1")
        .bind(task.id)
        .fetch_all(&harness.pool)
        .await
        .unwrap();
    assert_eq!(all.len(), 1);
    let execution = executions::get_execution(&harness.pool, all[0].0)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(execution.status, ExecutionStatus::Completed);
    assert_eq!(execution.acp_session_id.as_deref(), Some("fake-sess-1"));
    assert_eq!(execution.exit_code, Some(0));

    harness.teardown().await;
}

#[tokio::test]
async fn permission_request_is_auto_approved_headless() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let script = write_agent_script(script_dir.path(), "perm_agent.py", PERMISSION_AGENT);
    let harness = TestHarness::new(acp_profile(&script)).await;

    let mut messages = harness.bus.subscribe(subjects::ACP_MESSAGE_ALL);

    let task = harness.insert_task("permission task", 5).await;
    harness.file_task(&task);

    harness.wait_for_state(task.id, TaskState::Completed).await;

    // The agent echoed the brokered outcome: headless auto-approve picks
    // the first allow option.
    let message = messages.recv().await.expect("message chunk");
    assert_eq!(message.data["text"], "perm:selected:a");

    harness.teardown().await;
}

#[tokio::test]
async fn queued_tasks_run_in_priority_order() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let script = write_agent_script(script_dir.path(), "agent.py", HAPPY_AGENT);
    // One at a time so completion order mirrors scheduling order.
    let harness = TestHarness::with_config(
        acp_profile(&script),
        SchedulerConfig {
            process_interval: Duration::from_millis(100),
            retry_limit: 2,
            retry_delay: Duration::from_millis(100),
            queue_capacity: 64,
        },
        1,
    )
    .await;

    let low = harness.insert_task("low", 1).await;
    let high = harness.insert_task("high", 10).await;
    let medium = harness.insert_task("medium", 5).await;

    // Seed the queue before the driver starts so dispatch order is a
    // pure function of priority.
    for task in [&low, &high, &medium] {
        harness.watcher.enqueue_task(task.id).await.unwrap();
    }
    let mut changes = harness.bus.subscribe(subjects::TASK_ALL);
    harness.start_scheduler();

    let mut order = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    while order.len() < 3 {
        let event = tokio::time::timeout_at(deadline, changes.recv())
            .await
            .expect("state changes should arrive")
            .expect("bus alive");
        if event.data["to"] == "in_progress" {
            order.push(event.task_id().unwrap());
        }
    }

    assert_eq!(
        order,
        vec![high.id, medium.id, low.id],
        "dispatch order must be priority desc"
    );

    for task in [&low, &high, &medium] {
        harness.wait_for_state(task.id, TaskState::Completed).await;
    }
    assert_eq!(harness.scheduler.queue_status().processed, 3);

    harness.teardown().await;
}
