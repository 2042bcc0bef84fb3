//! Scheduler/executor behaviour under failure: retry then succeed, retry
//! exhaustion, and the concurrency cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentctl_db::models::{Task, TaskState};
use agentctl_db::queries::tasks as task_db;
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
    executor: Arc<Executor>,
    cancel: CancellationToken,
    workspace_dir: tempfile::TempDir,
}

impl TestHarness {
    async fn new(profile: AgentProfile, retry_limit: u32, max_concurrent: usize) -> Self {
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
        let scheduler = Scheduler::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&executor),
            SchedulerConfig {
                process_interval: Duration::from_millis(100),
                retry_limit,
                retry_delay: Duration::from_millis(100),
                queue_capacity: 64,
            },
        );
        let watcher = Watcher::new(pool.clone(), bus.clone(), Arc::clone(&scheduler));

        let cancel = CancellationToken::new();
        tokio::spawn(Arc::clone(&scheduler).run(cancel.clone()));
        tokio::spawn(watcher.run(cancel.clone()));

        Self {
            pool,
            db,
            bus,
            executor,
            cancel,
            workspace_dir,
        }
    }

    async fn insert_task(&self, title: &str) -> Task {
        task_db::insert_task(
            &self.pool,
            Uuid::new_v4(),
            Uuid::new_v4(),
            title,
            "do the work",
            5,
            None,
            &[],
        )
        .await
        .expect("insert_task")
    }

    fn file_task(&self, task: &Task) {
        self.bus.publish(Event::new(
            EventType::TaskStateChanged,
            subjects::TASK_STATE_CHANGED,
            "test",
            serde_json::json!({"task_id": task.id.to_string(), "to": "todo"}),
        ));
    }

    async fn wait_for_terminal(&self, task_id: Uuid) -> TaskState {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        loop {
            let task = task_db::get_task(&self.pool, task_id)
                .await
                .expect("get_task")
                .expect("task exists");
            if task.state.is_terminal() {
                return task.state;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} never reached a terminal state (stuck in {:?})",
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
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"protocolVersion": 1}})
    elif method == "session/new":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"sessionId": "sess-ok"}})
    elif method == "session/prompt":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"stopReason": "end_turn"}})
        break
sys.exit(0)
"#;

/// An agent that blocks on a marker file before finishing its turn, used
/// to hold executions open for the concurrency cap test.
const SLOW_AGENT: &str = r#"
import sys, json, os, time

def send(obj):
    sys.stdout.write(json.dumps(obj) + "\n")
    sys.stdout.flush()

release = os.environ["RELEASE_FILE"]
for line in sys.stdin:
    msg = json.loads(line)
    method = msg.get("method")
    msg_id = msg.get("id")
    if method == "initialize":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"protocolVersion": 1}})
    elif method == "session/new":
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"sessionId": "sess-slow-%d" % os.getpid()}})
    elif method == "session/prompt":
        while not os.path.exists(release):
            time.sleep(0.05)
        send({"jsonrpc": "2.0", "id": msg_id, "result": {"stopReason": "end_turn"}})
        break
sys.exit(0)
"#;

/// Wrapper that fails (exit 1) until the counter file reaches the
/// threshold, then execs the real agent.
fn write_flaky_wrapper(dir: &Path, fail_times: u32, agent: &Path) -> PathBuf {
    let count_file = dir.join("attempts");
    let wrapper = dir.join("flaky.sh");
    std::fs::write(
        &wrapper,
        format!(
            "#!/bin/sh\n\
             N=$(cat {count} 2>/dev/null || echo 0)\n\
             N=$((N+1))\n\
             echo $N > {count}\n\
             if [ $N -le {fail_times} ]; then\n\
             \texit 1\n\
             fi\n\
             exec python3 {agent}\n",
            count = count_file.display(),
            fail_times = fail_times,
            agent = agent.display(),
        ),
    )
    .unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&wrapper, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    wrapper
}

fn write_agent_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

fn profile_for(binary: &str, args: Vec<String>, env: HashMap<String, String>) -> AgentProfile {
    AgentProfile {
        id: "flaky".to_string(),
        name: "Flaky agent".to_string(),
        binary: binary.to_string(),
        args,
        model: None,
        protocol: AdapterKind::Acp,
        executor: ExecutorKind::Local,
        env,
        port: None,
    }
}

fn attempts(dir: &Path) -> u32 {
    std::fs::read_to_string(dir.join("attempts"))
        .map(|s| s.trim().parse().unwrap_or(0))
        .unwrap_or(0)
}

// ===========================================================================
// Tests
// ===========================================================================

#[tokio::test]
async fn task_retries_then_completes() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let agent = write_agent_script(script_dir.path(), "agent.py", HAPPY_AGENT);
    let wrapper = write_flaky_wrapper(script_dir.path(), 2, &agent);

    let profile = profile_for(&wrapper.to_string_lossy(), vec![], HashMap::new());
    let harness = TestHarness::new(profile, 2, 3).await;

    let task = harness.insert_task("retry-then-pass").await;
    harness.file_task(&task);

    let state = harness.wait_for_terminal(task.id).await;
    assert_eq!(state, TaskState::Completed, "third attempt should succeed");
    assert_eq!(attempts(script_dir.path()), 3, "expected exactly 3 starts");

    harness.teardown().await;
}

#[tokio::test]
async fn task_fails_after_retry_exhaustion() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let agent = write_agent_script(script_dir.path(), "agent.py", HAPPY_AGENT);
    // Fails far more times than the retry budget allows.
    let wrapper = write_flaky_wrapper(script_dir.path(), 99, &agent);

    let profile = profile_for(&wrapper.to_string_lossy(), vec![], HashMap::new());
    let harness = TestHarness::new(profile, 2, 3).await;

    let task = harness.insert_task("always-failing").await;
    harness.file_task(&task);

    let state = harness.wait_for_terminal(task.id).await;
    assert_eq!(state, TaskState::Failed);
    assert_eq!(
        attempts(script_dir.path()),
        3,
        "initial attempt plus exactly 2 retries"
    );

    harness.teardown().await;
}

#[tokio::test]
async fn missing_binary_fails_without_retries() {
    let profile = profile_for("definitely-not-a-real-binary-xyz", vec![], HashMap::new());
    let harness = TestHarness::new(profile, 2, 3).await;

    let mut failures = harness.bus.subscribe(subjects::AGENT_FAILED);

    let task = harness.insert_task("misconfigured").await;
    harness.file_task(&task);

    let state = harness.wait_for_terminal(task.id).await;
    assert_eq!(state, TaskState::Failed);

    // Configuration failures are not retried: exactly one agent.failed.
    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.data["kind"], "configuration");
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        failures.rx.try_recv().is_err(),
        "no further failure events expected"
    );

    harness.teardown().await;
}

#[tokio::test]
async fn concurrency_cap_holds_under_load() {
    let script_dir = tempfile::TempDir::new().unwrap();
    let agent = write_agent_script(script_dir.path(), "slow_agent.py", SLOW_AGENT);
    let release_file = script_dir.path().join("release");

    let mut env = HashMap::new();
    env.insert(
        "RELEASE_FILE".to_string(),
        release_file.to_string_lossy().into_owned(),
    );
    let profile = profile_for("python3", vec![agent.to_string_lossy().into_owned()], env);

    const CAP: usize = 2;
    let harness = TestHarness::new(profile, 0, CAP).await;

    let mut tasks = Vec::new();
    for n in 0..5 {
        let task = harness.insert_task(&format!("parallel-{n}")).await;
        harness.file_task(&task);
        tasks.push(task);
    }

    // While agents are held open, the active set must never exceed the
    // cap.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        assert!(
            harness.executor.active_count() <= CAP,
            "active executions exceeded the cap"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // Release the agents; everything should finish.
    std::fs::write(&release_file, "go").unwrap();
    for task in &tasks {
        let state = harness.wait_for_terminal(task.id).await;
        assert_eq!(state, TaskState::Completed);
    }

    harness.teardown().await;
}
