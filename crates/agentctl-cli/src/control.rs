//! Control API: the operator-facing HTTP surface of the orchestrator
//! process. Health, queue status, pending permissions and their answers,
//! manual enqueue, and execution stop.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentctl_core::executor::Executor;
use agentctl_core::scheduler::Scheduler;
use agentctl_core::session::SessionManager;
use agentctl_core::session::permission::{PermissionDecision, PermissionError};
use agentctl_core::watcher::Watcher;
use agentctl_db::queries::executions;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// State & router
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ControlState {
    pub pool: PgPool,
    pub scheduler: Arc<Scheduler>,
    pub executor: Arc<Executor>,
    pub sessions: Arc<SessionManager>,
    pub watcher: Arc<Watcher>,
}

pub fn build_router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/status", get(status))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}/stop", post(stop_execution))
        .route("/api/permissions", get(list_permissions))
        .route("/api/permissions/{id}", post(respond_permission))
        .route("/api/tasks/{id}/enqueue", post(enqueue_task))
        .layer(tower_http::cors::CorsLayer::permissive())
        .with_state(state)
}

/// Serve the control API until the token is cancelled.
pub async fn serve(state: ControlState, port: u16, cancel: CancellationToken) -> Result<()> {
    let app = build_router(state);
    let addr: SocketAddr = format!("127.0.0.1:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("control API listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("control API shut down");
    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn status(State(state): State<ControlState>) -> impl IntoResponse {
    Json(state.scheduler.queue_status())
}

async fn list_executions(
    State(state): State<ControlState>,
) -> Result<axum::response::Response, AppError> {
    let executions = executions::list_live_executions(&state.pool)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(executions).into_response())
}

#[derive(Debug, Deserialize)]
struct StopParams {
    #[serde(default)]
    force: bool,
}

async fn stop_execution(
    State(state): State<ControlState>,
    Path(id): Path<Uuid>,
    Query(params): Query<StopParams>,
) -> Result<axum::response::Response, AppError> {
    state
        .executor
        .stop(id, params.force)
        .map_err(|e| AppError::not_found(format!("{e:#}")))?;
    Ok(StatusCode::ACCEPTED.into_response())
}

#[derive(Debug, Deserialize)]
struct PermissionsQuery {
    task_id: Option<Uuid>,
}

async fn list_permissions(
    State(state): State<ControlState>,
    Query(query): Query<PermissionsQuery>,
) -> impl IntoResponse {
    let broker = state.sessions.broker();
    let pending = match query.task_id {
        Some(task_id) => broker.pending_for_task(task_id),
        None => broker.pending_all(),
    };
    Json(pending)
}

#[derive(Debug, Deserialize)]
struct PermissionAnswer {
    #[serde(default)]
    option_id: Option<String>,
    #[serde(default)]
    cancel: bool,
}

async fn respond_permission(
    State(state): State<ControlState>,
    Path(id): Path<String>,
    Json(answer): Json<PermissionAnswer>,
) -> Result<axum::response::Response, AppError> {
    let decision = match (answer.option_id, answer.cancel) {
        (Some(option_id), false) => PermissionDecision::Selected { option_id },
        (None, true) => PermissionDecision::Cancelled,
        _ => {
            return Err(AppError::bad_request(
                "provide either option_id or cancel: true",
            ));
        }
    };

    match state.sessions.respond_to_permission(&id, decision) {
        Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
        Err(e @ PermissionError::NotFound(_)) => Err(AppError::not_found(e.to_string())),
        Err(e @ PermissionError::AlreadyAnswered(_)) => Err(AppError::conflict(e.to_string())),
    }
}

async fn enqueue_task(
    State(state): State<ControlState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    state
        .watcher
        .enqueue_task(id)
        .await
        .map_err(AppError::internal)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::collections::HashMap;
    use tower::ServiceExt;

    use agentctl_core::backend::BackendMap;
    use agentctl_core::bus::EventBus;
    use agentctl_core::executor::ExecutorConfig;
    use agentctl_core::profile::{AgentProfile, ExecutorKind, ProfileRegistry};
    use agentctl_core::protocol::AdapterKind;
    use agentctl_core::scheduler::SchedulerConfig;
    use agentctl_core::session::permission::PermissionBroker;
    use agentctl_db::models::TaskState;
    use agentctl_db::queries::tasks as task_db;
    use agentctl_test_utils::TestDb;

    async fn test_state() -> (ControlState, TestDb) {
        let db = TestDb::new().await;
        let pool = db.pool_owned();
        let bus = EventBus::new();
        let broker = PermissionBroker::new(bus.clone(), None, true);
        let sessions = SessionManager::new(bus.clone(), broker);

        let mut profiles = ProfileRegistry::new();
        profiles.register(AgentProfile {
            id: "default".to_string(),
            name: "Default".to_string(),
            binary: "mock-agent".to_string(),
            args: vec![],
            model: None,
            protocol: AdapterKind::Acp,
            executor: ExecutorKind::Local,
            env: HashMap::new(),
            port: None,
        });

        let executor = Executor::new(
            pool.clone(),
            bus.clone(),
            BackendMap::new(),
            profiles,
            Arc::clone(&sessions),
            ExecutorConfig::default(),
        );
        let scheduler = Scheduler::new(
            pool.clone(),
            bus.clone(),
            Arc::clone(&executor),
            SchedulerConfig::default(),
        );
        let watcher = Watcher::new(pool.clone(), bus, Arc::clone(&scheduler));

        (
            ControlState {
                pool,
                scheduler,
                executor,
                sessions,
                watcher,
            },
            db,
        )
    }

    async fn send(
        state: ControlState,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> axum::response::Response {
        let app = build_router(state);
        let request = match body {
            Some(body) => Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        };
        app.oneshot(request).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_is_ok() {
        let (state, db) = test_state().await;

        let response = send(state, "GET", "/health", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");

        db.close().await;
    }

    #[tokio::test]
    async fn status_reports_queue_counters() {
        let (state, db) = test_state().await;

        let response = send(state, "GET", "/api/status", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["queued"], 0);
        assert_eq!(json["active"], 0);
        assert_eq!(json["processed"], 0);

        db.close().await;
    }

    #[tokio::test]
    async fn permissions_list_is_empty_initially() {
        let (state, db) = test_state().await;

        let response = send(state, "GET", "/api/permissions", None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, serde_json::json!([]));

        db.close().await;
    }

    #[tokio::test]
    async fn answering_unknown_permission_is_404() {
        let (state, db) = test_state().await;

        let response = send(
            state,
            "POST",
            "/api/permissions/nope",
            Some(serde_json::json!({"cancel": true})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        db.close().await;
    }

    #[tokio::test]
    async fn permission_answer_requires_a_decision() {
        let (state, db) = test_state().await;

        let response = send(
            state,
            "POST",
            "/api/permissions/x",
            Some(serde_json::json!({})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        db.close().await;
    }

    #[tokio::test]
    async fn enqueue_moves_a_task_into_scheduling() {
        let (state, db) = test_state().await;

        let task = task_db::insert_task(
            db.pool(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            "from the api",
            "",
            5,
            None,
            &[],
        )
        .await
        .unwrap();

        let response = send(
            state,
            "POST",
            &format!("/api/tasks/{}/enqueue", task.id),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let refreshed = task_db::get_task(db.pool(), task.id).await.unwrap().unwrap();
        assert_eq!(refreshed.state, TaskState::Scheduling);

        db.close().await;
    }

    #[tokio::test]
    async fn stopping_unknown_execution_is_404() {
        let (state, db) = test_state().await;

        let response = send(
            state,
            "POST",
            &format!("/api/executions/{}/stop", Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        db.close().await;
    }
}
