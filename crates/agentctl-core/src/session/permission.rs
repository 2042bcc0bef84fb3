//! The permission broker: mediates `session/request_permission` between
//! agent and user.
//!
//! Every request receives exactly one terminal answer: the user's
//! selection, an auto-selection when no user-side handler is wired, or
//! `cancelled` on timeout. Double answers fail cleanly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::event::{Event, EventType, subjects};
use crate::protocol::{
    PermissionOption, PermissionOutcome, PermissionRequest, PermissionRequestHandler,
};

/// Hard ceiling on how long an agent waits for a human.
pub const DEFAULT_PERMISSION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Errors from answering permissions.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PermissionError {
    /// The single answer slot was already consumed.
    #[error("permission {0} was already answered")]
    AlreadyAnswered(String),

    /// No such pending entry (unknown id, or already timed out and
    /// removed).
    #[error("no pending permission {0}")]
    NotFound(String),
}

/// A user's decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PermissionDecision {
    Selected { option_id: String },
    Cancelled,
}

/// A request awaiting a user decision.
#[derive(Debug, Clone, Serialize)]
pub struct PendingPermission {
    pub id: String,
    pub instance_id: Uuid,
    pub task_id: Uuid,
    pub session_id: String,
    pub tool_call_id: Option<String>,
    pub title: String,
    pub options: Vec<PermissionOption>,
    pub created_at: DateTime<Utc>,
}

/// User-side delivery of a pending permission (typically a WebSocket
/// push). Absent in headless runs.
#[async_trait]
pub trait PermissionNotifier: Send + Sync {
    async fn notify(&self, pending: &PendingPermission);
}

struct PendingEntry {
    info: PendingPermission,
    /// Single answer slot; taken by the first responder.
    slot: Option<oneshot::Sender<PermissionDecision>>,
}

/// The broker. One per orchestrator process.
pub struct PermissionBroker {
    pending: Mutex<HashMap<String, PendingEntry>>,
    notifier: Option<Arc<dyn PermissionNotifier>>,
    /// Auto-select an allow option when no notifier is wired.
    auto_approve: bool,
    timeout: Duration,
    bus: EventBus,
}

impl PermissionBroker {
    pub fn new(
        bus: EventBus,
        notifier: Option<Arc<dyn PermissionNotifier>>,
        auto_approve: bool,
    ) -> Arc<Self> {
        Self::with_timeout(bus, notifier, auto_approve, DEFAULT_PERMISSION_TIMEOUT)
    }

    pub fn with_timeout(
        bus: EventBus,
        notifier: Option<Arc<dyn PermissionNotifier>>,
        auto_approve: bool,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(HashMap::new()),
            notifier,
            auto_approve,
            timeout,
            bus,
        })
    }

    /// Snapshot of pending permissions for one task.
    pub fn pending_for_task(&self, task_id: Uuid) -> Vec<PendingPermission> {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .values()
            .filter(|entry| entry.info.task_id == task_id)
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Total pending count.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending mutex poisoned").len()
    }

    /// Snapshot of every pending permission.
    pub fn pending_all(&self) -> Vec<PendingPermission> {
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .values()
            .map(|entry| entry.info.clone())
            .collect()
    }

    /// Deliver a user decision. Non-blocking.
    pub fn respond(
        &self,
        pending_id: &str,
        decision: PermissionDecision,
    ) -> Result<(), PermissionError> {
        let mut pending = self.pending.lock().expect("pending mutex poisoned");
        let entry = pending
            .get_mut(pending_id)
            .ok_or_else(|| PermissionError::NotFound(pending_id.to_string()))?;
        let slot = entry
            .slot
            .take()
            .ok_or_else(|| PermissionError::AlreadyAnswered(pending_id.to_string()))?;
        // A dropped receiver means the waiter timed out concurrently;
        // treat the answer as accepted, the waiter already sent
        // `cancelled`.
        let _ = slot.send(decision);
        Ok(())
    }

    /// Auto-selection when no user-side handler is wired: the first
    /// allow-kind option, else the first option.
    fn auto_select(options: &[PermissionOption]) -> PermissionOutcome {
        let chosen = options
            .iter()
            .find(|o| o.kind.is_allow())
            .or_else(|| options.first())
            .expect("caller checked options are non-empty");
        PermissionOutcome::Selected {
            option_id: chosen.option_id.clone(),
        }
    }
}

#[async_trait]
impl PermissionRequestHandler for PermissionBroker {
    async fn request_permission(&self, request: PermissionRequest) -> PermissionOutcome {
        // 1. Nothing to choose from: answer cancelled immediately.
        if request.options.is_empty() {
            debug!(task_id = %request.task_id, "permission request with zero options, cancelling");
            return PermissionOutcome::Cancelled;
        }

        // 2. Headless auto-approval.
        if self.notifier.is_none() && self.auto_approve {
            let outcome = Self::auto_select(&request.options);
            info!(
                task_id = %request.task_id,
                title = %request.title,
                outcome = ?outcome,
                "auto-selected permission option"
            );
            return outcome;
        }

        // 3. Record a pending entry and tell the user side.
        let pending_id = format!(
            "{}-{}",
            request.instance_id,
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let info = PendingPermission {
            id: pending_id.clone(),
            instance_id: request.instance_id,
            task_id: request.task_id,
            session_id: request.session_id.clone(),
            tool_call_id: request.tool_call_id.clone(),
            title: request.title.clone(),
            options: request.options.clone(),
            created_at: Utc::now(),
        };

        let (slot_tx, slot_rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .insert(
                pending_id.clone(),
                PendingEntry {
                    info: info.clone(),
                    slot: Some(slot_tx),
                },
            );

        self.bus.publish(Event::new(
            EventType::PermissionAsked,
            subjects::permission_request_received(&request.session_id),
            "agentctl-core",
            serde_json::json!({
                "pending_id": pending_id,
                "task_id": request.task_id.to_string(),
                "instance_id": request.instance_id.to_string(),
                "session_id": request.session_id,
                "tool_call_id": request.tool_call_id,
                "title": request.title,
                "options": request.options,
            }),
        ));

        if let Some(notifier) = &self.notifier {
            notifier.notify(&info).await;
        }

        // 4. One terminal answer: the user's decision or the timeout.
        let outcome = match tokio::time::timeout(self.timeout, slot_rx).await {
            Ok(Ok(PermissionDecision::Selected { option_id })) => {
                PermissionOutcome::Selected { option_id }
            }
            Ok(Ok(PermissionDecision::Cancelled)) => PermissionOutcome::Cancelled,
            Ok(Err(_recv_error)) => {
                // The slot sender vanished without an answer; only
                // happens if the broker is being torn down.
                PermissionOutcome::Cancelled
            }
            Err(_elapsed) => {
                warn!(
                    pending_id = %pending_id,
                    task_id = %request.task_id,
                    "permission request timed out, answering cancelled"
                );
                PermissionOutcome::Cancelled
            }
        };

        self.pending
            .lock()
            .expect("pending mutex poisoned")
            .remove(&pending_id);

        outcome
    }
}
