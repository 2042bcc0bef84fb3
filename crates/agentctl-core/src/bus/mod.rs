//! In-process pub/sub with NATS-style subjects.
//!
//! Two subscription modes:
//! - **broadcast**: every subscriber whose pattern matches receives the
//!   event;
//! - **queue group**: among subscribers sharing a `(group, pattern)` pair,
//!   exactly one receives each event (round-robin), used to partition work
//!   across orchestrator instances.
//!
//! Publication per subject preserves producer-local order; cross-subject
//! order is not guaranteed. Closed subscribers are pruned on the next
//! publish to their pattern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use crate::event::Event;

/// Match a dot-separated subject against a pattern.
///
/// `*` matches exactly one token; `>` matches one or more trailing tokens.
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');

    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(s)) if p == s => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct SubEntry {
    id: u64,
    pattern: String,
    group: Option<String>,
    tx: mpsc::UnboundedSender<Event>,
}

#[derive(Default)]
struct BusInner {
    subs: Vec<SubEntry>,
    /// Round-robin cursor per queue group name.
    cursors: HashMap<String, usize>,
}

/// Handle to a subscription. Dropping it unsubscribes (lazily).
pub struct Subscription {
    pub rx: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    /// Receive the next event, or `None` once the bus is dropped.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Consume the subscription as a `Stream` of events.
    pub fn into_stream(self) -> tokio_stream::wrappers::UnboundedReceiverStream<Event> {
        tokio_stream::wrappers::UnboundedReceiverStream::new(self.rx)
    }
}

/// The in-process event bus. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner::default())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Broadcast subscription: every matching event is delivered.
    pub fn subscribe(&self, pattern: &str) -> Subscription {
        self.add(pattern, None)
    }

    /// Queue-group subscription: each matching event is delivered to one
    /// member of the named group.
    pub fn queue_subscribe(&self, pattern: &str, group: &str) -> Subscription {
        self.add(pattern, Some(group.to_string()))
    }

    fn add(&self, pattern: &str, group: Option<String>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().expect("bus mutex poisoned");
        inner.subs.push(SubEntry {
            id,
            pattern: pattern.to_string(),
            group,
            tx,
        });
        Subscription { rx }
    }

    /// Publish an event to all matching subscribers.
    pub fn publish(&self, event: Event) {
        let mut inner = self.inner.lock().expect("bus mutex poisoned");

        trace!(subject = %event.subject, event_type = ?event.event_type, "publish");

        // Broadcast deliveries, collecting dead subscriber ids.
        let mut dead: Vec<u64> = Vec::new();
        for sub in inner
            .subs
            .iter()
            .filter(|s| s.group.is_none() && subject_matches(&s.pattern, &event.subject))
        {
            if sub.tx.send(event.clone()).is_err() {
                dead.push(sub.id);
            }
        }

        // Queue-group deliveries: one member per group, round-robin.
        let groups: Vec<String> = {
            let mut names: Vec<String> = inner
                .subs
                .iter()
                .filter(|s| {
                    s.group.is_some() && subject_matches(&s.pattern, &event.subject)
                })
                .filter_map(|s| s.group.clone())
                .collect();
            names.sort();
            names.dedup();
            names
        };

        for group in groups {
            let member_ids: Vec<u64> = inner
                .subs
                .iter()
                .filter(|s| {
                    s.group.as_deref() == Some(group.as_str())
                        && subject_matches(&s.pattern, &event.subject)
                })
                .map(|s| s.id)
                .collect();
            if member_ids.is_empty() {
                continue;
            }

            let cursor = inner.cursors.entry(group.clone()).or_insert(0);
            let start = *cursor;
            let mut delivered = false;
            for offset in 0..member_ids.len() {
                let idx = (start + offset) % member_ids.len();
                let member_id = member_ids[idx];
                let sub = inner
                    .subs
                    .iter()
                    .find(|s| s.id == member_id)
                    .expect("member id came from subs");
                if sub.tx.send(event.clone()).is_ok() {
                    let next = (idx + 1) % member_ids.len();
                    inner.cursors.insert(group.clone(), next);
                    delivered = true;
                    break;
                }
                dead.push(member_id);
            }
            if !delivered {
                trace!(group = %group, subject = %event.subject, "queue group has no live members");
            }
        }

        if !dead.is_empty() {
            inner.subs.retain(|s| !dead.contains(&s.id));
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
