//! In-process event bus.
//!
//! Decouples the job and notification services from their consumers
//! (dashboards, providers, each other) via named-event publish/subscribe.
//! Emission is synchronous and in-order per event kind; a listener that
//! returns an error is logged and never prevents sibling listeners from
//! running. No persistence, no replay, no cross-process delivery.
//!
//! The bus is an explicitly constructed instance injected into the services
//! rather than a process-wide static, so tests and embedders can run
//! isolated instances.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::jobs::{JobId, JobKind};
use crate::notify::{Channel, NotificationId, NotificationKind};

/// Named event kinds consumers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    NotificationDelivered,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::JobQueued => "job_queued",
            Self::JobStarted => "job_started",
            Self::JobCompleted => "job_completed",
            Self::JobFailed => "job_failed",
            Self::JobCancelled => "job_cancelled",
            Self::NotificationDelivered => "notification_delivered",
        };
        write!(f, "{}", name)
    }
}

/// Payload for job lifecycle events.
#[derive(Debug, Clone, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub kind: JobKind,
    pub source_module: String,
    pub company_id: Option<String>,
    /// Last failure reason, set on `job_failed`
    pub error: Option<String>,
}

/// Payload for `notification_delivered` events.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryEvent {
    pub message_id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub recipient_user_id: String,
    pub channel: Channel,
    pub source_module: String,
}

/// An event published on the bus.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    JobQueued(JobEvent),
    JobStarted(JobEvent),
    JobCompleted(JobEvent),
    JobFailed(JobEvent),
    JobCancelled(JobEvent),
    NotificationDelivered(DeliveryEvent),
}

impl BusEvent {
    /// The kind this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::JobQueued(_) => EventKind::JobQueued,
            Self::JobStarted(_) => EventKind::JobStarted,
            Self::JobCompleted(_) => EventKind::JobCompleted,
            Self::JobFailed(_) => EventKind::JobFailed,
            Self::JobCancelled(_) => EventKind::JobCancelled,
            Self::NotificationDelivered(_) => EventKind::NotificationDelivered,
        }
    }
}

/// Token identifying a registered listener, returned by [`EventBus::on`].
///
/// Rust closures have no comparable identity, so unsubscription takes the
/// token rather than the callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type Listener = Arc<dyn Fn(&BusEvent) -> crate::Result<()> + Send + Sync>;

/// Synchronous in-process publish/subscribe hub.
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(SubscriberId, Listener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create a new, empty bus.
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a listener for an event kind.
    pub fn on<F>(&self, kind: EventKind, listener: F) -> SubscriberId
    where
        F: Fn(&BusEvent) -> crate::Result<()> + Send + Sync + 'static,
    {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a previously registered listener. Returns whether it was found.
    pub fn off(&self, kind: EventKind, id: SubscriberId) -> bool {
        let mut listeners = self.listeners.write();
        if let Some(entries) = listeners.get_mut(&kind) {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            return entries.len() < before;
        }
        false
    }

    /// Emit an event to all listeners registered for its kind.
    ///
    /// Fan-out runs against a snapshot of the listener list, so listeners may
    /// subscribe or unsubscribe reentrantly without deadlocking. Listener
    /// errors are logged per-callback and never propagate to the emitter or
    /// to sibling listeners.
    pub fn emit(&self, event: BusEvent) {
        let kind = event.kind();
        let snapshot: Vec<(SubscriberId, Listener)> = {
            let listeners = self.listeners.read();
            listeners.get(&kind).cloned().unwrap_or_default()
        };

        for (id, listener) in snapshot {
            if let Err(e) = listener(&event) {
                tracing::warn!(
                    event_kind = %kind,
                    subscriber_id = ?id,
                    error = %e,
                    "Event listener failed"
                );
            }
        }
    }

    /// Number of listeners registered for an event kind.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .get(&kind)
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    /// Remove all listeners.
    pub fn clear(&self) {
        self.listeners.write().clear();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
