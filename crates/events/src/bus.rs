//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>` between the scheduler, the
//! dispatcher, the approval runner and any subscribers.

use chrono::{DateTime, Utc};
use rollgate_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// Event types
// ---------------------------------------------------------------------------

/// A run was created by a trigger or re-run request.
pub const TASK_RUN_CREATED: &str = "task_run.created";
/// A dispatcher claimed the run and started executing it.
pub const TASK_RUN_STARTED: &str = "task_run.started";
/// The run reached a terminal status.
pub const TASK_RUN_FINISHED: &str = "task_run.finished";
/// An issue's approval finding completed.
pub const ISSUE_APPROVAL_FOUND: &str = "issue.approval_found";

// ---------------------------------------------------------------------------
// PlatformEvent
// ---------------------------------------------------------------------------

/// A domain event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformEvent {
    /// Dot-separated event name, e.g. `"task_run.created"`.
    pub event_type: String,

    /// Source entity kind (`"task_run"`, `"issue"`).
    pub source_entity_type: Option<String>,

    pub source_entity_id: Option<DbId>,

    /// Principal that caused the event, if any.
    pub actor: Option<String>,

    pub payload: serde_json::Value,

    pub timestamp: DateTime<Utc>,
}

impl PlatformEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            source_entity_type: None,
            source_entity_id: None,
            actor: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    pub fn with_source(mut self, entity_type: impl Into<String>, entity_id: DbId) -> Self {
        self.source_entity_type = Some(entity_type.into());
        self.source_entity_id = Some(entity_id);
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// When the buffer is full the oldest unconsumed events are dropped and slow
/// receivers observe `RecvError::Lagged`.
pub struct EventBus {
    sender: broadcast::Sender<PlatformEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish to all current subscribers. Dropped if there are none.
    pub fn publish(&self, event: PlatformEvent) {
        // A send error only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlatformEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_each_receive_published_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(
            PlatformEvent::new(TASK_RUN_CREATED)
                .with_source("task_run", 42)
                .with_actor("alice")
                .with_payload(serde_json::json!({"task_id": 7})),
        );

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.event_type, TASK_RUN_CREATED);
        assert_eq!(e1.source_entity_id, Some(42));
        assert_eq!(e1.actor.as_deref(), Some("alice"));
        assert_eq!(e2.payload["task_id"], 7);
    }

    #[test]
    fn publish_without_subscribers_is_a_no_op() {
        EventBus::default().publish(PlatformEvent::new(ISSUE_APPROVAL_FOUND));
    }

    #[test]
    fn new_event_has_empty_object_payload() {
        let event = PlatformEvent::new(TASK_RUN_FINISHED);
        assert!(event.source_entity_type.is_none());
        assert!(event.payload.is_object());
    }
}
