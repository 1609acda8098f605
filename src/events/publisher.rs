use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::models::task::Task;

/// A task lifecycle event as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    /// One of the `event_names` constants.
    pub name: &'static str,
    /// Task snapshot context: id, type, status, entity label, duration.
    pub context: Value,
    pub published_at: DateTime<Utc>,
}

/// Broadcast publisher for task lifecycle events.
///
/// Fire-and-forget: publishing with no subscribers is not an error, and a
/// slow subscriber only lags its own receiver.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<LifecycleEvent>,
}

impl EventPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish a lifecycle event for a task. Send errors (no subscribers)
    /// are swallowed on purpose.
    pub fn publish_task(&self, name: &'static str, task: &Task) {
        let event = LifecycleEvent {
            name,
            context: json!({
                "task_id": task.id,
                "task_type": task.task_type,
                "status": task.status,
                "entity": task.entity().label(),
                "priority": task.priority,
                "duration_secs": task.duration_secs(),
                "error_message": task.error_message,
            }),
            published_at: Utc::now(),
        };
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(1000)
    }
}
