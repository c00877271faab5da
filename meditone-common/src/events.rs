//! Pipeline event types and the in-process EventBus
//!
//! Events are broadcast to any number of subscribers (SSE clients, tests).
//! Nothing downstream depends on an event being delivered; the persisted
//! request record and job log stay authoritative.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Pipeline events
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum PipelineEvent {
    /// A meditation request was accepted and its first stage enqueued
    MeditationSubmitted {
        meditation_id: Uuid,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A worker started executing a stage task
    StageStarted {
        meditation_id: Uuid,
        stage: String,
        attempt: u32,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A stage task finished successfully
    StageCompleted {
        meditation_id: Uuid,
        stage: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A stage task failed and was re-enqueued
    RetryScheduled {
        meditation_id: Uuid,
        stage: String,
        attempt: u32,
        delay_secs: u64,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// A stage reached a terminal failure; the request is Failed
    StageFailed {
        meditation_id: Uuid,
        stage: String,
        message: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// External music task status observed by the poller or webhook
    MusicStatusChanged {
        meditation_id: Uuid,
        external_task_id: String,
        status: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },

    /// Final mixed artifact persisted
    MeditationCompleted {
        meditation_id: Uuid,
        artifact_url: String,
        timestamp: chrono::DateTime<chrono::Utc>,
    },
}

impl PipelineEvent {
    /// Event name used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::MeditationSubmitted { .. } => "MeditationSubmitted",
            PipelineEvent::StageStarted { .. } => "StageStarted",
            PipelineEvent::StageCompleted { .. } => "StageCompleted",
            PipelineEvent::RetryScheduled { .. } => "RetryScheduled",
            PipelineEvent::StageFailed { .. } => "StageFailed",
            PipelineEvent::MusicStatusChanged { .. } => "MusicStatusChanged",
            PipelineEvent::MeditationCompleted { .. } => "MeditationCompleted",
        }
    }

    /// Meditation the event belongs to
    pub fn meditation_id(&self) -> Uuid {
        match self {
            PipelineEvent::MeditationSubmitted { meditation_id, .. }
            | PipelineEvent::StageStarted { meditation_id, .. }
            | PipelineEvent::StageCompleted { meditation_id, .. }
            | PipelineEvent::RetryScheduled { meditation_id, .. }
            | PipelineEvent::StageFailed { meditation_id, .. }
            | PipelineEvent::MusicStatusChanged { meditation_id, .. }
            | PipelineEvent::MeditationCompleted { meditation_id, .. } => *meditation_id,
        }
    }
}

/// Broadcast bus for pipeline events
///
/// # Examples
///
/// ```
/// use meditone_common::events::EventBus;
///
/// let event_bus = EventBus::new(100);
/// let _rx = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<PipelineEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring the case where nobody is listening
    pub fn emit_lossy(&self, event: PipelineEvent) {
        if self.tx.send(event).is_err() {
            trace!("No subscribers for pipeline event");
        }
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: Uuid) -> PipelineEvent {
        PipelineEvent::MeditationCompleted {
            meditation_id: id,
            artifact_url: "https://example.com/a.mp3".to_string(),
            timestamp: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();

        bus.emit_lossy(completed(id));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.meditation_id(), id);
        assert_eq!(received.event_type(), "MeditationCompleted");
    }

    #[test]
    fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new(10);
        bus.emit_lossy(completed(Uuid::new_v4()));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 10);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let json = serde_json::to_value(completed(Uuid::nil())).unwrap();
        assert_eq!(json["type"], "MeditationCompleted");
        assert_eq!(json["artifact_url"], "https://example.com/a.mp3");
    }
}
