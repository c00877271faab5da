//! EventBus fan-out and event serialization

use chrono::Utc;
use meditone_common::events::{EventBus, PipelineEvent};
use uuid::Uuid;

#[tokio::test]
async fn test_every_subscriber_receives_events_in_order() {
    let bus = EventBus::new(16);
    let mut first = bus.subscribe();
    let mut second = bus.subscribe();
    let id = Uuid::new_v4();

    bus.emit_lossy(PipelineEvent::MeditationSubmitted {
        meditation_id: id,
        timestamp: Utc::now(),
    });
    bus.emit_lossy(PipelineEvent::StageStarted {
        meditation_id: id,
        stage: "script".into(),
        attempt: 1,
        timestamp: Utc::now(),
    });

    for rx in [&mut first, &mut second] {
        assert_eq!(rx.recv().await.unwrap().event_type(), "MeditationSubmitted");
        let started = rx.recv().await.unwrap();
        assert_eq!(started.event_type(), "StageStarted");
        assert_eq!(started.meditation_id(), id);
    }
}

#[test]
fn test_events_serialize_with_type_tag() {
    let id = Uuid::new_v4();
    let event = PipelineEvent::MeditationCompleted {
        meditation_id: id,
        artifact_url: "https://drive.google.com/uc?id=abc&export=download".into(),
        timestamp: Utc::now(),
    };

    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["type"], "MeditationCompleted");
    assert_eq!(json["meditation_id"], id.to_string());

    let back: PipelineEvent = serde_json::from_value(json).unwrap();
    assert_eq!(back, event);
}
