use super::bus::EventBus;
use super::event::{ChangeKind, EventMessage, EventType};
use std::sync::{Arc, Mutex};

#[test]
fn test_publish_subscribe() {
    let bus: EventBus<EventMessage> = EventBus::new();

    let received = Arc::new(Mutex::new(Vec::<EventMessage>::new()));
    let received_clone = received.clone();
    let _sub = bus.subscribe(move |event: &EventMessage| {
        received_clone.lock().unwrap().push(event.clone());
    });

    let message = EventMessage::new(EventType::SystemUpdate, serde_json::json!({"test": true})).unwrap();
    bus.publish(&message);

    let events = received.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::SystemUpdate);
}

#[test]
fn test_unsubscribe_stops_delivery() {
    let bus: EventBus<u32> = EventBus::new();
    let count = Arc::new(Mutex::new(0u32));

    let count_clone = count.clone();
    let sub = bus.subscribe(move |n| *count_clone.lock().unwrap() += n);
    bus.publish(&2);
    assert!(sub.unsubscribe());
    bus.publish(&5);

    assert_eq!(*count.lock().unwrap(), 2);
    assert_eq!(bus.subscriber_count(), 0);
}

#[test]
fn test_dropped_handle_keeps_subscription() {
    let bus: EventBus<u32> = EventBus::new();
    let count = Arc::new(Mutex::new(0u32));

    let count_clone = count.clone();
    drop(bus.subscribe(move |_| *count_clone.lock().unwrap() += 1));
    bus.publish(&1);

    assert_eq!(*count.lock().unwrap(), 1);
}

#[test]
fn test_callback_may_subscribe_during_publish() {
    let bus: EventBus<u32> = EventBus::new();
    let bus_clone = bus.clone();
    let _sub = bus.subscribe(move |_| {
        let _inner = bus_clone.subscribe(|_| {});
    });

    bus.publish(&1);
    assert_eq!(bus.subscriber_count(), 2);
}

#[test]
fn test_tagged_push_message() {
    let message = EventMessage::from_wire(
        r#"{"type":"camera_status","payload":{"device_id":"cam-1","status":"connected"}}"#,
    )
    .unwrap();

    assert_eq!(message.event_type, EventType::CameraStatus);
    assert_eq!(message.payload["device_id"], "cam-1");
    assert!(message.change.is_none());
}

#[test]
fn test_change_feed_envelope_routes_by_table() {
    let message = EventMessage::from_wire(
        r#"{"table":"alerts","type":"INSERT","record":{"id":"a1","type":"fall"}}"#,
    )
    .unwrap();

    assert_eq!(message.event_type, EventType::Alert);
    assert_eq!(message.change, Some(ChangeKind::Insert));
    assert_eq!(message.payload["type"], "fall");

    let other = EventMessage::from_wire(r#"{"table":"zones","type":"DELETE","old_record":{}}"#).unwrap();
    assert_eq!(other.event_type, EventType::Generic("table.zones".to_string()));
}

#[test]
fn test_unknown_tag_is_generic() {
    let message = EventMessage::from_wire(r#"{"type":"heartbeat"}"#).unwrap();
    assert_eq!(message.event_type, EventType::Generic("heartbeat".to_string()));
    assert_eq!(message.event_type.to_string(), "heartbeat");
}
