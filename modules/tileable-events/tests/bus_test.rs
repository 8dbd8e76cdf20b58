//! EventBus behaviour seen from outside the crate.

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tileable_events::{names, EventBus, EventFilter, TelemetrySink, STANDARD_EVENTS};

// ---------------------------------------------------------------------------
// Test telemetry sink
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CapturingSink {
    seen: Mutex<Vec<(String, Value)>>,
}

impl TelemetrySink for CapturingSink {
    fn emit(&self, event: &str, fields: &Value) {
        self.seen
            .lock()
            .unwrap()
            .push((event.to_string(), fields.clone()));
    }
}

// =========================================================================
// Delivery guarantees
// =========================================================================

#[tokio::test]
async fn each_standard_event_is_delivered_once_then_silenced() {
    let bus = EventBus::new();
    let counts = Arc::new(Mutex::new(std::collections::HashMap::<String, usize>::new()));

    for event in STANDARD_EVENTS {
        let counts = Arc::clone(&counts);
        let handle = bus.subscribe(*event, move |e| {
            *counts.lock().unwrap().entry(e.name.clone()).or_default() += 1;
            Ok(())
        });
        bus.emit(event, json!({})).await.unwrap();
        bus.unsubscribe(&handle);
        bus.emit(event, json!({})).await.unwrap();
    }

    let counts = counts.lock().unwrap();
    assert_eq!(counts.len(), STANDARD_EVENTS.len());
    assert!(counts.values().all(|n| *n == 1));
}

#[tokio::test]
async fn mixed_sync_and_async_handlers_keep_registration_order() {
    let bus = EventBus::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let first = Arc::clone(&order);
    bus.subscribe(names::TILE_COMPLETED, move |_| {
        first.lock().unwrap().push("sync-1");
        Ok(())
    });
    let second = Arc::clone(&order);
    bus.subscribe_async(names::TILE_COMPLETED, move |_| {
        let second = Arc::clone(&second);
        async move {
            tokio::task::yield_now().await;
            second.lock().unwrap().push("async-2");
            Ok(())
        }
    });
    let third = Arc::clone(&order);
    bus.subscribe(names::TILE_COMPLETED, move |_| {
        third.lock().unwrap().push("sync-3");
        Ok(())
    });

    bus.emit(names::TILE_COMPLETED, json!({"tile": "greeting"}))
        .await
        .unwrap();

    assert_eq!(*order.lock().unwrap(), vec!["sync-1", "async-2", "sync-3"]);
}

// =========================================================================
// Recording and telemetry
// =========================================================================

#[tokio::test]
async fn recording_preserves_sender_and_order() {
    let bus = EventBus::new();
    let recording = bus.record(EventFilter::all());

    bus.emit(names::TILE_STARTED, json!({"tile": "audit", "payload": {"value": 2}}))
        .await
        .unwrap();
    bus.emit("custom.event", json!({"data": 1})).await.unwrap();

    let log = recording.events();
    assert_eq!(log.len(), 2);
    assert_eq!(log[0].sender, "audit");
    assert_eq!(log[1].sender, "custom.event");
    assert_eq!(log[1].payload, json!({"data": 1}));
}

#[tokio::test]
async fn telemetry_sink_sees_every_emission() {
    let sink = Arc::new(CapturingSink::default());
    let bus = EventBus::with_telemetry(sink.clone());

    bus.emit(names::TILE_DEBUG, json!({"tile": "echo"})).await.unwrap();
    bus.emit("unobserved", json!({})).await.unwrap();

    let seen = sink.seen.lock().unwrap();
    let seen_names: Vec<_> = seen.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(seen_names, vec![names::TILE_DEBUG, "unobserved"]);
}
