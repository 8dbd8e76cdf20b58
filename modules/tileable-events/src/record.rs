//! Recording sessions: scoped capture of emitted payloads.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;

use crate::bus::{lock, BusInner};
use crate::types::EventRecord;

/// Which event names a recording captures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventFilter {
    All,
    Only(BTreeSet<String>),
}

impl EventFilter {
    pub fn all() -> Self {
        EventFilter::All
    }

    pub fn only<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        EventFilter::Only(events.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, event: &str) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Only(names) => names.contains(event),
        }
    }
}

/// A live recording. Every matching emission is appended in emission order
/// until the recording is dropped, at which point it detaches from the bus.
#[must_use = "recording stops as soon as it is dropped"]
#[derive(Debug)]
pub struct Recording {
    bus: Weak<BusInner>,
    id: u64,
    log: Arc<Mutex<Vec<EventRecord>>>,
}

impl Recording {
    pub(crate) fn new(bus: Weak<BusInner>, id: u64, log: Arc<Mutex<Vec<EventRecord>>>) -> Self {
        Self { bus, id, log }
    }

    /// Everything captured so far.
    pub fn events(&self) -> Vec<EventRecord> {
        lock(&self.log).clone()
    }

    /// Payloads captured for a single event name.
    pub fn payloads(&self, event: &str) -> Vec<Value> {
        lock(&self.log)
            .iter()
            .filter(|r| r.event == event)
            .map(|r| r.payload.clone())
            .collect()
    }

    /// Captured event names, in emission order.
    pub fn names(&self) -> Vec<String> {
        lock(&self.log).iter().map(|r| r.event.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.log).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Detach from the bus and return the captured log.
    pub fn finish(self) -> Vec<EventRecord> {
        self.events()
    }
}

impl Drop for Recording {
    fn drop(&mut self) {
        if let Some(inner) = self.bus.upgrade() {
            lock(&inner.recorders).retain(|slot| slot.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use serde_json::json;

    #[tokio::test]
    async fn recording_captures_only_while_alive() {
        let bus = EventBus::new();
        bus.emit("tile.debug", json!({"n": 0})).await.unwrap();

        let recording = bus.record(EventFilter::all());
        bus.emit("tile.debug", json!({"n": 1})).await.unwrap();
        bus.emit("other", json!({"n": 2})).await.unwrap();
        let log = recording.finish();

        bus.emit("tile.debug", json!({"n": 3})).await.unwrap();

        let names: Vec<_> = log.iter().map(|r| r.event.as_str()).collect();
        assert_eq!(names, vec!["tile.debug", "other"]);
    }

    #[tokio::test]
    async fn filtered_recording_ignores_other_events() {
        let bus = EventBus::new();
        let recording = bus.record(EventFilter::only(["tile.debug"]));

        bus.emit("tile.started", json!({"tile": "greeting"})).await.unwrap();
        bus.emit("tile.debug", json!({"tile": "greeting", "name": "World"}))
            .await
            .unwrap();

        assert_eq!(
            recording.payloads("tile.debug"),
            vec![json!({"tile": "greeting", "name": "World"})]
        );
        assert_eq!(recording.len(), 1);
    }

    #[tokio::test]
    async fn recording_is_released_when_a_handler_fails() {
        let bus = EventBus::new();
        bus.subscribe("explode", |_| anyhow::bail!("nope"));

        let result = {
            let recording = bus.record(EventFilter::all());
            assert_eq!(bus.recording_count(), 1);
            let outcome = bus.emit("explode", json!({})).await;
            assert_eq!(recording.names(), vec!["explode".to_string()]);
            outcome
        };

        assert!(result.is_err());
        assert_eq!(bus.recording_count(), 0);
    }
}
