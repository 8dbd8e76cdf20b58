//! Core event types. Domain-agnostic beyond the reserved names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved event names.
pub mod names {
    pub const TILE_STARTED: &str = "tile.started";
    pub const TILE_COMPLETED: &str = "tile.completed";
    pub const TILE_FAILED: &str = "tile.failed";
    pub const TILE_DEBUG: &str = "tile.debug";
    pub const TILE_RETRYING: &str = "tile.retrying";
    pub const OBSERVER_STARTED: &str = "tile.observer.started";
    pub const OBSERVER_COMPLETED: &str = "tile.observer.completed";
    pub const OBSERVER_FAILED: &str = "tile.observer.failed";
}

/// Every reserved event name, in lifecycle order.
pub const STANDARD_EVENTS: &[&str] = &[
    names::TILE_STARTED,
    names::TILE_DEBUG,
    names::TILE_RETRYING,
    names::TILE_COMPLETED,
    names::TILE_FAILED,
    names::OBSERVER_STARTED,
    names::OBSERVER_COMPLETED,
    names::OBSERVER_FAILED,
];

/// An emission as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub ts: DateTime<Utc>,
}

impl Event {
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        Self {
            name: name.into(),
            payload,
            ts: Utc::now(),
        }
    }

    /// The emitting tile when the payload names one, otherwise the event name.
    pub fn sender(&self) -> &str {
        self.payload
            .get("tile")
            .and_then(Value::as_str)
            .unwrap_or(&self.name)
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn to_record(&self) -> EventRecord {
        EventRecord {
            event: self.name.clone(),
            sender: self.sender().to_string(),
            payload: self.payload.clone(),
        }
    }
}

/// A captured emission.
///
/// Carries no timestamp so that logs from two runs of the same input compare
/// equal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event: String,
    pub sender: String,
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sender_prefers_tile_field() {
        let event = Event::new("flow.fetch.completed", json!({"tile": "fetch", "score": 42}));
        assert_eq!(event.sender(), "fetch");

        let anonymous = Event::new("custom.event", json!({"data": 1}));
        assert_eq!(anonymous.sender(), "custom.event");
    }

    #[test]
    fn record_drops_timestamp() {
        let a = Event::new("tile.debug", json!({"tile": "greeting"})).to_record();
        let b = Event::new("tile.debug", json!({"tile": "greeting"})).to_record();
        assert_eq!(a, b);
    }
}
