//! In-process event bus for tile lifecycles and orchestration.
//!
//! Subscribers are keyed by event name and notified in subscription order.
//! Recording sessions capture emitted payloads for assertions and replay.
//! Zero knowledge of tiles beyond the reserved event names.

pub mod bus;
pub mod error;
pub mod record;
pub mod telemetry;
pub mod types;

pub use bus::{default_bus, EventBus, SubscriptionGuard, SubscriptionHandle};
pub use error::BusError;
pub use record::{EventFilter, Recording};
pub use telemetry::{TelemetrySink, TracingSink};
pub use types::{names, Event, EventRecord, STANDARD_EVENTS};
