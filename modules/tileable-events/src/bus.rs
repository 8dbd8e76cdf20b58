//! Ordered publish/subscribe with recording.
//!
//! `emit` snapshots the subscriber list for the event name, then notifies each
//! subscriber in subscription order. Async subscribers are awaited before the
//! next one runs, so `emit` only returns once every effect of the emission has
//! settled. A subscriber added while an emission is being dispatched is not
//! notified for that emission.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, RwLock, Weak};

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::BusError;
use crate::record::{EventFilter, Recording};
use crate::telemetry::TelemetrySink;
use crate::types::{Event, EventRecord};

type SyncHandler = dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync;
type AsyncHandler = dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

#[derive(Clone)]
enum Handler {
    Sync(Arc<SyncHandler>),
    Async(Arc<AsyncHandler>),
}

struct Subscriber {
    id: u64,
    handler: Handler,
}

pub(crate) struct RecorderSlot {
    pub(crate) id: u64,
    pub(crate) filter: EventFilter,
    pub(crate) log: Arc<Mutex<Vec<EventRecord>>>,
}

#[derive(Default)]
pub(crate) struct BusInner {
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
    pub(crate) recorders: Mutex<Vec<RecorderSlot>>,
    telemetry: RwLock<Option<Arc<dyn TelemetrySink>>>,
    next_id: AtomicU64,
}

impl BusInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn remove(&self, event: &str, id: u64) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let Some(list) = subscribers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(event);
        }
        removed
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publish/subscribe hub. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

static DEFAULT_BUS: LazyLock<EventBus> = LazyLock::new(EventBus::new);

/// The process-wide bus. Returns the same instance on every call.
pub fn default_bus() -> EventBus {
    DEFAULT_BUS.clone()
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bus that forwards every emission to `sink`.
    pub fn with_telemetry(sink: Arc<dyn TelemetrySink>) -> Self {
        let bus = Self::new();
        bus.set_telemetry(Some(sink));
        bus
    }

    pub fn set_telemetry(&self, sink: Option<Arc<dyn TelemetrySink>>) {
        *self
            .inner
            .telemetry
            .write()
            .unwrap_or_else(|e| e.into_inner()) = sink;
    }

    /// True when both handles point at the same bus.
    pub fn ptr_eq(&self, other: &EventBus) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a synchronous handler for `event`.
    pub fn subscribe<F>(&self, event: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert(event.into(), Handler::Sync(Arc::new(handler)))
    }

    /// Register a suspension-capable handler for `event`. `emit` awaits it to
    /// completion before notifying the next subscriber.
    pub fn subscribe_async<F, Fut>(&self, event: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: Arc<AsyncHandler> = Arc::new(move |event| handler(event).boxed());
        self.insert(event.into(), Handler::Async(handler))
    }

    fn insert(&self, event: String, handler: Handler) -> SubscriptionHandle {
        let id = self.inner.next_id();
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event.clone())
            .or_default()
            .push(Subscriber { id, handler });
        debug!(event = event.as_str(), subscriber = id, "Subscribed");
        SubscriptionHandle {
            bus: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        self.inner.remove(&handle.event, handle.id)
    }

    /// Number of live subscribers for `event`.
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event)
            .map_or(0, Vec::len)
    }

    /// Start a recording session. Matching payloads are captured until the
    /// returned `Recording` is dropped.
    pub fn record(&self, filter: EventFilter) -> Recording {
        let id = self.inner.next_id();
        let log = Arc::new(Mutex::new(Vec::new()));
        lock(&self.inner.recorders).push(RecorderSlot {
            id,
            filter,
            log: Arc::clone(&log),
        });
        Recording::new(Arc::downgrade(&self.inner), id, log)
    }

    /// Number of live recording sessions.
    pub fn recording_count(&self) -> usize {
        lock(&self.inner.recorders).len()
    }

    /// Notify every current subscriber of `name`, in subscription order,
    /// exactly once. The first failing handler aborts the dispatch.
    pub async fn emit(&self, name: &str, payload: Value) -> Result<(), BusError> {
        let event = Event::new(name, payload);
        self.capture(&event);

        let sink = self
            .inner
            .telemetry
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(sink) = sink {
            sink.emit(name, &event.payload);
        }

        // Snapshot: subscribers added during dispatch wait for the next emission.
        let handlers: Vec<(u64, Handler)> = self
            .inner
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map(|list| list.iter().map(|s| (s.id, s.handler.clone())).collect())
            .unwrap_or_default();

        for (id, handler) in handlers {
            let outcome = match handler {
                Handler::Sync(f) => f(&event),
                Handler::Async(f) => f(event.clone()).await,
            };
            if let Err(e) = outcome {
                warn!(event = name, subscriber = id, error = %e, "Event handler failed");
                return Err(BusError::Handler {
                    event: name.to_string(),
                    source: e.into(),
                });
            }
        }

        Ok(())
    }

    fn capture(&self, event: &Event) {
        let recorders = lock(&self.inner.recorders);
        if recorders.is_empty() {
            return;
        }
        let record = event.to_record();
        for slot in recorders.iter().filter(|s| s.filter.matches(&event.name)) {
            lock(&slot.log).push(record.clone());
        }
    }
}

/// Identifies one subscription. Dropping the handle leaves the subscription
/// in place; call `unsubscribe` or convert it into a guard.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle {
    bus: Weak<BusInner>,
    event: String,
    id: u64,
}

impl SubscriptionHandle {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(&self) -> bool {
        match self.bus.upgrade() {
            Some(inner) => inner.remove(&self.event, self.id),
            None => false,
        }
    }

    /// Tie the subscription to a scope: it is removed when the guard drops.
    pub fn guard(self) -> SubscriptionGuard {
        SubscriptionGuard { handle: self }
    }
}

/// Removes its subscription on drop, including on error and panic paths.
#[must_use = "the subscription is removed as soon as the guard is dropped"]
#[derive(Debug)]
pub struct SubscriptionGuard {
    handle: SubscriptionHandle,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("ptr", &Arc::as_ptr(&self.inner))
            .finish()
    }
}
