//! Event-driven routing across tiles.
//!
//! A flow runs an entry tile, listens on the bus for the events its
//! subscriptions name, and turns each routing decision into a follow-up
//! invocation. Follow-ups are queued and drained in FIFO order once the
//! current invocation has returned, so identical inputs always produce the
//! same sequence of invocations. Every invocation the flow makes is appended
//! to a per-key history kept in the shared state.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use tileable_engine::{EventBus, FlowConfig, SharedState, Tile, TileContext};
use tileable_events::SubscriptionGuard;

/// State key holding the histories of the current run.
pub const HISTORY_KEY: &str = "flow.history";
pub const DEFAULT_KEY: &str = "default";

/// What to do after an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Stop,
    Invoke {
        tile: String,
        payload: Value,
        /// Record a failure of the routed tile instead of failing the flow.
        tolerate_failure: bool,
    },
}

impl Route {
    pub fn invoke(tile: impl Into<String>, payload: Value) -> Self {
        Route::Invoke {
            tile: tile.into(),
            payload,
            tolerate_failure: false,
        }
    }

    pub fn tolerating_failure(self) -> Self {
        match self {
            Route::Invoke { tile, payload, .. } => Route::Invoke {
                tile,
                payload,
                tolerate_failure: true,
            },
            Route::Stop => Route::Stop,
        }
    }
}

type RouteFn = dyn Fn(&EventBus, &str, &Value) -> anyhow::Result<Route> + Send + Sync;

/// An event name and the routing function run when it fires. The function
/// receives the bus, the emitting tile's name and the event payload.
#[derive(Clone)]
pub struct Subscription {
    event: String,
    route: Arc<RouteFn>,
}

impl Subscription {
    pub fn new<F>(event: impl Into<String>, route: F) -> Self
    where
        F: Fn(&EventBus, &str, &Value) -> anyhow::Result<Route> + Send + Sync + 'static,
    {
        Self {
            event: event.into(),
            route: Arc::new(route),
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .finish_non_exhaustive()
    }
}

/// One invocation made by a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub tile: String,
    /// `"entry"` or the event that routed here.
    pub trigger: String,
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFlowPayload {
    pub entry_tile: String,
    #[serde(default)]
    pub entry_payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFlowResult {
    pub histories: BTreeMap<String, Vec<FlowStep>>,
    pub invocations: usize,
}

struct Pending {
    tile: String,
    payload: Value,
    trigger: String,
    tolerate_failure: bool,
}

/// Build a flow tile from subscriptions.
pub fn register_event_flow<I>(subscriptions: I) -> EventFlowTile
where
    I: IntoIterator<Item = Subscription>,
{
    EventFlowTile {
        name: "event-flow".to_string(),
        subscriptions: subscriptions.into_iter().collect(),
        key_field: None,
        max_invocations: FlowConfig::default().max_invocations,
    }
}

pub struct EventFlowTile {
    name: String,
    subscriptions: Vec<Subscription>,
    key_field: Option<String>,
    max_invocations: usize,
}

impl EventFlowTile {
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Group history by this field of each invocation's payload.
    pub fn keyed_by(mut self, field: impl Into<String>) -> Self {
        self.key_field = Some(field.into());
        self
    }

    pub fn with_max_invocations(mut self, max: usize) -> Self {
        self.max_invocations = max;
        self
    }

    pub fn with_config(self, config: &FlowConfig) -> Self {
        self.with_max_invocations(config.max_invocations)
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    fn key_for(&self, payload: &Value) -> String {
        let field = self.key_field.as_deref().and_then(|f| payload.get(f));
        match field {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Null) | None => DEFAULT_KEY.to_string(),
            Some(other) => other.to_string(),
        }
    }

    fn listen(&self, bus: &EventBus, queue: &Arc<Mutex<VecDeque<Pending>>>) -> Vec<SubscriptionGuard> {
        self.subscriptions
            .iter()
            .map(|subscription| {
                let route = Arc::clone(&subscription.route);
                let queue = Arc::clone(queue);
                let routing_bus = bus.clone();
                bus.subscribe(subscription.event.clone(), move |event| {
                    let decision = route(&routing_bus, event.sender(), &event.payload)?;
                    if let Route::Invoke {
                        tile,
                        payload,
                        tolerate_failure,
                    } = decision
                    {
                        debug!(trigger = %event.name, tile = %tile, "Flow routed");
                        queue
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .push_back(Pending {
                                tile,
                                payload,
                                trigger: event.name.clone(),
                                tolerate_failure,
                            });
                    }
                    Ok(())
                })
                .guard()
            })
            .collect()
    }
}

fn record_step(state: &SharedState, key: String, step: FlowStep) -> anyhow::Result<()> {
    let step = serde_json::to_value(step)?;
    state.update(|map| {
        let histories = map
            .entry(HISTORY_KEY.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !histories.is_object() {
            *histories = Value::Object(Map::new());
        }
        if let Value::Object(histories) = histories {
            let steps = histories.entry(key).or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(steps) = steps {
                steps.push(step);
            }
        }
    });
    Ok(())
}

#[async_trait]
impl Tile for EventFlowTile {
    type Payload = EventFlowPayload;
    type Output = EventFlowResult;

    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> Option<&str> {
        Some("Run an entry tile and route follow-up invocations from bus events")
    }

    fn validate(&self, payload: &EventFlowPayload) -> anyhow::Result<()> {
        anyhow::ensure!(!payload.entry_tile.is_empty(), "entry_tile must not be empty");
        anyhow::ensure!(payload.entry_tile != self.name, "a flow cannot enter itself");
        Ok(())
    }

    async fn execute(&self, payload: EventFlowPayload, ctx: &TileContext) -> anyhow::Result<EventFlowResult> {
        let state = ctx.state();
        state.remove(HISTORY_KEY);

        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let _listeners = self.listen(ctx.event_bus(), &queue);

        let mut next = Some(Pending {
            tile: payload.entry_tile,
            payload: payload.entry_payload,
            trigger: "entry".to_string(),
            tolerate_failure: false,
        });
        let mut invocations = 0;

        while let Some(pending) = next.take() {
            // 1. Bound the run
            invocations += 1;
            if invocations > self.max_invocations {
                anyhow::bail!(
                    "flow '{}' exceeded {} invocations",
                    self.name,
                    self.max_invocations
                );
            }

            // 2. Invoke; routing decisions land in the queue meanwhile
            let key = self.key_for(&pending.payload);
            let outcome = ctx
                .invocation(pending.tile.as_str(), pending.payload.clone())
                .run()
                .await;

            // 3. Record
            let mut step = FlowStep {
                tile: pending.tile,
                trigger: pending.trigger,
                payload: pending.payload,
                output: None,
                error: None,
            };
            match outcome {
                Ok(output) => step.output = Some(output),
                Err(e) if pending.tolerate_failure => {
                    warn!(flow = %self.name, tile = %step.tile, error = %e, "Routed tile failed, continuing");
                    step.error = Some(e.to_string());
                }
                Err(e) => return Err(e.into()),
            }
            record_step(state, key, step)?;

            // 4. Next queued follow-up
            next = queue.lock().unwrap_or_else(|e| e.into_inner()).pop_front();
        }

        let histories: BTreeMap<String, Vec<FlowStep>> =
            state.get_as(HISTORY_KEY)?.unwrap_or_default();
        info!(flow = %self.name, invocations, keys = histories.len(), "Flow settled");

        Ok(EventFlowResult {
            histories,
            invocations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_come_from_the_configured_field() {
        let flow = register_event_flow([]).keyed_by("order_id");

        assert_eq!(flow.key_for(&json!({"order_id": "A-1"})), "A-1");
        assert_eq!(flow.key_for(&json!({"order_id": 7})), "7");
        assert_eq!(flow.key_for(&json!({"other": 1})), DEFAULT_KEY);
    }

    #[test]
    fn steps_append_under_their_key() {
        let state = SharedState::new();
        for (key, tile) in [("a", "fetch"), ("b", "fetch"), ("a", "score")] {
            let step = FlowStep {
                tile: tile.into(),
                trigger: "entry".into(),
                payload: json!({}),
                output: None,
                error: None,
            };
            record_step(&state, key.into(), step).unwrap();
        }

        let histories: BTreeMap<String, Vec<FlowStep>> =
            state.get_as(HISTORY_KEY).unwrap().unwrap();
        let tiles: Vec<_> = histories["a"].iter().map(|s| s.tile.as_str()).collect();
        assert_eq!(tiles, vec!["fetch", "score"]);
        assert_eq!(histories["b"].len(), 1);
    }

    #[test]
    fn tolerating_failure_only_touches_invocations() {
        assert_eq!(Route::Stop.tolerating_failure(), Route::Stop);
        assert!(matches!(
            Route::invoke("notify", json!({})).tolerating_failure(),
            Route::Invoke { tolerate_failure: true, .. }
        ));
    }
}
