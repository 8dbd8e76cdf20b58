//! Event-driven routing across several tiles.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tileable_contrib::{register_event_flow, EventFlowResult, EventFlowTile, Route, Subscription};
use tileable_engine::{EventBus, FailureKind, Invocation, Registry, SharedState, Tile, TileContext};

// ---------------------------------------------------------------------------
// Test tiles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    order_id: String,
    score: i64,
}

#[derive(Debug, Deserialize)]
struct Batch {
    orders: Vec<Order>,
}

struct Ingest;

#[async_trait]
impl Tile for Ingest {
    type Payload = Batch;
    type Output = usize;

    fn name(&self) -> &str {
        "ingest"
    }

    async fn execute(&self, batch: Batch, ctx: &TileContext) -> anyhow::Result<usize> {
        for order in &batch.orders {
            ctx.emit(
                "flow.order.received",
                json!({"tile": "ingest", "order_id": order.order_id, "score": order.score}),
            )
            .await?;
        }
        Ok(batch.orders.len())
    }
}

struct Fetch;

#[async_trait]
impl Tile for Fetch {
    type Payload = Order;
    type Output = Order;

    fn name(&self) -> &str {
        "fetch"
    }

    async fn execute(&self, order: Order, ctx: &TileContext) -> anyhow::Result<Order> {
        ctx.emit(
            "flow.fetch.completed",
            json!({"tile": "fetch", "order_id": order.order_id, "score": order.score}),
        )
        .await?;
        Ok(order)
    }
}

struct Score;

#[async_trait]
impl Tile for Score {
    type Payload = Order;
    type Output = Value;

    fn name(&self) -> &str {
        "score"
    }

    async fn execute(&self, order: Order, ctx: &TileContext) -> anyhow::Result<Value> {
        ctx.emit(
            "flow.score.completed",
            json!({"tile": "score", "order_id": order.order_id, "grade": "high"}),
        )
        .await?;
        Ok(json!({"order_id": order.order_id, "grade": "high"}))
    }
}

struct Notify {
    name: &'static str,
    fail: bool,
}

#[async_trait]
impl Tile for Notify {
    type Payload = Value;
    type Output = Value;

    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, payload: Value, _ctx: &TileContext) -> anyhow::Result<Value> {
        anyhow::ensure!(!self.fail, "notification channel is down");
        Ok(json!({"order_id": payload["order_id"], "notified": true}))
    }
}

fn registry() -> Registry {
    let registry = Registry::new();
    registry.register(Ingest).unwrap();
    registry.register(Fetch).unwrap();
    registry.register(Score).unwrap();
    registry
        .register(Notify {
            name: "notify",
            fail: false,
        })
        .unwrap();
    registry
        .register(Notify {
            name: "notify-broken",
            fail: true,
        })
        .unwrap();
    registry
}

fn order_flow(notify: &'static str, tolerate: bool) -> EventFlowTile {
    register_event_flow([
        Subscription::new("flow.order.received", |_, _, payload| {
            Ok(Route::invoke("fetch", payload.clone()))
        }),
        Subscription::new("flow.fetch.completed", move |_, sender, payload| {
            assert_eq!(sender, "fetch");
            let order_id = payload["order_id"].clone();
            let route = if payload["score"].as_i64().unwrap_or(0) >= 40 {
                Route::invoke("score", json!({"order_id": order_id, "score": payload["score"]}))
            } else {
                Route::invoke(notify, json!({"order_id": order_id, "reason": "low score"}))
            };
            Ok(if tolerate { route.tolerating_failure() } else { route })
        }),
        Subscription::new("flow.score.completed", move |_, _, payload| {
            let route = Route::invoke(notify, json!({"order_id": payload["order_id"], "reason": "scored"}));
            Ok(if tolerate { route.tolerating_failure() } else { route })
        }),
    ])
    .keyed_by("order_id")
}

fn batch() -> Value {
    json!({
        "entry_tile": "ingest",
        "entry_payload": {"orders": [
            {"order_id": "A-1", "score": 42},
            {"order_id": "B-2", "score": 10},
        ]},
    })
}

fn tiles_for(result: &EventFlowResult, key: &str) -> Vec<String> {
    result.histories[key].iter().map(|s| s.tile.clone()).collect()
}

// =========================================================================
// Routing
// =========================================================================

#[tokio::test]
async fn scores_branch_to_score_or_notify_per_order() {
    let registry = registry();
    registry.register(order_flow("notify", false)).unwrap();
    let bus = EventBus::new();

    let result: EventFlowResult = Invocation::new("event-flow", batch())
        .with_registry(registry)
        .with_event_bus(bus.clone())
        .run_as()
        .await
        .unwrap();

    assert_eq!(result.invocations, 6);
    assert_eq!(tiles_for(&result, "A-1"), vec!["fetch", "score", "notify"]);
    assert_eq!(tiles_for(&result, "B-2"), vec!["fetch", "notify"]);
    assert_eq!(tiles_for(&result, "default"), vec!["ingest"]);

    let triggers: Vec<_> = result.histories["A-1"].iter().map(|s| s.trigger.as_str()).collect();
    assert_eq!(
        triggers,
        vec!["flow.order.received", "flow.fetch.completed", "flow.score.completed"]
    );
    assert_eq!(bus.subscriber_count("flow.fetch.completed"), 0);
}

#[tokio::test]
async fn identical_inputs_produce_identical_histories() {
    let registry = registry();
    registry.register(order_flow("notify", false)).unwrap();
    let state = SharedState::new();

    let mut runs = Vec::new();
    for _ in 0..2 {
        let result: EventFlowResult = Invocation::new("event-flow", batch())
            .with_registry(registry.clone())
            .with_event_bus(EventBus::new())
            .with_state(state.clone())
            .run_as()
            .await
            .unwrap();
        runs.push(result);
    }

    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn fetch_entry_with_high_score_routes_through_score_twice_alike() {
    let registry = registry();
    registry.register(order_flow("notify", false)).unwrap();
    let payload = json!({"entry_tile": "fetch", "entry_payload": {"order_id": "A-1", "score": 42}});

    let mut runs = Vec::new();
    for _ in 0..2 {
        let result: EventFlowResult = Invocation::new("event-flow", payload.clone())
            .with_registry(registry.clone())
            .with_event_bus(EventBus::new())
            .run_as()
            .await
            .unwrap();
        runs.push(result);
    }

    assert_eq!(tiles_for(&runs[0], "A-1"), vec!["fetch", "score", "notify"]);
    assert_eq!(runs[0].histories, runs[1].histories);
}

// =========================================================================
// Failures and limits
// =========================================================================

#[tokio::test]
async fn routed_failure_fails_the_flow_and_detaches_listeners() {
    let registry = registry();
    registry.register(order_flow("notify-broken", false)).unwrap();
    let bus = EventBus::new();

    let err = Invocation::new("event-flow", batch())
        .with_registry(registry)
        .with_event_bus(bus.clone())
        .run()
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::Execution);
    assert_eq!(err.tile(), Some("event-flow"));
    assert!(err.to_string().contains("notification channel is down"));
    assert_eq!(bus.subscriber_count("flow.order.received"), 0);
}

#[tokio::test]
async fn tolerated_failures_are_recorded_in_history() {
    let registry = registry();
    registry.register(order_flow("notify-broken", true)).unwrap();

    let result: EventFlowResult = Invocation::new("event-flow", batch())
        .with_registry(registry)
        .with_event_bus(EventBus::new())
        .run_as()
        .await
        .unwrap();

    let last = result.histories["B-2"].last().unwrap();
    assert_eq!(last.tile, "notify-broken");
    assert!(last.output.is_none());
    assert!(last.error.as_deref().unwrap().contains("notification channel is down"));
}

#[tokio::test]
async fn runaway_routing_hits_the_invocation_cap() {
    let registry = registry();
    let looping = register_event_flow([Subscription::new("flow.fetch.completed", |_, _, payload| {
        Ok(Route::invoke("fetch", payload.clone()))
    })])
    .named("looping-flow")
    .with_max_invocations(10);
    registry.register(looping).unwrap();

    let err = Invocation::new(
        "looping-flow",
        json!({"entry_tile": "fetch", "entry_payload": {"order_id": "L-1", "score": 1}}),
    )
    .with_registry(registry)
    .with_event_bus(EventBus::new())
    .run()
    .await
    .unwrap_err();

    assert!(err.to_string().contains("exceeded 10 invocations"));
}
