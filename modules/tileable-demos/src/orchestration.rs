//! An order pipeline routed through an event flow.
//!
//! `orders.ingest` announces every order id. Each order is fetched; orders
//! scoring at least [`VIP_THRESHOLD`] are scored into the VIP segment, the
//! rest go straight to notification. Every order ends with a notification.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use tileable_contrib::{register_event_flow, EventFlowResult, EventFlowTile, FlowStep, Route, Subscription};
use tileable_engine::{EventBus, Invocation, Registry, RuntimeConfig, SharedState, Tile, TileContext};

pub const VIP_THRESHOLD: i64 = 40;

pub const ORDER_RECEIVED: &str = "order.received";
pub const ORDER_FETCHED: &str = "order.fetched";
pub const ORDER_SCORED: &str = "order.scored";

pub const PIPELINE: &str = "orders.pipeline";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Vip,
    Standard,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestPayload {
    pub order_ids: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchPayload {
    pub order_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: u64,
    pub total_cents: u64,
    pub score: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorePayload {
    pub order_id: u64,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreResult {
    pub order_id: u64,
    pub segment: Segment,
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyPayload {
    pub order_id: u64,
    pub segment: Segment,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub order_id: u64,
    pub channel: String,
}

/// Announces each order on the bus.
pub struct IngestTile;

#[async_trait]
impl Tile for IngestTile {
    type Payload = IngestPayload;
    type Output = usize;

    fn name(&self) -> &str {
        "orders.ingest"
    }

    async fn execute(&self, payload: IngestPayload, ctx: &TileContext) -> anyhow::Result<usize> {
        for order_id in &payload.order_ids {
            ctx.emit(ORDER_RECEIVED, json!({"tile": "orders.ingest", "order_id": order_id}))
                .await?;
        }
        Ok(payload.order_ids.len())
    }
}

/// Looks an order up. Orders are synthesized from their id so runs repeat.
pub struct FetchTile;

#[async_trait]
impl Tile for FetchTile {
    type Payload = FetchPayload;
    type Output = Order;

    fn name(&self) -> &str {
        "orders.fetch"
    }

    async fn execute(&self, payload: FetchPayload, ctx: &TileContext) -> anyhow::Result<Order> {
        let order = Order {
            order_id: payload.order_id,
            total_cents: payload.order_id.saturating_mul(1_250),
            score: (((payload.order_id % 100) * 37 + 11) % 100) as i64,
        };
        ctx.emit(
            ORDER_FETCHED,
            json!({"tile": "orders.fetch", "order_id": order.order_id, "score": order.score}),
        )
        .await?;
        Ok(order)
    }
}

pub struct ScoreTile;

#[async_trait]
impl Tile for ScoreTile {
    type Payload = ScorePayload;
    type Output = ScoreResult;

    fn name(&self) -> &str {
        "orders.score"
    }

    fn validate(&self, payload: &ScorePayload) -> anyhow::Result<()> {
        anyhow::ensure!(payload.score >= 0, "score must not be negative");
        Ok(())
    }

    async fn execute(&self, payload: ScorePayload, ctx: &TileContext) -> anyhow::Result<ScoreResult> {
        let result = ScoreResult {
            order_id: payload.order_id,
            segment: Segment::Vip,
            priority: payload.score / 10,
        };
        ctx.emit(
            ORDER_SCORED,
            json!({"tile": "orders.score", "order_id": result.order_id, "segment": result.segment}),
        )
        .await?;
        Ok(result)
    }
}

pub struct NotifyTile;

#[async_trait]
impl Tile for NotifyTile {
    type Payload = NotifyPayload;
    type Output = Notification;

    fn name(&self) -> &str {
        "orders.notify"
    }

    async fn execute(&self, payload: NotifyPayload, ctx: &TileContext) -> anyhow::Result<Notification> {
        ctx.state().increment("notifications");
        let channel = match payload.segment {
            Segment::Vip => "phone",
            Segment::Standard => "email",
        };
        Ok(Notification {
            order_id: payload.order_id,
            channel: channel.to_string(),
        })
    }
}

/// The routing rules of the pipeline.
pub fn order_flow() -> EventFlowTile {
    register_event_flow([
        Subscription::new(ORDER_RECEIVED, |_, _, payload| {
            Ok(Route::invoke("orders.fetch", json!({"order_id": payload["order_id"]})))
        }),
        Subscription::new(ORDER_FETCHED, |_, _, payload| {
            let order_id = payload["order_id"].clone();
            let score = payload["score"].as_i64().unwrap_or_default();
            Ok(if score >= VIP_THRESHOLD {
                Route::invoke("orders.score", json!({"order_id": order_id, "score": score}))
            } else {
                Route::invoke(
                    "orders.notify",
                    json!({"order_id": order_id, "segment": Segment::Standard}),
                )
            })
        }),
        Subscription::new(ORDER_SCORED, |_, _, payload| {
            Ok(Route::invoke(
                "orders.notify",
                json!({"order_id": payload["order_id"], "segment": payload["segment"]}),
            ))
        }),
    ])
    .named(PIPELINE)
    .keyed_by("order_id")
}

/// Registry holding the pipeline tiles and the flow that routes them.
pub fn order_registry(config: &RuntimeConfig) -> anyhow::Result<Registry> {
    let registry = Registry::from_config(&config.registry);
    registry.register(IngestTile)?;
    registry.register(FetchTile)?;
    registry.register(ScoreTile)?;
    registry.register(NotifyTile)?;
    registry.register(order_flow().with_config(&config.flow))?;
    Ok(registry)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: u64,
    pub segment: Segment,
    pub history: Vec<FlowStep>,
}

/// Run the pipeline for `order_ids` and summarize each order's history, in
/// the order the ids were given.
pub async fn run_order_pipeline(order_ids: &[u64], config: &RuntimeConfig) -> anyhow::Result<Vec<OrderSummary>> {
    let registry = order_registry(config)?;
    let state = SharedState::new();

    let mut result: EventFlowResult = Invocation::new(
        PIPELINE,
        json!({"entry_tile": "orders.ingest", "entry_payload": {"order_ids": order_ids}}),
    )
    .with_registry(registry)
    .with_event_bus(EventBus::new())
    .with_state(state.clone())
    .run_as()
    .await?;

    info!(
        orders = order_ids.len(),
        invocations = result.invocations,
        notifications = state.get("notifications").and_then(|v| v.as_i64()).unwrap_or(0),
        "Order pipeline finished"
    );

    let summaries = order_ids
        .iter()
        .map(|order_id| {
            let history = result.histories.remove(&order_id.to_string()).unwrap_or_default();
            let segment = if history.iter().any(|step| step.tile == "orders.score") {
                Segment::Vip
            } else {
                Segment::Standard
            };
            OrderSummary {
                order_id: *order_id,
                segment,
                history,
            }
        })
        .collect();
    Ok(summaries)
}
