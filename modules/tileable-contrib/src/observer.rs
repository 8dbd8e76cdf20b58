//! Telemetry wrapper: run a tile and report start, finish and duration.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use tileable_engine::{handle, Plugin, Tile, TileContext, TileHandle};
use tileable_events::{names, TelemetrySink, TracingSink};

/// Service name the sink is looked up under.
pub const TELEMETRY_SERVICE: &str = "telemetry";

/// The service value stored under [`TELEMETRY_SERVICE`].
pub type SharedSink = Arc<dyn TelemetrySink>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverPayload {
    pub tile: String,
    #[serde(default)]
    pub payload: Value,
    /// Extra fields attached to every observer event.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObserverResult {
    pub result: Value,
    pub duration_ms: u64,
    pub metadata: Map<String, Value>,
}

/// Invokes a tile and reports `tile.observer.*` events to the telemetry
/// sink and the bus.
#[derive(Debug, Default)]
pub struct ObserverTile;

async fn report(ctx: &TileContext, sink: &SharedSink, event: &str, fields: Value) -> anyhow::Result<()> {
    sink.emit(event, &fields);
    ctx.emit(event, fields).await
}

#[async_trait]
impl Tile for ObserverTile {
    type Payload = ObserverPayload;
    type Output = ObserverResult;

    fn name(&self) -> &str {
        "observer"
    }

    fn description(&self) -> Option<&str> {
        Some("Wrap a tile execution with telemetry events")
    }

    async fn execute(&self, payload: ObserverPayload, ctx: &TileContext) -> anyhow::Result<ObserverResult> {
        let sink: SharedSink = match ctx.service_or::<SharedSink>(TELEMETRY_SERVICE) {
            Some(sink) => SharedSink::clone(&sink),
            None => Arc::new(TracingSink),
        };

        let mut metadata = payload.metadata;
        metadata.insert("tile".to_string(), Value::String(payload.tile.clone()));

        report(ctx, &sink, names::OBSERVER_STARTED, json!({"tile": payload.tile, "metadata": metadata})).await?;

        let started_at = Instant::now();
        let outcome = ctx
            .invocation(payload.tile.as_str(), payload.payload)
            .run()
            .await;
        let duration_ms = started_at.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                let fields = json!({
                    "tile": payload.tile,
                    "metadata": metadata,
                    "duration_ms": duration_ms,
                });
                report(ctx, &sink, names::OBSERVER_COMPLETED, fields).await?;
                Ok(ObserverResult {
                    result,
                    duration_ms,
                    metadata,
                })
            }
            Err(error) => {
                let fields = json!({
                    "tile": payload.tile,
                    "metadata": metadata,
                    "duration_ms": duration_ms,
                    "kind": error.kind(),
                    "error": error.to_string(),
                });
                report(ctx, &sink, names::OBSERVER_FAILED, fields).await?;
                Err(error.into())
            }
        }
    }
}

/// Contributes [`ObserverTile`] and makes sure a sink is in every context.
pub struct ObserverPlugin {
    sink: SharedSink,
}

impl ObserverPlugin {
    pub fn new(sink: SharedSink) -> Self {
        Self { sink }
    }
}

impl Default for ObserverPlugin {
    fn default() -> Self {
        Self::new(Arc::new(TracingSink))
    }
}

impl Plugin for ObserverPlugin {
    fn name(&self) -> &str {
        "observer"
    }

    fn tiles(&self) -> Vec<TileHandle> {
        vec![handle(ObserverTile)]
    }

    fn on_startup(&self, ctx: &mut TileContext) -> anyhow::Result<()> {
        if !ctx.has_service(TELEMETRY_SERVICE) {
            ctx.set_service(TELEMETRY_SERVICE, Arc::clone(&self.sink));
        }
        Ok(())
    }
}
