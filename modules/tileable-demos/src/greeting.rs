//! The greeting tile, a plugin that contributes it, and the service the
//! plugin seeds for it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use tileable_engine::{
    handle, names, EventBus, EventFilter, Invocation, Plugin, PluginManager, Registry, Services,
    SharedState, Tile, TileContext, TileError, TileHandle,
};

/// Service holding the greeting prefix (`String`).
pub const PREFIX_SERVICE: &str = "greeting.prefix";
pub const DEFAULT_PREFIX: &str = "Hi";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GreetingPayload {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GreetingResult {
    pub message: String,
}

#[derive(Debug, Default)]
pub struct GreetingTile;

#[async_trait]
impl Tile for GreetingTile {
    type Payload = GreetingPayload;
    type Output = GreetingResult;

    fn name(&self) -> &str {
        "greeting"
    }

    fn description(&self) -> Option<&str> {
        Some("Greet someone by name")
    }

    fn validate(&self, payload: &GreetingPayload) -> anyhow::Result<()> {
        anyhow::ensure!(!payload.name.trim().is_empty(), "name must not be blank");
        Ok(())
    }

    async fn execute(&self, payload: GreetingPayload, ctx: &TileContext) -> anyhow::Result<GreetingResult> {
        let prefix = ctx
            .service_or::<String>(PREFIX_SERVICE)
            .map(|prefix| prefix.to_string())
            .unwrap_or_else(|| DEFAULT_PREFIX.to_string());

        ctx.state().increment("runs");
        ctx.emit(names::TILE_DEBUG, json!({"tile": "greeting", "name": payload.name}))
            .await?;

        Ok(GreetingResult {
            message: format!("{prefix}, {}!", payload.name),
        })
    }
}

/// Contributes [`GreetingTile`] and seeds its prefix.
#[derive(Debug, Clone)]
pub struct GreetingPlugin {
    prefix: String,
}

impl GreetingPlugin {
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for GreetingPlugin {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_PREFIX)
    }
}

impl Plugin for GreetingPlugin {
    fn name(&self) -> &str {
        "greeting"
    }

    fn tiles(&self) -> Vec<TileHandle> {
        vec![handle(GreetingTile)]
    }

    fn services(&self) -> Services {
        Services::new().with(PREFIX_SERVICE, self.prefix.clone())
    }
}

/// Greet `name` through a plugin carrying `prefix`. Nothing is registered
/// by hand: the tile is resolved from the plugin's contributions.
pub async fn run_greeting(prefix: &str, name: &str) -> Result<GreetingResult, TileError> {
    let plugins = PluginManager::new();
    plugins.register(GreetingPlugin::with_prefix(prefix));

    Invocation::serialize(
        "greeting",
        &GreetingPayload {
            name: name.to_string(),
        },
    )?
    .with_registry(Registry::new())
    .with_plugins(plugins)
    .with_event_bus(EventBus::new())
    .run_as()
    .await
}

/// What [`showcase`] observed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Showcase {
    pub result: GreetingResult,
    pub debug_events: Vec<Value>,
    pub state: Map<String, Value>,
}

/// Run the greeting with an explicit registry, bus and state and collect
/// the debug events and final state it produced.
pub async fn showcase(name: &str) -> Result<Showcase, TileError> {
    let registry = Registry::new();
    registry.register(GreetingTile)?;
    let bus = EventBus::new();
    let state = SharedState::new();
    let debug = bus.record(EventFilter::only([names::TILE_DEBUG]));

    let result = Invocation::serialize(
        "greeting",
        &GreetingPayload {
            name: name.to_string(),
        },
    )?
    .with_registry(registry)
    .with_event_bus(bus)
    .with_state(state.clone())
    .run_as()
    .await?;

    Ok(Showcase {
        result,
        debug_events: debug.payloads(names::TILE_DEBUG),
        state: state.snapshot(),
    })
}
