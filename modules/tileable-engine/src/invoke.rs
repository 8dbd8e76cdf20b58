//! The invocation engine.
//!
//! resolve → validate → build context → `tile.started` → startup hooks →
//! execute → shutdown hooks → `tile.completed`. Any failure after
//! `tile.started` runs the failure hooks, emits `tile.failed` and is returned
//! to the caller unchanged. Resolution and validation failures happen before
//! anything is emitted.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use tileable_events::{names, EventBus};

use crate::context::{Services, SharedState, TileContext};
use crate::error::TileError;
use crate::overrides;
use crate::plugins::{Plugin, PluginManager};
use crate::registry::Registry;
use crate::tile::{handle, Tile, TileHandle, TileRef};

/// One call of one tile. Every collaborator left unset falls back to the
/// defaults active where the invocation runs.
#[derive(Clone)]
pub struct Invocation {
    target: TileRef,
    payload: Value,
    registry: Option<Registry>,
    plugins: Option<PluginManager>,
    bus: Option<EventBus>,
    services: Option<Services>,
    state: Option<SharedState>,
}

impl Invocation {
    pub fn new(target: impl Into<TileRef>, payload: Value) -> Self {
        Self {
            target: target.into(),
            payload,
            registry: None,
            plugins: None,
            bus: None,
            services: None,
            state: None,
        }
    }

    /// Build from any serializable payload.
    pub fn serialize<P: Serialize>(target: impl Into<TileRef>, payload: &P) -> Result<Self, TileError> {
        let target = target.into();
        let payload = serde_json::to_value(payload).map_err(|e| {
            TileError::validation(target.label(), format!("payload could not be serialized: {e}"))
        })?;
        Ok(Self::new(target, payload))
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_plugins(mut self, plugins: PluginManager) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Caller services. Merged over plugin seeds; the caller wins.
    pub fn with_services(mut self, services: Services) -> Self {
        self.services = Some(services);
        self
    }

    pub fn with_state(mut self, state: SharedState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn target(&self) -> &TileRef {
        &self.target
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn state(&self) -> Option<&SharedState> {
        self.state.as_ref()
    }

    /// The bus this invocation would emit on if run here.
    pub fn event_bus(&self) -> EventBus {
        match &self.bus {
            Some(bus) => bus.clone(),
            None => overrides::current().event_bus,
        }
    }

    pub async fn run(self) -> Result<Value, TileError> {
        self.run_with_context().await.map(|(output, _)| output)
    }

    /// Run and decode the output into `R`.
    pub async fn run_as<R: DeserializeOwned>(self) -> Result<R, TileError> {
        let label = self.target.label().to_string();
        let output = self.run().await?;
        serde_json::from_value(output).map_err(|e| {
            TileError::validation(&label, format!("output does not match the requested type: {e}"))
        })
    }

    /// Run and also hand back the context the tile executed with.
    pub async fn run_with_context(self) -> Result<(Value, TileContext), TileError> {
        // 1. Fill unset collaborators from the active defaults
        let defaults = overrides::current();
        let registry = self.registry.unwrap_or(defaults.registry);
        let plugins = self.plugins.unwrap_or(defaults.plugins);
        let bus = self.bus.unwrap_or(defaults.event_bus);

        // 2. Resolve the target
        let tile = resolve(&registry, &plugins, &self.target)?;
        let name = tile.name().to_string();

        // 3. Validate before anything is emitted
        tile.validate(&self.payload)?;

        // 4. Build the context: plugin seeds, then caller services on top
        let mut services = plugins.seeded_services();
        if let Some(caller) = &self.services {
            services.merge(caller);
        }
        let state = self.state.unwrap_or_default();
        let hooks = plugins.plugins();
        let mut ctx = TileContext::new(&name, services, state, bus.clone(), registry, plugins);

        let started_at = Instant::now();
        debug!(tile = %name, run_id = %ctx.run_id(), "Tile started");

        // 5. Announce
        let started = json!({"tile": name, "payload": self.payload});
        if let Err(source) = bus.emit(names::TILE_STARTED, started).await {
            let error = TileError::Handler { tile: name, source };
            return Err(fail(&ctx, &hooks, error).await);
        }

        // 6. Startup hooks
        for plugin in &hooks {
            if let Err(e) = plugin.on_startup(&mut ctx) {
                let error = plugin_error(&name, plugin.as_ref(), "on_startup", e);
                return Err(fail(&ctx, &hooks, error).await);
            }
        }

        // 7. Execute
        let output = match tile.execute(self.payload, &ctx).await {
            Ok(output) => output,
            Err(error) => return Err(fail(&ctx, &hooks, error).await),
        };

        // 8. Shutdown hooks
        for plugin in &hooks {
            if let Err(e) = plugin.on_shutdown(&ctx, &output) {
                let error = plugin_error(&name, plugin.as_ref(), "on_shutdown", e);
                return Err(fail(&ctx, &hooks, error).await);
            }
        }

        // 9. Report completion
        let completed = json!({"tile": name, "result": output});
        bus.emit(names::TILE_COMPLETED, completed)
            .await
            .map_err(|source| TileError::Handler {
                tile: name.clone(),
                source,
            })?;

        debug!(
            tile = %name,
            run_id = %ctx.run_id(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "Tile completed"
        );
        Ok((output, ctx))
    }

    /// Synchronous entry point. Drives the invocation on a fresh
    /// current-thread scheduler; fails if one is already running here.
    pub fn run_blocking(self) -> Result<Value, TileError> {
        self.run_blocking_with_context().map(|(output, _)| output)
    }

    pub fn run_blocking_with_context(self) -> Result<(Value, TileContext), TileError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(TileError::Runtime(
                "run_blocking called from inside an async runtime; await run() instead".to_string(),
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| TileError::Runtime(format!("failed to start scheduler: {e}")))?;
        runtime.block_on(self.run_with_context())
    }
}

impl std::fmt::Debug for Invocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("target", &self.target)
            .field("payload", &self.payload)
            .finish_non_exhaustive()
    }
}

/// Registry first, then plugin contributions.
fn resolve(registry: &Registry, plugins: &PluginManager, target: &TileRef) -> Result<TileHandle, TileError> {
    match registry.resolve(target) {
        Err(TileError::NotFound { name }) => match plugins.contributed_tile(&name) {
            Some((tile, _)) => Ok(tile),
            None => Err(TileError::NotFound { name }),
        },
        resolved => resolved,
    }
}

fn plugin_error(tile: &str, plugin: &dyn Plugin, hook: &'static str, error: anyhow::Error) -> TileError {
    TileError::Plugin {
        tile: tile.to_string(),
        plugin: plugin.name().to_string(),
        hook,
        source: error.into(),
    }
}

async fn fail(ctx: &TileContext, hooks: &[Arc<dyn Plugin>], error: TileError) -> TileError {
    let tile = ctx.tile_name();
    warn!(tile, run_id = %ctx.run_id(), kind = %error.kind(), error = %error, "Tile failed");

    for plugin in hooks {
        if let Err(e) = plugin.on_failure(ctx, &error) {
            let hook_error = plugin_error(tile, plugin.as_ref(), "on_failure", e);
            warn!(tile, plugin = plugin.name(), error = %hook_error, "Failure hook errored");
        }
    }

    let failed = json!({
        "tile": tile,
        "kind": error.kind(),
        "category": error.category(),
        "message": error.to_string(),
    });
    if let Err(e) = ctx.event_bus().emit(names::TILE_FAILED, failed).await {
        warn!(tile, error = %e, "tile.failed handler errored");
    }
    error
}

/// Invoke `target` with the active defaults.
pub async fn invoke(target: impl Into<TileRef>, payload: impl Serialize) -> Result<Value, TileError> {
    Invocation::serialize(target, &payload)?.run().await
}

/// Invoke a tile value directly, bypassing the registry, with typed I/O.
pub async fn invoke_tile<T>(tile: T, payload: T::Payload) -> Result<T::Output, TileError>
where
    T: Tile,
    T::Payload: Serialize,
    T::Output: DeserializeOwned,
{
    Invocation::serialize(handle(tile), &payload)?.run_as().await
}
