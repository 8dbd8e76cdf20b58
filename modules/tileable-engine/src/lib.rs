//! Tile runtime: typed units of work resolved through a registry, run with an
//! injected context and reported on an event bus.
//!
//! Callers build an [`Invocation`] (or use [`invoke`]) and the engine takes
//! care of resolution, validation, context construction, plugin hooks and
//! lifecycle events. Defaults can be swapped for a scope with [`Overrides`].

pub mod config;
pub mod context;
pub mod error;
pub mod invoke;
pub mod overrides;
pub mod plugins;
pub mod registry;
pub mod tile;

pub use config::{FlowConfig, RegistryConfig, ReplayConfig, RetryConfig, RuntimeConfig};
pub use context::{Services, SharedState, TileContext};
pub use error::{Categorized, FailureKind, ServiceError, TileError};
pub use invoke::{invoke, invoke_tile, Invocation};
pub use overrides::{
    current, default_event_bus, default_plugins, default_registry, with_overrides, Defaults,
    OverrideGuard, Overrides,
};
pub use plugins::{Plugin, PluginManager};
pub use registry::{Registry, TileRecord};
pub use tile::{
    blocking_handle, handle, BlockingTile, DynTile, ExecutionStyle, Tile, TileHandle, TileRef,
};

pub use tileable_events::{names, EventBus, EventFilter, EventRecord, Recording};
