//! Plugins contribute tiles and service seeds, and can hook into every
//! invocation's lifecycle.
//!
//! The manager keeps plugins in registration order. Every fold over that
//! list is last-write-wins: a later plugin's tile or service replaces an
//! earlier one with the same name.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::context::{Services, TileContext};
use crate::error::TileError;
use crate::tile::TileHandle;

pub trait Plugin: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn tiles(&self) -> Vec<TileHandle> {
        Vec::new()
    }

    /// Services seeded into every context built while this plugin is active.
    fn services(&self) -> Services {
        Services::new()
    }

    /// Runs after `tile.started`, before execution. May add services.
    fn on_startup(&self, _ctx: &mut TileContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs after a successful execution, before `tile.completed`.
    fn on_shutdown(&self, _ctx: &TileContext, _output: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Runs once a failure is final, before `tile.failed`. An error here is
    /// logged; the caller still receives the original failure.
    fn on_failure(&self, _ctx: &TileContext, _error: &TileError) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<P: Plugin> Plugin for Arc<P> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn tiles(&self) -> Vec<TileHandle> {
        (**self).tiles()
    }

    fn services(&self) -> Services {
        (**self).services()
    }

    fn on_startup(&self, ctx: &mut TileContext) -> anyhow::Result<()> {
        (**self).on_startup(ctx)
    }

    fn on_shutdown(&self, ctx: &TileContext, output: &Value) -> anyhow::Result<()> {
        (**self).on_shutdown(ctx, output)
    }

    fn on_failure(&self, ctx: &TileContext, error: &TileError) -> anyhow::Result<()> {
        (**self).on_failure(ctx, error)
    }
}

/// Ordered plugin list. Cloning yields another handle to the same list.
#[derive(Clone, Default)]
pub struct PluginManager {
    plugins: Arc<RwLock<Vec<Arc<dyn Plugin>>>>,
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: Plugin>(&self, plugin: P) {
        self.register_arc(Arc::new(plugin));
    }

    pub fn register_arc(&self, plugin: Arc<dyn Plugin>) {
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(plugin);
    }

    /// Snapshot in registration order.
    pub fn plugins(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn names(&self) -> Vec<String> {
        self.plugins().iter().map(|p| p.name().to_string()).collect()
    }

    /// Tile named `name` from the last plugin that contributes one, with that plugin's name.
    pub fn contributed_tile(&self, name: &str) -> Option<(TileHandle, String)> {
        self.plugins().iter().rev().find_map(|plugin| {
            plugin
                .tiles()
                .into_iter()
                .find(|tile| tile.name() == name)
                .map(|tile| (tile, plugin.name().to_string()))
        })
    }

    pub fn contributed_tiles(&self) -> BTreeMap<String, TileHandle> {
        let mut tiles = BTreeMap::new();
        for plugin in self.plugins() {
            for tile in plugin.tiles() {
                tiles.insert(tile.name().to_string(), tile);
            }
        }
        tiles
    }

    pub fn seeded_services(&self) -> Services {
        self.plugins()
            .iter()
            .fold(Services::new(), |mut merged, plugin| {
                merged.merge(&plugin.services());
                merged
            })
    }

    pub fn len(&self) -> usize {
        self.plugins.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ptr_eq(&self, other: &PluginManager) -> bool {
        Arc::ptr_eq(&self.plugins, &other.plugins)
    }
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PluginManager").field(&self.names()).finish()
    }
}
