//! Per-invocation context: injected services, shared state and the bus.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use tileable_events::EventBus;

use crate::error::ServiceError;
use crate::invoke::Invocation;
use crate::plugins::PluginManager;
use crate::registry::Registry;
use crate::tile::TileRef;

type ServiceObject = Arc<dyn Any + Send + Sync>;

/// Named service objects. Read-mostly during execution and cheap to clone.
#[derive(Clone, Default)]
pub struct Services {
    entries: HashMap<String, ServiceObject>,
}

impl Services {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<T: Any + Send + Sync>(mut self, name: impl Into<String>, service: T) -> Self {
        self.insert(name, service);
        self
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, name: impl Into<String>, service: T) {
        self.entries.insert(name.into(), Arc::new(service));
    }

    /// Insert an already-shared service without re-wrapping it.
    pub fn insert_shared<T: Any + Send + Sync>(&mut self, name: impl Into<String>, service: Arc<T>) {
        self.entries.insert(name.into(), service);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        let entry = self.entries.get(name).ok_or_else(|| ServiceError::Missing {
            name: name.to_string(),
        })?;
        Arc::clone(entry)
            .downcast::<T>()
            .map_err(|_| ServiceError::WrongType {
                name: name.to_string(),
                expected: type_name::<T>(),
            })
    }

    pub fn get_or<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.get(name).ok()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Sorted service names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().cloned().collect();
        names.sort();
        names
    }

    /// Overlay `other` on top of `self`; `other` wins on name clashes.
    pub fn merge(&mut self, other: &Services) {
        for (name, service) in &other.entries {
            self.entries.insert(name.clone(), Arc::clone(service));
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.names()).finish()
    }
}

/// Mutable name → value mapping shared by every invocation handed the same
/// handle. The lock is held only inside a single accessor call; callers
/// running invocations in parallel on one state coordinate their own writes.
#[derive(Clone, Default)]
pub struct SharedState {
    inner: Arc<Mutex<Map<String, Value>>>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(map: Map<String, Value>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.lock().insert(key.into(), value)
    }

    pub fn set<T: Serialize>(&self, key: impl Into<String>, value: &T) -> anyhow::Result<()> {
        let value = serde_json::to_value(value)?;
        self.insert(key, value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Add one to an integer counter, starting from zero. Returns the new value.
    pub fn increment(&self, key: &str) -> i64 {
        self.update(|map| {
            let next = map.get(key).and_then(Value::as_i64).unwrap_or(0) + 1;
            map.insert(key.to_string(), Value::from(next));
            next
        })
    }

    /// Run `f` with exclusive access to the map.
    pub fn update<R>(&self, f: impl FnOnce(&mut Map<String, Value>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().clone()
    }

    pub fn ptr_eq(&self, other: &SharedState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for SharedState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SharedState").field(&*self.lock()).finish()
    }
}

/// Everything a tile sees while it runs.
#[derive(Clone)]
pub struct TileContext {
    tile: String,
    run_id: Uuid,
    services: Services,
    state: SharedState,
    bus: EventBus,
    registry: Registry,
    plugins: PluginManager,
}

impl TileContext {
    pub fn new(
        tile: impl Into<String>,
        services: Services,
        state: SharedState,
        bus: EventBus,
        registry: Registry,
        plugins: PluginManager,
    ) -> Self {
        Self {
            tile: tile.into(),
            run_id: Uuid::new_v4(),
            services,
            state,
            bus,
            registry,
            plugins,
        }
    }

    pub fn tile_name(&self) -> &str {
        &self.tile
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    pub fn service<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ServiceError> {
        self.services.get(name)
    }

    pub fn service_or<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        self.services.get_or(name)
    }

    pub fn has_service(&self, name: &str) -> bool {
        self.services.contains(name)
    }

    /// Only reachable before execution starts, i.e. from plugin startup hooks.
    pub fn set_service<T: Any + Send + Sync>(&mut self, name: impl Into<String>, service: T) {
        self.services.insert(name, service);
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn plugins(&self) -> &PluginManager {
        &self.plugins
    }

    /// Emit on the active bus and wait for every subscriber to finish.
    pub async fn emit(&self, event: &str, payload: Value) -> anyhow::Result<()> {
        self.bus.emit(event, payload).await?;
        Ok(())
    }

    /// `emit` for blocking tiles.
    pub fn emit_blocking(&self, event: &str, payload: Value) -> anyhow::Result<()> {
        self.block_on(self.emit(event, payload))
    }

    /// Drive a future to completion from a blocking tile. Must not be called
    /// from async code.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle.block_on(fut),
            Err(_) => futures::executor::block_on(fut),
        }
    }

    /// A nested invocation that inherits this context's bus, registry,
    /// plugins, services and state.
    pub fn invocation(&self, target: impl Into<TileRef>, payload: Value) -> Invocation {
        Invocation::new(target, payload)
            .with_event_bus(self.bus.clone())
            .with_registry(self.registry.clone())
            .with_plugins(self.plugins.clone())
            .with_services(self.services.clone())
            .with_state(self.state.clone())
    }
}

impl std::fmt::Debug for TileContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TileContext")
            .field("tile", &self.tile)
            .field("run_id", &self.run_id)
            .field("services", &self.services)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn services_merge_lets_overrides_win() {
        let mut base = Services::new()
            .with("prefix", "Hi".to_string())
            .with("limit", 3_u32);
        let overrides = Services::new().with("prefix", "Yo".to_string());
        base.merge(&overrides);

        assert_eq!(*base.get::<String>("prefix").unwrap(), "Yo");
        assert_eq!(*base.get::<u32>("limit").unwrap(), 3);
        assert_eq!(base.names(), vec!["limit", "prefix"]);
    }

    #[test]
    fn service_lookup_reports_missing_and_wrong_type() {
        let services = Services::new().with("limit", 3_u32);

        assert!(matches!(
            services.get::<u32>("absent"),
            Err(ServiceError::Missing { .. })
        ));
        assert!(matches!(
            services.get::<String>("limit"),
            Err(ServiceError::WrongType { .. })
        ));
    }

    #[test]
    fn cloned_state_shares_the_map() {
        let state = SharedState::new();
        let other = state.clone();

        assert_eq!(state.increment("runs"), 1);
        assert_eq!(other.increment("runs"), 2);
        other.set("history", &vec!["fetch"]).unwrap();

        assert!(state.ptr_eq(&other));
        assert_eq!(state.get("history"), Some(json!(["fetch"])));
        assert_eq!(
            state.get_as::<Vec<String>>("history").unwrap(),
            Some(vec!["fetch".to_string()])
        );
    }
}
