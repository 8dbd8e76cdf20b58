//! Name → tile directory used to resolve invocation targets.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RegistryConfig;
use crate::error::TileError;
use crate::tile::{blocking_handle, handle, BlockingTile, ExecutionStyle, Tile, TileHandle, TileRef};

/// Registry listing entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRecord {
    pub name: String,
    pub description: Option<String>,
    /// Who registered the tile: `"direct"` or a plugin name.
    pub source: String,
    pub blocking: bool,
}

struct Entry {
    handle: TileHandle,
    source: String,
}

#[derive(Default)]
struct RegistryInner {
    tiles: HashMap<String, Entry>,
    strict: bool,
}

/// Shared tile directory. Cloning yields another handle to the same map.
///
/// In the default mode re-registering a name replaces the previous tile;
/// a strict registry refuses with [`TileError::DuplicateName`].
#[derive(Clone, Default)]
pub struct Registry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict() -> Self {
        let registry = Self::default();
        registry.write().strict = true;
        registry
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        if config.strict {
            Self::strict()
        } else {
            Self::new()
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_strict(&self) -> bool {
        self.read().strict
    }

    pub fn register<T: Tile>(&self, tile: T) -> Result<(), TileError> {
        self.register_handle(handle(tile), "direct")
    }

    pub fn register_blocking<T: BlockingTile>(&self, tile: T) -> Result<(), TileError> {
        self.register_handle(blocking_handle(tile), "direct")
    }

    pub fn register_handle(&self, tile: TileHandle, source: &str) -> Result<(), TileError> {
        let name = tile.name().to_string();
        if name.trim().is_empty() {
            return Err(TileError::Registration {
                reason: "tile name must not be empty".to_string(),
            });
        }

        let mut inner = self.write();
        if inner.tiles.contains_key(&name) {
            if inner.strict {
                return Err(TileError::DuplicateName { name });
            }
            debug!(tile = %name, source, "Replacing registered tile");
        }
        inner.tiles.insert(
            name,
            Entry {
                handle: tile,
                source: source.to_string(),
            },
        );
        Ok(())
    }

    /// Register several tiles. Stops at the first failure; earlier tiles stay registered.
    pub fn bulk_register<I>(&self, tiles: I, source: &str) -> Result<usize, TileError>
    where
        I: IntoIterator<Item = TileHandle>,
    {
        let mut count = 0;
        for tile in tiles {
            self.register_handle(tile, source)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.write().tiles.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<TileHandle> {
        self.read().tiles.get(name).map(|e| Arc::clone(&e.handle))
    }

    /// Resolve a target. Direct references bypass the registry.
    pub fn resolve(&self, target: &TileRef) -> Result<TileHandle, TileError> {
        match target {
            TileRef::Direct(tile) => Ok(Arc::clone(tile)),
            TileRef::Name(name) => self.get(name).ok_or_else(|| TileError::NotFound {
                name: name.clone(),
            }),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().tiles.contains_key(name)
    }

    pub fn info(&self, name: &str) -> Option<TileRecord> {
        self.read().tiles.get(name).map(|e| record(name, e))
    }

    /// All entries ordered by name.
    pub fn list(&self) -> Vec<TileRecord> {
        let inner = self.read();
        let mut records: Vec<TileRecord> = inner
            .tiles
            .iter()
            .map(|(name, entry)| record(name, entry))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.read().tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().tiles.is_empty()
    }

    pub fn ptr_eq(&self, other: &Registry) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

fn record(name: &str, entry: &Entry) -> TileRecord {
    TileRecord {
        name: name.to_string(),
        description: entry.handle.description().map(str::to_string),
        source: entry.source.clone(),
        blocking: entry.handle.style() == ExecutionStyle::Blocking,
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.read();
        let mut names: Vec<&String> = inner.tiles.keys().collect();
        names.sort();
        f.debug_struct("Registry")
            .field("strict", &inner.strict)
            .field("tiles", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::TileContext;
    use async_trait::async_trait;
    use serde_json::Value;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tile for Named {
        type Payload = Value;
        type Output = String;

        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, _payload: Value, _ctx: &TileContext) -> anyhow::Result<String> {
            Ok(self.1.to_string())
        }
    }

    #[test]
    fn default_registry_overwrites_last_write_wins() {
        let registry = Registry::new();
        registry.register(Named("echo", "first")).unwrap();
        registry.register(Named("echo", "second")).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.resolve(&TileRef::from("echo")).is_ok());
    }

    #[test]
    fn resolved_handles_debug_print_their_name() {
        let registry = Registry::new();
        registry.register(Named("echo", "x")).unwrap();

        let tile = registry.resolve(&TileRef::from("echo")).unwrap();
        let printed = format!("{tile:?}");
        assert!(printed.contains("echo"));
        assert!(printed.contains("Suspending"));
    }

    #[test]
    fn strict_registry_rejects_duplicates() {
        let registry = Registry::strict();
        registry.register(Named("echo", "first")).unwrap();

        let err = registry.register(Named("echo", "second")).unwrap_err();
        assert!(matches!(err, TileError::DuplicateName { ref name } if name == "echo"));
    }

    #[test]
    fn empty_names_are_rejected() {
        let err = Registry::new().register(Named("  ", "x")).unwrap_err();
        assert!(matches!(err, TileError::Registration { .. }));
    }

    #[test]
    fn unregister_then_resolve_is_not_found() {
        let registry = Registry::new();
        registry.register(Named("echo", "x")).unwrap();
        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));

        assert!(matches!(
            registry.resolve(&TileRef::from("echo")),
            Err(TileError::NotFound { .. })
        ));
        let missing = format!("{:?}", registry.resolve(&TileRef::from("echo")));
        assert!(missing.contains("NotFound"));
    }

    #[test]
    fn list_is_sorted_and_reports_source() {
        let registry = Registry::new();
        registry
            .bulk_register([handle(Named("zeta", "z")), handle(Named("alpha", "a"))], "demo")
            .unwrap();

        let names: Vec<_> = registry.list().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
        assert_eq!(registry.info("zeta").unwrap().source, "demo");
    }
}
