//! Tile traits and the type-erased handle the registry stores.
//!
//! Tiles declare concrete payload and output types. At the engine boundary
//! both cross as `serde_json::Value` and are checked structurally by
//! deserializing into the declared type, so a tile only ever sees a payload
//! of its own type and callers only ever see its declared output.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::context::TileContext;
use crate::error::TileError;
use crate::overrides;

/// A suspension-capable unit of work, awaited on the caller's scheduler.
#[async_trait]
pub trait Tile: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    /// Unique registry name.
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    /// Semantic checks beyond the structural type check. Runs before any
    /// lifecycle event is emitted.
    fn validate(&self, _payload: &Self::Payload) -> anyhow::Result<()> {
        Ok(())
    }

    async fn execute(&self, payload: Self::Payload, ctx: &TileContext)
        -> anyhow::Result<Self::Output>;
}

/// A blocking unit of work. Runs on the runtime's blocking pool so it never
/// stalls the cooperative scheduler.
pub trait BlockingTile: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;
    type Output: Serialize + Send + 'static;

    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn validate(&self, _payload: &Self::Payload) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&self, payload: Self::Payload, ctx: &TileContext) -> anyhow::Result<Self::Output>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStyle {
    Suspending,
    Blocking,
}

/// Object-safe view over either tile flavour. Payloads and outputs are JSON.
#[async_trait]
pub trait DynTile: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str>;

    fn style(&self) -> ExecutionStyle;

    /// Structural and semantic validation of an incoming payload.
    fn validate(&self, payload: &Value) -> Result<(), TileError>;

    async fn execute(&self, payload: Value, ctx: &TileContext) -> Result<Value, TileError>;
}

impl std::fmt::Debug for dyn DynTile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynTile")
            .field("name", &self.name())
            .field("style", &self.style())
            .finish()
    }
}

pub type TileHandle = Arc<dyn DynTile>;

/// Erase a suspension-capable tile.
pub fn handle<T: Tile>(tile: T) -> TileHandle {
    Arc::new(Suspending(tile))
}

/// Erase a blocking tile.
pub fn blocking_handle<T: BlockingTile>(tile: T) -> TileHandle {
    Arc::new(Blocking(Arc::new(tile)))
}

fn decode<P: DeserializeOwned>(tile: &str, payload: Value) -> Result<P, TileError> {
    serde_json::from_value(payload)
        .map_err(|e| TileError::validation(tile, format!("payload does not match: {e}")))
}

fn encode<O: Serialize>(tile: &str, output: &O) -> Result<Value, TileError> {
    serde_json::to_value(output)
        .map_err(|e| TileError::validation(tile, format!("output could not be serialized: {e}")))
}

struct Suspending<T>(T);

#[async_trait]
impl<T: Tile> DynTile for Suspending<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> Option<&str> {
        self.0.description()
    }

    fn style(&self) -> ExecutionStyle {
        ExecutionStyle::Suspending
    }

    fn validate(&self, payload: &Value) -> Result<(), TileError> {
        let name = self.0.name();
        let typed: T::Payload = decode(name, payload.clone())?;
        self.0
            .validate(&typed)
            .map_err(|e| TileError::validation(name, e.to_string()))
    }

    async fn execute(&self, payload: Value, ctx: &TileContext) -> Result<Value, TileError> {
        let name = self.0.name();
        let typed: T::Payload = decode(name, payload)?;
        let output = self
            .0
            .execute(typed, ctx)
            .await
            .map_err(|e| TileError::execution(name, e))?;
        encode(name, &output)
    }
}

struct Blocking<T>(Arc<T>);

#[async_trait]
impl<T: BlockingTile> DynTile for Blocking<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn description(&self) -> Option<&str> {
        self.0.description()
    }

    fn style(&self) -> ExecutionStyle {
        ExecutionStyle::Blocking
    }

    fn validate(&self, payload: &Value) -> Result<(), TileError> {
        let name = self.0.name();
        let typed: T::Payload = decode(name, payload.clone())?;
        self.0
            .validate(&typed)
            .map_err(|e| TileError::validation(name, e.to_string()))
    }

    async fn execute(&self, payload: Value, ctx: &TileContext) -> Result<Value, TileError> {
        let name = self.0.name().to_string();
        let typed: T::Payload = decode(&name, payload)?;
        let tile = Arc::clone(&self.0);
        let ctx = ctx.clone();
        // The blocking thread has no task-locals; carry the caller's defaults over.
        let defaults = overrides::current();

        let output = tokio::task::spawn_blocking(move || {
            let _scope = defaults.enter();
            tile.execute(typed, &ctx)
        })
        .await
        .map_err(|e| TileError::execution(&name, anyhow::anyhow!("blocking task aborted: {e}")))?
        .map_err(|e| TileError::execution(&name, e))?;

        encode(&name, &output)
    }
}

/// Invocation target: a registry name or a tile passed directly.
#[derive(Clone)]
pub enum TileRef {
    Name(String),
    Direct(TileHandle),
}

impl TileRef {
    pub fn direct<T: Tile>(tile: T) -> Self {
        TileRef::Direct(handle(tile))
    }

    pub fn blocking<T: BlockingTile>(tile: T) -> Self {
        TileRef::Direct(blocking_handle(tile))
    }

    /// Name used in logs and errors before resolution.
    pub fn label(&self) -> &str {
        match self {
            TileRef::Name(name) => name.as_str(),
            TileRef::Direct(tile) => tile.name(),
        }
    }
}

impl std::fmt::Debug for TileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TileRef::Name(name) => f.debug_tuple("Name").field(name).finish(),
            TileRef::Direct(tile) => f.debug_tuple("Direct").field(&tile.name()).finish(),
        }
    }
}

impl From<&str> for TileRef {
    fn from(name: &str) -> Self {
        TileRef::Name(name.to_string())
    }
}

impl From<String> for TileRef {
    fn from(name: String) -> Self {
        TileRef::Name(name)
    }
}

impl From<&String> for TileRef {
    fn from(name: &String) -> Self {
        TileRef::Name(name.clone())
    }
}

impl From<TileHandle> for TileRef {
    fn from(tile: TileHandle) -> Self {
        TileRef::Direct(tile)
    }
}
