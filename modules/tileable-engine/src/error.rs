//! Typed errors for tile resolution, validation and execution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tileable_events::BusError;

/// Boxed error carried inside `TileError`.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Coarse classification of a failure. Reported in `tile.failed` events and
/// matched by retry allow/deny lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NotFound,
    DuplicateName,
    Registration,
    Validation,
    Execution,
    RetryExhausted,
    Plugin,
    Handler,
    ReplayMismatch,
    Runtime,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NotFound => "not_found",
            FailureKind::DuplicateName => "duplicate_name",
            FailureKind::Registration => "registration",
            FailureKind::Validation => "validation",
            FailureKind::Execution => "execution",
            FailureKind::RetryExhausted => "retry_exhausted",
            FailureKind::Plugin => "plugin",
            FailureKind::Handler => "handler",
            FailureKind::ReplayMismatch => "replay_mismatch",
            FailureKind::Runtime => "runtime",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum TileError {
    /// Target could not be resolved through the registry or plugins
    #[error("tile '{name}' is not registered")]
    NotFound { name: String },

    /// Strict registry refused to overwrite an existing name
    #[error("tile '{name}' is already registered")]
    DuplicateName { name: String },

    #[error("cannot register tile: {reason}")]
    Registration { reason: String },

    /// Payload or output did not match the tile's declared type
    #[error("validation failed for tile '{tile}': {message}")]
    Validation { tile: String, message: String },

    /// The tile's `execute` returned an error
    #[error("tile '{tile}' failed: {source}")]
    Execution {
        tile: String,
        category: String,
        #[source]
        source: BoxError,
    },

    /// Every attempt allowed by a retry policy failed
    #[error("tile '{tile}' exhausted {attempts} attempts: {last}")]
    RetryExhausted {
        tile: String,
        attempts: u32,
        #[source]
        last: Box<TileError>,
    },

    /// A plugin lifecycle hook failed
    #[error("plugin '{plugin}' failed in {hook} for tile '{tile}': {source}")]
    Plugin {
        tile: String,
        plugin: String,
        hook: &'static str,
        #[source]
        source: BoxError,
    },

    /// A bus subscriber failed while a lifecycle event was dispatched
    #[error("event handler failed while running tile '{tile}': {source}")]
    Handler {
        tile: String,
        #[source]
        source: BusError,
    },

    /// Replay finished but the fresh run diverged from the seed
    #[error("replay of tile '{tile}' diverged: {}", .mismatches.join("; "))]
    ReplayMismatch {
        tile: String,
        mismatches: Vec<String>,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl TileError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TileError::NotFound { .. } => FailureKind::NotFound,
            TileError::DuplicateName { .. } => FailureKind::DuplicateName,
            TileError::Registration { .. } => FailureKind::Registration,
            TileError::Validation { .. } => FailureKind::Validation,
            TileError::Execution { .. } => FailureKind::Execution,
            TileError::RetryExhausted { .. } => FailureKind::RetryExhausted,
            TileError::Plugin { .. } => FailureKind::Plugin,
            TileError::Handler { .. } => FailureKind::Handler,
            TileError::ReplayMismatch { .. } => FailureKind::ReplayMismatch,
            TileError::Runtime(_) => FailureKind::Runtime,
        }
    }

    /// Retry category: the tag attached by the tile for execution failures,
    /// the kind string otherwise.
    pub fn category(&self) -> &str {
        match self {
            TileError::Execution { category, .. } => category.as_str(),
            other => other.kind().as_str(),
        }
    }

    /// Name of the tile the failure originated in, when known.
    pub fn tile(&self) -> Option<&str> {
        match self {
            TileError::NotFound { name } | TileError::DuplicateName { name } => Some(name.as_str()),
            TileError::Validation { tile, .. }
            | TileError::Execution { tile, .. }
            | TileError::RetryExhausted { tile, .. }
            | TileError::Plugin { tile, .. }
            | TileError::Handler { tile, .. }
            | TileError::ReplayMismatch { tile, .. } => Some(tile.as_str()),
            TileError::Registration { .. } | TileError::Runtime(_) => None,
        }
    }

    pub(crate) fn validation(tile: &str, message: impl Into<String>) -> Self {
        TileError::Validation {
            tile: tile.to_string(),
            message: message.into(),
        }
    }

    /// Wrap an error returned from a tile body.
    pub fn execution(tile: &str, error: anyhow::Error) -> Self {
        let category = if let Some(tagged) = error.downcast_ref::<Categorized>() {
            tagged.category.clone()
        } else if let Some(nested) = error.downcast_ref::<TileError>() {
            nested.category().to_string()
        } else if error.downcast_ref::<ServiceError>().is_some() {
            "service".to_string()
        } else {
            FailureKind::Execution.as_str().to_string()
        };
        TileError::Execution {
            tile: tile.to_string(),
            category,
            source: error.into(),
        }
    }
}

/// Tags a tile failure with a category that retry policies can match on,
/// e.g. `timeout` or `transient`.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct Categorized {
    pub category: String,
    pub message: String,
}

impl Categorized {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Service lookup failures inside a tile context.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service '{name}' is not available")]
    Missing { name: String },

    #[error("service '{name}' is not a {expected}")]
    WrongType { name: String, expected: &'static str },
}
