//! Telemetry collaborator: anything that can take an event name and fields.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

/// External telemetry provider. The bus forwards every emission to its sink
/// after recording and before notifying subscribers.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &str, fields: &Value);
}

/// Fallback sink that logs through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &str, fields: &Value) {
        info!(target: "tileable::telemetry", event, fields = %fields, "telemetry");
    }
}

impl<T: TelemetrySink + ?Sized> TelemetrySink for Arc<T> {
    fn emit(&self, event: &str, fields: &Value) {
        (**self).emit(event, fields)
    }
}
