use thiserror::Error;

/// Boxed error carried across the bus boundary.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum BusError {
    /// A subscriber returned an error; later subscribers were not notified.
    #[error("handler for '{event}' failed: {source}")]
    Handler {
        event: String,
        #[source]
        source: BoxError,
    },
}

impl BusError {
    pub fn event(&self) -> &str {
        match self {
            BusError::Handler { event, .. } => event,
        }
    }
}
