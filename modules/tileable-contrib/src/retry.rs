//! Bounded retries with linear backoff and jitter.
//!
//! Attempt `n` that fails with a retryable error is followed by a
//! `tile.retrying` event and a sleep of `backoff * n + rand(0..=jitter)`,
//! capped at `max_backoff`. Non-retryable failures are returned as they are;
//! running out of attempts yields `RetryExhausted` wrapping the last failure.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use tileable_engine::{Invocation, RetryConfig, Tile, TileContext, TileError};
use tileable_events::names;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Treated as at least one.
    pub max_attempts: u32,
    #[serde(rename = "backoff_ms", with = "millis")]
    pub backoff: Duration,
    #[serde(rename = "max_backoff_ms", with = "opt_millis")]
    pub max_backoff: Option<Duration>,
    #[serde(rename = "jitter_ms", with = "millis")]
    pub jitter: Duration,
    /// An attempt running longer than this fails with category `timeout`.
    #[serde(rename = "attempt_timeout_ms", with = "opt_millis")]
    pub attempt_timeout: Option<Duration>,
    /// When set, only these categories or kinds are retried.
    pub retry_on: Option<Vec<String>>,
    /// Categories or kinds that are never retried. Wins over `retry_on`.
    pub never_retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: Duration::from_millis(config.backoff_ms),
            max_backoff: config.max_backoff_ms.map(Duration::from_millis),
            jitter: Duration::from_millis(config.jitter_ms),
            attempt_timeout: config.attempt_timeout_ms.map(Duration::from_millis),
            retry_on: None,
            never_retry_on: config.never_retry_on.clone(),
        }
    }

    pub fn backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_backoff(mut self, cap: Option<Duration>) -> Self {
        self.max_backoff = cap;
        self
    }

    pub fn attempt_timeout(mut self, limit: Duration) -> Self {
        self.attempt_timeout = Some(limit);
        self
    }

    pub fn retry_on<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.retry_on = Some(categories.into_iter().map(Into::into).collect());
        self
    }

    pub fn never_retry_on<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.never_retry_on = categories.into_iter().map(Into::into).collect();
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn is_retryable(&self, error: &TileError) -> bool {
        let category = error.category();
        let kind = error.kind().as_str();
        let listed = |list: &[String]| list.iter().any(|c| c == category || c == kind);

        if listed(&self.never_retry_on) {
            return false;
        }
        match &self.retry_on {
            Some(allowed) => listed(allowed),
            None => true,
        }
    }

    /// Sleep before attempt `attempt + 1`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        };
        let delay = self.backoff.saturating_mul(attempt) + jitter;
        match self.max_backoff {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

/// Output of a successful retried invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryResult {
    pub result: Value,
    pub attempts: u32,
}

/// Run `invocation` under `policy`. Every attempt shares one state; if the
/// invocation carries none, a fresh one is created for the whole run.
pub async fn invoke_with_retry(
    invocation: Invocation,
    policy: &RetryPolicy,
) -> Result<RetryResult, TileError> {
    let state = invocation.state().cloned().unwrap_or_default();
    let bus = invocation.event_bus();
    let invocation = invocation.with_state(state).with_event_bus(bus.clone());
    let tile = invocation.target().label().to_string();
    let max_attempts = policy.attempts();

    let mut attempt = 1;
    loop {
        let error = match run_attempt(invocation.clone(), policy.attempt_timeout, &tile).await {
            Ok(result) => return Ok(RetryResult { result, attempts: attempt }),
            Err(error) => error,
        };

        if !policy.is_retryable(&error) {
            return Err(error);
        }
        if attempt >= max_attempts {
            warn!(tile = %tile, attempts = attempt, error = %error, "Retry attempts exhausted");
            return Err(TileError::RetryExhausted {
                tile,
                attempts: attempt,
                last: Box::new(error),
            });
        }

        let delay = policy.delay_for(attempt);
        warn!(
            tile = %tile,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Tile failed, retrying after backoff"
        );
        let retrying = json!({
            "tile": tile,
            "attempt": attempt,
            "max_attempts": max_attempts,
            "kind": error.kind(),
            "category": error.category(),
            "error": error.to_string(),
            "delay_ms": delay.as_millis() as u64,
        });
        bus.emit(names::TILE_RETRYING, retrying)
            .await
            .map_err(|source| TileError::Handler {
                tile: tile.clone(),
                source,
            })?;

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

async fn run_attempt(
    invocation: Invocation,
    limit: Option<Duration>,
    tile: &str,
) -> Result<Value, TileError> {
    let Some(limit) = limit else {
        return invocation.run().await;
    };
    let bus = invocation.event_bus();
    let error = match tokio::time::timeout(limit, invocation.run()).await {
        Ok(outcome) => return outcome,
        Err(_) => TileError::Execution {
            tile: tile.to_string(),
            category: "timeout".to_string(),
            source: format!("attempt exceeded {}ms", limit.as_millis()).into(),
        },
    };

    // The dropped attempt never reached its own failure path.
    let failed = json!({
        "tile": tile,
        "kind": error.kind(),
        "category": error.category(),
        "message": error.to_string(),
    });
    if let Err(e) = bus.emit(names::TILE_FAILED, failed).await {
        warn!(tile = %tile, error = %e, "tile.failed handler errored");
    }
    Err(error)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPayload {
    pub tile: String,
    #[serde(default)]
    pub payload: Value,
    /// Overrides the tile's default policy.
    #[serde(default)]
    pub policy: Option<RetryPolicy>,
}

/// Runs another tile under a retry policy, in the caller's context.
pub struct RetryTile {
    policy: RetryPolicy,
}

impl RetryTile {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Default for RetryTile {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl Tile for RetryTile {
    type Payload = RetryPayload;
    type Output = RetryResult;

    fn name(&self) -> &str {
        "retry"
    }

    fn description(&self) -> Option<&str> {
        Some("Invoke a tile with bounded retries and backoff")
    }

    fn validate(&self, payload: &RetryPayload) -> anyhow::Result<()> {
        anyhow::ensure!(payload.tile != self.name(), "retry cannot wrap itself");
        Ok(())
    }

    async fn execute(&self, payload: RetryPayload, ctx: &TileContext) -> anyhow::Result<RetryResult> {
        let policy = payload.policy.unwrap_or_else(|| self.policy.clone());
        let invocation = ctx.invocation(payload.tile.as_str(), payload.payload);
        Ok(invoke_with_retry(invocation, &policy).await?)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
