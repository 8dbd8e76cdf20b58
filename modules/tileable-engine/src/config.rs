//! Runtime configuration: TOML file plus `TILEABLE_*` environment overrides.

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    pub registry: RegistryConfig,
    pub retry: RetryConfig,
    pub flow: FlowConfig,
    pub replay: ReplayConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Reject re-registration of an existing name instead of overwriting.
    pub strict: bool,
}

/// Defaults for retry policies built without explicit settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: Option<u64>,
    pub jitter_ms: u64,
    pub attempt_timeout_ms: Option<u64>,
    pub never_retry_on: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 100,
            max_backoff_ms: Some(2_000),
            jitter_ms: 100,
            attempt_timeout_ms: None,
            never_retry_on: vec!["not_found".to_string(), "validation".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Upper bound on routed invocations in one flow run.
    pub max_invocations: usize,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_invocations: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Also compare the fresh event log against the recorded one.
    pub validate_events: bool,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            validate_events: true,
        }
    }
}

impl RuntimeConfig {
    /// Defaults, then the file named by `TILEABLE_CONFIG`, then individual
    /// `TILEABLE_*` variables. A `.env` file is honoured when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.log_summary();
        Ok(config)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = match lookup("TILEABLE_CONFIG") {
            Some(path) => Self::load(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(strict) = parse_var::<bool>(&lookup, "TILEABLE_STRICT_REGISTRY")? {
            config.registry.strict = strict;
        }
        if let Some(n) = parse_var(&lookup, "TILEABLE_RETRY_MAX_ATTEMPTS")? {
            config.retry.max_attempts = n;
        }
        if let Some(ms) = parse_var(&lookup, "TILEABLE_RETRY_BACKOFF_MS")? {
            config.retry.backoff_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "TILEABLE_RETRY_JITTER_MS")? {
            config.retry.jitter_ms = ms;
        }
        if let Some(ms) = parse_var(&lookup, "TILEABLE_RETRY_TIMEOUT_MS")? {
            config.retry.attempt_timeout_ms = Some(ms);
        }
        if let Some(list) = lookup("TILEABLE_RETRY_NEVER_ON") {
            config.retry.never_retry_on = list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(n) = parse_var(&lookup, "TILEABLE_FLOW_MAX_INVOCATIONS")? {
            config.flow.max_invocations = n;
        }
        if let Some(validate) = parse_var(&lookup, "TILEABLE_REPLAY_VALIDATE_EVENTS")? {
            config.replay.validate_events = validate;
        }

        Ok(config)
    }

    /// Load and parse a TOML config file. Missing sections keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: RuntimeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        tracing::info!("Runtime config loaded:");
        tracing::info!("  registry.strict: {}", self.registry.strict);
        tracing::info!(
            "  retry: {} attempts, {}ms backoff, {}ms jitter",
            self.retry.max_attempts,
            self.retry.backoff_ms,
            self.retry.jitter_ms
        );
        tracing::info!("  flow.max_invocations: {}", self.flow.max_invocations);
        tracing::info!("  replay.validate_events: {}", self.replay.validate_events);
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => {
            let value = raw
                .trim()
                .parse()
                .with_context(|| format!("Invalid value for {key}: {raw}"))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}
