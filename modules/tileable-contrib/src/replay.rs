//! Record a run into a portable seed and re-drive it later to check that
//! the tile still produces the same output.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use tileable_engine::{
    EventBus, EventFilter, EventRecord, Invocation, Recording, Registry, SharedState, Tile,
    TileContext, TileError,
};
use tileable_events::names;

pub const SEED_VERSION: u32 = 1;

/// Snapshot of one run: what went in, what came out, what was emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplaySeed {
    pub version: u32,
    pub tile: String,
    pub payload: Value,
    /// Terminal result of the recorded run, absent if it never completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// State the run started from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Map<String, Value>>,
    /// Names of the services that were injected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<Vec<String>>,
    /// Event names captured; absent means every event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Vec<String>>,
    pub events: Vec<EventRecord>,
}

impl ReplaySeed {
    pub fn with_state(mut self, state: Map<String, Value>) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_service_names(mut self, names: Vec<String>) -> Self {
        self.services = Some(names);
        self
    }

    pub fn event_filter(&self) -> EventFilter {
        match &self.filter {
            Some(names) => EventFilter::only(names.iter().cloned()),
            None => EventFilter::all(),
        }
    }

    /// An invocation of the recorded tile, starting from the recorded state.
    pub fn invocation(&self) -> Invocation {
        let invocation = Invocation::new(self.tile.as_str(), self.payload.clone());
        match &self.state {
            Some(state) => invocation.with_state(SharedState::from_map(state.clone())),
            None => invocation,
        }
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        let mut json = serde_json::to_string_pretty(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let seed: ReplaySeed = serde_json::from_str(json)?;
        anyhow::ensure!(
            seed.version == SEED_VERSION,
            "unsupported seed version {} (expected {SEED_VERSION})",
            seed.version
        );
        Ok(seed)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = self.to_json()?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write replay seed: {}", path.display()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read replay seed: {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("Failed to parse replay seed: {}", path.display()))
    }
}

/// Captures events on a bus while alive and packages them into seeds.
pub struct ReplayRecorder {
    filter: EventFilter,
    events: Recording,
    completions: Recording,
}

impl ReplayRecorder {
    pub fn new(bus: &EventBus, filter: EventFilter) -> Self {
        Self {
            events: bus.record(filter.clone()),
            completions: bus.record(EventFilter::only([names::TILE_COMPLETED])),
            filter,
        }
    }

    pub fn events(&self) -> Vec<EventRecord> {
        self.events.events()
    }

    pub fn to_seed(&self, tile: &str, payload: Value) -> ReplaySeed {
        let output = self
            .completions
            .payloads(names::TILE_COMPLETED)
            .into_iter()
            .rev()
            .find(|completed| completed.get("tile").and_then(Value::as_str) == Some(tile))
            .and_then(|completed| completed.get("result").cloned());

        ReplaySeed {
            version: SEED_VERSION,
            tile: tile.to_string(),
            payload,
            output,
            state: None,
            services: None,
            filter: match &self.filter {
                EventFilter::All => None,
                EventFilter::Only(names) => Some(names.iter().cloned().collect()),
            },
            events: self.events.events(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayResult {
    pub tile: String,
    pub output: Value,
    pub events: Vec<EventRecord>,
    pub matches: bool,
    pub mismatches: Vec<String>,
}

impl ReplayResult {
    /// Turn a divergent replay into an error.
    pub fn ensure_matches(self) -> Result<Self, TileError> {
        if self.matches {
            Ok(self)
        } else {
            Err(TileError::ReplayMismatch {
                tile: self.tile,
                mismatches: self.mismatches,
            })
        }
    }
}

/// Run `invocation` (normally `seed.invocation()`) and compare it with the seed.
/// Side effects are not suppressed; only the output and, optionally, the
/// event log are compared.
pub async fn replay(
    seed: &ReplaySeed,
    invocation: Invocation,
    validate_events: bool,
) -> Result<ReplayResult, TileError> {
    let bus = invocation.event_bus();
    let recording = bus.record(seed.event_filter());
    let output = invocation.with_event_bus(bus).run().await?;
    let events = recording.finish();

    let mut mismatches = Vec::new();
    match &seed.output {
        Some(recorded) if *recorded == output => {}
        Some(recorded) => mismatches.push(format!("output differs: recorded {recorded}, replayed {output}")),
        None => mismatches.push("seed has no recorded output".to_string()),
    }
    if validate_events {
        mismatches.extend(compare_events(&seed.events, &events));
    }

    let matches = mismatches.is_empty();
    if matches {
        info!(tile = %seed.tile, "Replay matched recorded run");
    } else {
        warn!(tile = %seed.tile, mismatches = mismatches.len(), "Replay diverged from recorded run");
    }

    Ok(ReplayResult {
        tile: seed.tile.clone(),
        output,
        events,
        matches,
        mismatches,
    })
}

fn compare_events(recorded: &[EventRecord], replayed: &[EventRecord]) -> Vec<String> {
    let mut mismatches = Vec::new();
    if recorded.len() != replayed.len() {
        mismatches.push(format!(
            "event count differs: recorded {}, replayed {}",
            recorded.len(),
            replayed.len()
        ));
    }
    for (i, (a, b)) in recorded.iter().zip(replayed).enumerate() {
        if a != b {
            mismatches.push(format!(
                "event #{i} differs: recorded {} from {}, replayed {} from {}",
                a.event, a.sender, b.event, b.sender
            ));
        }
    }
    mismatches
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayPayload {
    #[serde(default)]
    pub seed: Option<ReplaySeed>,
    #[serde(default)]
    pub seed_path: Option<PathBuf>,
    /// Falls back to the tile's setting when absent.
    #[serde(default)]
    pub validate_events: Option<bool>,
}

/// Re-drives a recorded seed through the caller's context.
pub struct ReplayTile {
    validate_events: bool,
    registry: Option<Registry>,
}

impl ReplayTile {
    pub fn new(validate_events: bool) -> Self {
        Self {
            validate_events,
            registry: None,
        }
    }

    /// Resolve the recorded tile here instead of in the caller's registry.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }
}

impl Default for ReplayTile {
    fn default() -> Self {
        Self::new(true)
    }
}

#[async_trait]
impl Tile for ReplayTile {
    type Payload = ReplayPayload;
    type Output = ReplayResult;

    fn name(&self) -> &str {
        "replay"
    }

    fn description(&self) -> Option<&str> {
        Some("Re-run a recorded seed and compare outputs")
    }

    fn validate(&self, payload: &ReplayPayload) -> anyhow::Result<()> {
        anyhow::ensure!(
            payload.seed.is_some() || payload.seed_path.is_some(),
            "replay needs either a seed or a seed_path"
        );
        Ok(())
    }

    async fn execute(&self, payload: ReplayPayload, ctx: &TileContext) -> anyhow::Result<ReplayResult> {
        let seed = match (payload.seed, payload.seed_path) {
            (Some(seed), _) => seed,
            (None, Some(path)) => ReplaySeed::load(&path)?,
            (None, None) => anyhow::bail!("replay needs either a seed or a seed_path"),
        };

        let mut invocation = ctx.invocation(seed.tile.as_str(), seed.payload.clone());
        if let Some(state) = &seed.state {
            invocation = invocation.with_state(SharedState::from_map(state.clone()));
        }
        if let Some(registry) = &self.registry {
            invocation = invocation.with_registry(registry.clone());
        }

        let validate_events = payload.validate_events.unwrap_or(self.validate_events);
        Ok(replay(&seed, invocation, validate_events).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seed() -> ReplaySeed {
        ReplaySeed {
            version: SEED_VERSION,
            tile: "greeting".into(),
            payload: json!({"name": "World"}),
            output: Some(json!({"message": "Hi, World!"})),
            state: None,
            services: Some(vec!["greeting.prefix".into()]),
            filter: Some(vec![names::TILE_DEBUG.into()]),
            events: vec![EventRecord {
                event: names::TILE_DEBUG.into(),
                sender: "greeting".into(),
                payload: json!({"tile": "greeting", "name": "World"}),
            }],
        }
    }

    #[test]
    fn save_load_save_is_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.json");

        let original = seed();
        original.save(&path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        let loaded = ReplaySeed::load(&path).unwrap();
        loaded.save(&path).unwrap();
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(loaded, original);
        assert_eq!(first, second);
    }

    #[test]
    fn extreme_floats_survive_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floats.json");

        let mut original = seed();
        original.payload = json!({"x": 1.0715660391465826e-75});
        original.state = Some(
            json!({"ratio": 2.2250738585072014e-308, "tiny": 5e-324})
                .as_object()
                .cloned()
                .unwrap(),
        );
        original.save(&path).unwrap();

        let loaded = ReplaySeed::load(&path).unwrap();
        assert_eq!(loaded.payload["x"].as_f64(), Some(1.0715660391465826e-75));
        assert_eq!(loaded, original);
    }

    #[test]
    fn every_divergent_event_is_reported() {
        let record = |event: &str, sender: &str| EventRecord {
            event: event.into(),
            sender: sender.into(),
            payload: json!({}),
        };
        let recorded = vec![
            record(names::TILE_STARTED, "a"),
            record(names::TILE_DEBUG, "a"),
            record(names::TILE_COMPLETED, "a"),
        ];
        let replayed = vec![
            record(names::TILE_STARTED, "b"),
            record(names::TILE_DEBUG, "a"),
            record(names::TILE_FAILED, "a"),
        ];

        let mismatches = compare_events(&recorded, &replayed);
        assert_eq!(mismatches.len(), 2);
        assert!(mismatches[0].starts_with("event #0 differs"));
        assert!(mismatches[1].starts_with("event #2 differs"));
    }

    #[test]
    fn unknown_versions_are_rejected() {
        let mut future = seed();
        future.version = SEED_VERSION + 1;
        let json = serde_json::to_string(&future).unwrap();

        assert!(ReplaySeed::from_json(&json).is_err());
    }

    #[test]
    fn event_comparison_names_the_first_divergence() {
        let recorded = seed().events;
        let mut replayed = recorded.clone();
        replayed[0].payload = json!({"tile": "greeting", "name": "Moon"});

        let mismatches = compare_events(&recorded, &replayed);
        assert_eq!(mismatches.len(), 1);
        assert!(mismatches[0].starts_with("event #0 differs"));
    }

    #[test]
    fn ensure_matches_reports_divergence() {
        let result = ReplayResult {
            tile: "greeting".into(),
            output: json!(null),
            events: vec![],
            matches: false,
            mismatches: vec!["output differs".into()],
        };

        let err = result.ensure_matches().unwrap_err();
        assert!(matches!(err, TileError::ReplayMismatch { .. }));
    }
}
