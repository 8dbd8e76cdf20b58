//! End-to-end runs of the demonstration programs.

use serde_json::json;
use tileable_demos::{
    run_greeting, run_order_pipeline, showcase, GreetingPayload, GreetingPlugin, GreetingResult,
    Segment,
};
use tileable_engine::{
    names, EventBus, EventFilter, Invocation, PluginManager, Registry, RuntimeConfig, SharedState,
};

// =========================================================================
// Greeting
// =========================================================================

#[tokio::test]
async fn greeting_uses_the_plugin_prefix() {
    let result = run_greeting("Yo", "Agent").await.unwrap();
    assert_eq!(result.message, "Yo, Agent!");
}

#[tokio::test]
async fn showcase_collects_debug_events_and_state() {
    let observed = showcase("Tileable").await.unwrap();

    assert_eq!(observed.result.message, "Hi, Tileable!");
    assert_eq!(observed.debug_events, vec![json!({"tile": "greeting", "name": "Tileable"})]);
    assert_eq!(observed.state["runs"], 1);
}

#[tokio::test]
async fn greeting_debug_event_sits_between_lifecycle_events() {
    let plugins = PluginManager::new();
    plugins.register(GreetingPlugin::default());
    let bus = EventBus::new();
    let state = SharedState::new();
    let lifecycle = bus.record(EventFilter::all());

    let result: GreetingResult = Invocation::serialize(
        "greeting",
        &GreetingPayload {
            name: "World".into(),
        },
    )
    .unwrap()
    .with_registry(Registry::new())
    .with_plugins(plugins)
    .with_event_bus(bus.clone())
    .with_state(state.clone())
    .run_as()
    .await
    .unwrap();

    assert_eq!(result.message, "Hi, World!");
    assert_eq!(
        lifecycle.names(),
        vec![names::TILE_STARTED, names::TILE_DEBUG, names::TILE_COMPLETED]
    );
    assert_eq!(
        lifecycle.payloads(names::TILE_DEBUG),
        vec![json!({"tile": "greeting", "name": "World"})]
    );
    assert_eq!(state.get("runs"), Some(json!(1)));
}

#[tokio::test]
async fn blank_names_are_rejected_before_anything_runs() {
    let err = run_greeting("Hi", "  ").await.unwrap_err();
    assert_eq!(err.category(), "validation");
}

// =========================================================================
// Order pipeline
// =========================================================================

#[tokio::test]
async fn pipeline_branches_on_score() {
    let summaries = run_order_pipeline(&[1, 2, 3], &RuntimeConfig::default())
        .await
        .unwrap();

    let ids: Vec<_> = summaries.iter().map(|s| s.order_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);

    for summary in &summaries {
        let steps: Vec<_> = summary.history.iter().map(|s| s.tile.as_str()).collect();
        match summary.segment {
            Segment::Vip => assert_eq!(steps, vec!["orders.fetch", "orders.score", "orders.notify"]),
            Segment::Standard => assert_eq!(steps, vec!["orders.fetch", "orders.notify"]),
        }
    }
    assert_eq!(summaries[0].segment, Segment::Vip);
    assert_eq!(summaries[2].segment, Segment::Standard);
    assert_eq!(
        summaries[2].history.last().unwrap().output,
        Some(json!({"order_id": 3, "channel": "email"}))
    );
}

#[tokio::test]
async fn pipeline_runs_are_repeatable() {
    let config = RuntimeConfig::default();
    let first = run_order_pipeline(&[5, 8, 13], &config).await.unwrap();
    let second = run_order_pipeline(&[5, 8, 13], &config).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn pipeline_accepts_the_largest_order_ids() {
    let summaries = run_order_pipeline(&[u64::MAX], &RuntimeConfig::default())
        .await
        .unwrap();

    assert_eq!(summaries.len(), 1);
    let fetched = summaries[0].history[0].output.clone().unwrap();
    assert_eq!(fetched["total_cents"], u64::MAX);
    // u64::MAX % 100 == 15, so the score is (15 * 37 + 11) % 100 == 66.
    assert_eq!(fetched["score"], 66);
    assert_eq!(summaries[0].segment, Segment::Vip);
}

#[tokio::test]
async fn pipeline_honours_the_invocation_cap() {
    let mut config = RuntimeConfig::default();
    config.flow.max_invocations = 3;

    let err = run_order_pipeline(&[1, 2, 3], &config).await.unwrap_err();
    assert!(format!("{err:#}").contains("exceeded 3 invocations"));
}
