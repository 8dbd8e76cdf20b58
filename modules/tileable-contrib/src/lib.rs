//! Orchestration built on the tile engine: retries, replay, event-driven
//! flows, plus telemetry and queue adapter tiles.

pub mod flow;
pub mod observer;
pub mod queue;
pub mod replay;
pub mod retry;

pub use flow::{
    register_event_flow, EventFlowPayload, EventFlowResult, EventFlowTile, FlowStep, Route,
    Subscription,
};
pub use observer::{ObserverPayload, ObserverPlugin, ObserverResult, ObserverTile, SharedSink};
pub use queue::{
    DispatchPayload, DispatchResult, DispatchTile, EnqueueRequest, JobStatus, QueueDispatcher,
    QueuePlugin, SharedDispatcher, WorkerPayload, WorkerResult, WorkerTile,
};
pub use replay::{replay, ReplayPayload, ReplayRecorder, ReplayResult, ReplaySeed, ReplayTile};
pub use retry::{invoke_with_retry, RetryPayload, RetryPolicy, RetryResult, RetryTile};
