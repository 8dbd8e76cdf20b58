//! Queue adapter tiles. The queue itself is an outside collaborator reached
//! through [`QueueDispatcher`]; nothing here persists or schedules jobs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use tileable_engine::{handle, Categorized, Plugin, Tile, TileContext, TileHandle};

/// Service name the dispatcher is looked up under.
pub const DISPATCHER_SERVICE: &str = "queue_dispatcher";

/// A request to run `tile` with `payload` somewhere else, later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    pub tile: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    /// Earliest time a worker should run the job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<DateTime<Utc>>,
}

/// Anything that can accept a job and hand back its id.
pub trait QueueDispatcher: Send + Sync {
    fn enqueue(&self, request: EnqueueRequest) -> anyhow::Result<String>;
}

impl<T: QueueDispatcher + ?Sized> QueueDispatcher for Arc<T> {
    fn enqueue(&self, request: EnqueueRequest) -> anyhow::Result<String> {
        (**self).enqueue(request)
    }
}

/// The service value stored under [`DISPATCHER_SERVICE`].
pub type SharedDispatcher = Arc<dyn QueueDispatcher>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchPayload {
    #[serde(flatten)]
    pub request: EnqueueRequest,
    /// Also run the tile inline and return its result.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

#[derive(Debug, Default)]
pub struct DispatchTile;

#[async_trait]
impl Tile for DispatchTile {
    type Payload = DispatchPayload;
    type Output = DispatchResult;

    fn name(&self) -> &str {
        "queue-dispatch"
    }

    fn description(&self) -> Option<&str> {
        Some("Hand a tile invocation to a queue")
    }

    async fn execute(&self, payload: DispatchPayload, ctx: &TileContext) -> anyhow::Result<DispatchResult> {
        let dispatcher = ctx.service::<SharedDispatcher>(DISPATCHER_SERVICE)?;
        let request = payload.request;
        let job_id = dispatcher.enqueue(request.clone())?;
        info!(job_id = %job_id, tile = %request.tile, queue = ?request.queue, "Job enqueued");

        if !payload.wait {
            return Ok(DispatchResult {
                job_id,
                status: JobStatus::Queued,
                result: None,
            });
        }

        let result = ctx
            .invocation(request.tile.as_str(), request.payload)
            .run()
            .await?;
        Ok(DispatchResult {
            job_id,
            status: JobStatus::Completed,
            result: Some(result),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPayload {
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(flatten)]
    pub request: EnqueueRequest,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    pub result: Value,
}

/// Runs a dequeued job with the worker's own context.
#[derive(Debug, Default)]
pub struct WorkerTile;

#[async_trait]
impl Tile for WorkerTile {
    type Payload = WorkerPayload;
    type Output = WorkerResult;

    fn name(&self) -> &str {
        "queue-worker"
    }

    fn description(&self) -> Option<&str> {
        Some("Execute a queued tile invocation")
    }

    async fn execute(&self, payload: WorkerPayload, ctx: &TileContext) -> anyhow::Result<WorkerResult> {
        if let Some(eta) = payload.request.eta {
            if eta > Utc::now() {
                return Err(Categorized::new("not_due", format!("job is not due until {eta}")).into());
            }
        }

        let result = ctx
            .invocation(payload.request.tile.as_str(), payload.request.payload)
            .run()
            .await?;
        Ok(WorkerResult {
            job_id: payload.job_id,
            result,
        })
    }
}

/// Contributes the dispatch and worker tiles and seeds the dispatcher service.
pub struct QueuePlugin {
    dispatcher: SharedDispatcher,
}

impl QueuePlugin {
    pub fn new(dispatcher: SharedDispatcher) -> Self {
        Self { dispatcher }
    }
}

impl Plugin for QueuePlugin {
    fn name(&self) -> &str {
        "queue"
    }

    fn tiles(&self) -> Vec<TileHandle> {
        vec![handle(DispatchTile), handle(WorkerTile)]
    }

    fn on_startup(&self, ctx: &mut TileContext) -> anyhow::Result<()> {
        if !ctx.has_service(DISPATCHER_SERVICE) {
            ctx.set_service(DISPATCHER_SERVICE, Arc::clone(&self.dispatcher));
        }
        Ok(())
    }
}
