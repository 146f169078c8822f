//! Task broker abstraction.
//!
//! The orchestrator never runs chunk work itself: admitted chunks are handed
//! to a broker, and workers report back through [`WorkerEvent`]s.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{Chunk, ChunkCounters};
use crate::processor::ProducedArtifact;

/// Errors that can occur during broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Broker is shut down")]
    Closed,

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// A unit of work submitted to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkTask {
    pub chunk_id: String,
    pub job_id: String,
    pub dispatch_id: String,
    pub ordinal: u32,
    pub job_attempt: u32,
    pub item_count: u64,
}

impl ChunkTask {
    /// Builds the task for an admitted chunk. Returns `None` if the chunk
    /// carries no dispatch id.
    pub fn for_chunk(chunk: &Chunk) -> Option<Self> {
        Some(Self {
            chunk_id: chunk.id.clone(),
            job_id: chunk.job_id.clone(),
            dispatch_id: chunk.dispatch_id.clone()?,
            ordinal: chunk.ordinal,
            job_attempt: chunk.job_attempt,
            item_count: chunk.item_count,
        })
    }
}

/// Callback delivered by a worker for one dispatch of a chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Started {
        chunk_id: String,
        dispatch_id: String,
    },
    Heartbeat {
        chunk_id: String,
        dispatch_id: String,
    },
    Completed {
        chunk_id: String,
        dispatch_id: String,
        counters: ChunkCounters,
        #[serde(default)]
        artifacts: Vec<ProducedArtifact>,
    },
    Failed {
        chunk_id: String,
        dispatch_id: String,
        error: String,
        counters: ChunkCounters,
    },
    /// The worker observed the job's cancellation flag between stages.
    Cancelled {
        chunk_id: String,
        dispatch_id: String,
        counters: ChunkCounters,
    },
}

impl WorkerEvent {
    pub fn chunk_id(&self) -> &str {
        match self {
            WorkerEvent::Started { chunk_id, .. }
            | WorkerEvent::Heartbeat { chunk_id, .. }
            | WorkerEvent::Completed { chunk_id, .. }
            | WorkerEvent::Failed { chunk_id, .. }
            | WorkerEvent::Cancelled { chunk_id, .. } => chunk_id,
        }
    }

    pub fn dispatch_id(&self) -> &str {
        match self {
            WorkerEvent::Started { dispatch_id, .. }
            | WorkerEvent::Heartbeat { dispatch_id, .. }
            | WorkerEvent::Completed { dispatch_id, .. }
            | WorkerEvent::Failed { dispatch_id, .. }
            | WorkerEvent::Cancelled { dispatch_id, .. } => dispatch_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Started { .. } => "started",
            WorkerEvent::Heartbeat { .. } => "heartbeat",
            WorkerEvent::Completed { .. } => "completed",
            WorkerEvent::Failed { .. } => "failed",
            WorkerEvent::Cancelled { .. } => "cancelled",
        }
    }
}

/// Trait for task brokers.
#[async_trait]
pub trait TaskBroker: Send + Sync {
    /// Returns the broker name for logging.
    fn name(&self) -> &str;

    /// Submits a task, returning the broker's handle for it.
    async fn enqueue(&self, task: ChunkTask) -> Result<String, BrokerError>;

    /// Revokes a task. Returns true if the task had not started yet; tasks
    /// already running are left to observe the cancellation flag.
    async fn revoke(&self, task_handle: &str) -> Result<bool, BrokerError>;
}
