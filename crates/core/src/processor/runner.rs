//! Worker-side chunk execution.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::pipeline::ItemPipeline;
use super::types::{ProducedArtifact, Stage};
use crate::job::{ChunkCounters, JobStore};
use crate::scheduler::{ChunkTask, WorkerEvent};

/// How a single dispatch of a chunk ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Completed {
        counters: ChunkCounters,
        artifacts: Vec<ProducedArtifact>,
    },
    Failed {
        error: String,
        counters: ChunkCounters,
    },
    /// Cancellation was observed before `stage` started.
    Cancelled {
        before: Stage,
        counters: ChunkCounters,
    },
}

/// Runs a chunk through download -> validate -> persist and reports back.
///
/// The job's cancellation flag is checked before each stage; a stage that
/// has started always runs to its end.
pub struct ChunkRunner {
    pipeline: Arc<dyn ItemPipeline>,
    store: Arc<dyn JobStore>,
    heartbeat_interval: Duration,
}

impl ChunkRunner {
    pub fn new(
        pipeline: Arc<dyn ItemPipeline>,
        store: Arc<dyn JobStore>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            store,
            heartbeat_interval,
        }
    }

    /// Executes the task, emitting `Started`, periodic `Heartbeat`s and one
    /// terminal event on `events`.
    pub async fn run(&self, task: &ChunkTask, events: &mpsc::Sender<WorkerEvent>) -> RunResult {
        let started = Instant::now();
        send(
            events,
            WorkerEvent::Started {
                chunk_id: task.chunk_id.clone(),
                dispatch_id: task.dispatch_id.clone(),
            },
        )
        .await;

        let heartbeat = tokio::spawn(heartbeat_loop(
            events.clone(),
            task.chunk_id.clone(),
            task.dispatch_id.clone(),
            self.heartbeat_interval,
        ));
        let result = self.execute(task).await;
        heartbeat.abort();

        info!(
            chunk_id = %task.chunk_id,
            pipeline = self.pipeline.name(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            outcome = result_label(&result),
            "Chunk run finished"
        );

        let event = match result.clone() {
            RunResult::Completed {
                counters,
                artifacts,
            } => WorkerEvent::Completed {
                chunk_id: task.chunk_id.clone(),
                dispatch_id: task.dispatch_id.clone(),
                counters,
                artifacts,
            },
            RunResult::Failed { error, counters } => WorkerEvent::Failed {
                chunk_id: task.chunk_id.clone(),
                dispatch_id: task.dispatch_id.clone(),
                error,
                counters,
            },
            RunResult::Cancelled { counters, .. } => WorkerEvent::Cancelled {
                chunk_id: task.chunk_id.clone(),
                dispatch_id: task.dispatch_id.clone(),
                counters,
            },
        };
        send(events, event).await;
        result
    }

    async fn execute(&self, task: &ChunkTask) -> RunResult {
        let mut counters = ChunkCounters::default();

        if self.cancel_requested(task, Stage::Download) {
            return RunResult::Cancelled {
                before: Stage::Download,
                counters,
            };
        }
        let downloaded = match self.pipeline.download(task).await {
            Ok(outcome) => outcome,
            Err(e) => return failed(e, counters),
        };
        counters.items_downloaded = downloaded.items_downloaded;
        counters.items_failed = downloaded.items_failed;

        if self.cancel_requested(task, Stage::Validate) {
            return RunResult::Cancelled {
                before: Stage::Validate,
                counters,
            };
        }
        let validated = match self.pipeline.validate(task, &downloaded).await {
            Ok(outcome) => outcome,
            Err(e) => return failed(e, counters),
        };
        counters.items_failed += validated.items_invalid;

        if self.cancel_requested(task, Stage::Persist) {
            return RunResult::Cancelled {
                before: Stage::Persist,
                counters,
            };
        }
        let persisted = match self.pipeline.persist(task, &validated).await {
            Ok(outcome) => outcome,
            Err(e) => return failed(e, counters),
        };
        counters.items_completed = persisted.items_persisted;
        counters.items_failed += validated
            .items_valid
            .saturating_sub(persisted.items_persisted);

        RunResult::Completed {
            counters,
            artifacts: persisted.artifacts,
        }
    }

    fn cancel_requested(&self, task: &ChunkTask, next: Stage) -> bool {
        match self.store.is_cancel_requested(&task.job_id) {
            Ok(true) => {
                info!(chunk_id = %task.chunk_id, before = %next, "Cancellation observed");
                true
            }
            Ok(false) => false,
            Err(e) => {
                // Keep working; the orchestrator still decides the outcome.
                warn!(chunk_id = %task.chunk_id, error = %e, "Could not read cancellation flag");
                false
            }
        }
    }
}

fn failed(error: super::types::StageError, counters: ChunkCounters) -> RunResult {
    RunResult::Failed {
        error: error.to_string(),
        counters,
    }
}

fn result_label(result: &RunResult) -> &'static str {
    match result {
        RunResult::Completed { .. } => "completed",
        RunResult::Failed { .. } => "failed",
        RunResult::Cancelled { .. } => "cancelled",
    }
}

async fn send(events: &mpsc::Sender<WorkerEvent>, event: WorkerEvent) {
    if let Err(e) = events.send(event).await {
        warn!(event = e.0.kind(), chunk_id = %e.0.chunk_id(), "Event channel closed");
    }
}

async fn heartbeat_loop(
    events: mpsc::Sender<WorkerEvent>,
    chunk_id: String,
    dispatch_id: String,
    interval: Duration,
) {
    loop {
        tokio::time::sleep(interval).await;
        debug!(chunk_id = %chunk_id, "Heartbeat");
        let event = WorkerEvent::Heartbeat {
            chunk_id: chunk_id.clone(),
            dispatch_id: dispatch_id.clone(),
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}
