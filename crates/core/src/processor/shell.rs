//! Orchestration-facing shell of the chunk processor.
//!
//! Applies worker callbacks and watchdog timeouts to the chunk state
//! machine: failures consume retry budget with exponential backoff until the
//! budget is exhausted, then the chunk fails terminally.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::config::RetryConfig;
use super::types::ProducedArtifact;
use crate::job::{Chunk, ChunkCounters, ChunkStatus, ChunkUpdate, JobStore, JobStoreError};
use crate::metrics;
use crate::retry::StoreRetryPolicy;
use crate::scheduler::WorkerEvent;

/// What the orchestrator should do after an event was applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkEventOutcome {
    /// Stale, duplicate or out-of-order event; nothing changed.
    Ignored,
    /// Non-terminal progress (`running`, heartbeat).
    Progress,
    /// The chunk failed and is waiting for its retry backoff.
    Retrying(Chunk),
    /// The chunk reached a terminal status.
    Terminal {
        chunk: Chunk,
        artifacts: Vec<ProducedArtifact>,
    },
}

impl ChunkEventOutcome {
    /// True if an admission slot was released.
    pub fn releases_slot(&self) -> bool {
        matches!(
            self,
            ChunkEventOutcome::Retrying(_) | ChunkEventOutcome::Terminal { .. }
        )
    }
}

/// Cause of a chunk failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCause {
    /// Worker-reported error.
    Execution,
    /// No heartbeat within the expected window.
    Timeout,
}

impl FailureCause {
    fn as_str(&self) -> &'static str {
        match self {
            FailureCause::Execution => "execution",
            FailureCause::Timeout => "timeout",
        }
    }
}

/// Applies worker events to chunk records.
pub struct ChunkProcessor {
    store: Arc<dyn JobStore>,
    retry: RetryConfig,
    store_retry: StoreRetryPolicy,
}

impl ChunkProcessor {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryConfig) -> Self {
        Self {
            store,
            retry,
            store_retry: StoreRetryPolicy::default(),
        }
    }

    pub fn with_store_retry(mut self, policy: StoreRetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Applies one worker event.
    ///
    /// Writes are retried while the store is unavailable; if it stays
    /// unavailable the error is returned so the caller can redeliver the
    /// event later.
    pub async fn handle_event(
        &self,
        event: WorkerEvent,
    ) -> Result<ChunkEventOutcome, JobStoreError> {
        match event {
            WorkerEvent::Started {
                chunk_id,
                dispatch_id,
            } => {
                let update = ChunkUpdate::to(ChunkStatus::Running).for_dispatch(dispatch_id);
                match self.apply(&chunk_id, update).await? {
                    Some(_) => {
                        debug!(chunk_id = %chunk_id, "Chunk running");
                        Ok(ChunkEventOutcome::Progress)
                    }
                    None => Ok(ChunkEventOutcome::Ignored),
                }
            }
            WorkerEvent::Heartbeat {
                chunk_id,
                dispatch_id,
            } => {
                let recorded = self
                    .store_retry
                    .run("record_heartbeat", || {
                        self.store.record_heartbeat(&chunk_id, &dispatch_id)
                    })
                    .await?;
                Ok(if recorded {
                    ChunkEventOutcome::Progress
                } else {
                    ChunkEventOutcome::Ignored
                })
            }
            WorkerEvent::Completed {
                chunk_id,
                dispatch_id,
                counters,
                artifacts,
            } => {
                let update = ChunkUpdate::to(ChunkStatus::Completed)
                    .for_dispatch(dispatch_id)
                    .with_counters(counters);
                match self.apply(&chunk_id, update).await? {
                    Some(chunk) => {
                        info!(
                            chunk_id = %chunk.id,
                            job_id = %chunk.job_id,
                            items_completed = counters.items_completed,
                            items_failed = counters.items_failed,
                            retry_count = chunk.retry_count,
                            "Chunk completed"
                        );
                        record_outcome(&chunk, "completed");
                        Ok(ChunkEventOutcome::Terminal { chunk, artifacts })
                    }
                    None => Ok(ChunkEventOutcome::Ignored),
                }
            }
            WorkerEvent::Failed {
                chunk_id,
                dispatch_id,
                error,
                counters,
            } => {
                self.fail(
                    &chunk_id,
                    &dispatch_id,
                    &error,
                    counters,
                    FailureCause::Execution,
                )
                .await
            }
            WorkerEvent::Cancelled {
                chunk_id,
                dispatch_id,
                counters,
            } => {
                let update = ChunkUpdate::to(ChunkStatus::Cancelled)
                    .for_dispatch(dispatch_id)
                    .with_counters(counters);
                match self.apply(&chunk_id, update).await? {
                    Some(chunk) => {
                        info!(chunk_id = %chunk.id, job_id = %chunk.job_id, "Chunk stopped after cancellation");
                        record_outcome(&chunk, "cancelled");
                        Ok(ChunkEventOutcome::Terminal {
                            chunk,
                            artifacts: Vec::new(),
                        })
                    }
                    None => Ok(ChunkEventOutcome::Ignored),
                }
            }
        }
    }

    /// Treats a chunk whose heartbeat went stale exactly like an execution
    /// failure of its current dispatch.
    pub async fn handle_timeout(&self, chunk: &Chunk) -> Result<ChunkEventOutcome, JobStoreError> {
        let Some(ref dispatch_id) = chunk.dispatch_id else {
            return Ok(ChunkEventOutcome::Ignored);
        };
        warn!(
            chunk_id = %chunk.id,
            job_id = %chunk.job_id,
            last_heartbeat = ?chunk.heartbeat_at,
            "Chunk heartbeat lost"
        );
        metrics::CHUNK_TIMEOUTS.inc();
        self.fail(
            &chunk.id,
            dispatch_id,
            "no heartbeat within the expected window",
            chunk.counters,
            FailureCause::Timeout,
        )
        .await
    }

    async fn fail(
        &self,
        chunk_id: &str,
        dispatch_id: &str,
        error: &str,
        counters: ChunkCounters,
        cause: FailureCause,
    ) -> Result<ChunkEventOutcome, JobStoreError> {
        let Some(current) = self
            .store_retry
            .run("get_chunk", || self.store.get_chunk(chunk_id))
            .await?
        else {
            return Ok(ChunkEventOutcome::Ignored);
        };
        if current.dispatch_id.as_deref() != Some(dispatch_id) || !current.status.is_active() {
            debug!(chunk_id, dispatch_id, status = %current.status, "Ignoring stale failure");
            return Ok(ChunkEventOutcome::Ignored);
        }

        let cancel_requested = self
            .store_retry
            .run("is_cancel_requested", || {
                self.store.is_cancel_requested(&current.job_id)
            })
            .await?;

        let message = format!("{}: {}", cause.as_str(), error);
        let (update, label) = if cancel_requested {
            (
                ChunkUpdate::to(ChunkStatus::Cancelled).with_error(message),
                "cancelled",
            )
        } else if current.retry_count >= self.retry.max_retries {
            (
                ChunkUpdate::to(ChunkStatus::Failed).with_error(message),
                "failed",
            )
        } else {
            let delay = self.retry.delay_for(current.retry_count);
            let next_attempt =
                Utc::now() + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
            (
                ChunkUpdate::to(ChunkStatus::Retrying)
                    .with_error(message)
                    .retry_at(next_attempt),
                "retrying",
            )
        };
        let update = update
            .for_dispatch(dispatch_id.to_string())
            .with_counters(counters);

        let Some(chunk) = self.apply(chunk_id, update).await? else {
            return Ok(ChunkEventOutcome::Ignored);
        };
        record_outcome(&chunk, label);

        if chunk.status == ChunkStatus::Retrying {
            metrics::CHUNK_RETRIES
                .with_label_values(&[cause.as_str()])
                .inc();
            warn!(
                chunk_id = %chunk.id,
                job_id = %chunk.job_id,
                retry_count = chunk.retry_count,
                max_retries = self.retry.max_retries,
                next_attempt_at = ?chunk.next_attempt_at,
                error,
                "Chunk failed, retry scheduled"
            );
            Ok(ChunkEventOutcome::Retrying(chunk))
        } else {
            warn!(
                chunk_id = %chunk.id,
                job_id = %chunk.job_id,
                status = %chunk.status,
                retry_count = chunk.retry_count,
                error,
                "Chunk failed terminally"
            );
            Ok(ChunkEventOutcome::Terminal {
                chunk,
                artifacts: Vec::new(),
            })
        }
    }

    /// Applies a transition. `Ok(None)` means the event was stale or out of
    /// order for the chunk's current state.
    async fn apply(
        &self,
        chunk_id: &str,
        update: ChunkUpdate,
    ) -> Result<Option<Chunk>, JobStoreError> {
        let result = self
            .store_retry
            .run("transition_chunk", || {
                self.store.transition_chunk(chunk_id, update.clone())
            })
            .await;
        match result {
            Ok(chunk) => Ok(Some(chunk)),
            Err(e @ (JobStoreError::Conflict(_)
            | JobStoreError::InvalidTransition { .. }
            | JobStoreError::ChunkNotFound(_))) => {
                debug!(chunk_id, error = %e, "Chunk update not applied");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

fn record_outcome(chunk: &Chunk, label: &str) {
    metrics::CHUNK_OUTCOMES.with_label_values(&[label]).inc();
    if let (Some(started), Some(ended)) = (chunk.started_at, chunk.ended_at) {
        let secs = (ended - started).num_milliseconds().max(0) as f64 / 1000.0;
        metrics::CHUNK_DURATION
            .with_label_values(&[label])
            .observe(secs);
    }
}
