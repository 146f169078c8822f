//! Chunk scheduler: hands admitted chunks to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::{ChunkTask, TaskBroker};
use crate::job::{Chunk, ChunkStatus, ChunkUpdate, JobStore};
use crate::metrics;
use crate::retry::StoreRetryPolicy;

/// What happened to an admitted chunk handed to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The broker accepted the task.
    Submitted { task_handle: String },
    /// The broker refused it; the chunk was put back to wait for admission.
    Requeued { error: String },
}

/// Submits admitted chunks to the task broker.
pub struct ChunkScheduler {
    store: Arc<dyn JobStore>,
    broker: Arc<dyn TaskBroker>,
    store_retry: StoreRetryPolicy,
    requeue_delay: Duration,
}

impl ChunkScheduler {
    pub fn new(store: Arc<dyn JobStore>, broker: Arc<dyn TaskBroker>) -> Self {
        Self {
            store,
            broker,
            store_retry: StoreRetryPolicy::default(),
            requeue_delay: Duration::from_secs(5),
        }
    }

    pub fn with_store_retry(mut self, policy: StoreRetryPolicy) -> Self {
        self.store_retry = policy;
        self
    }

    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn broker_name(&self) -> &str {
        self.broker.name()
    }

    /// Enqueues an admitted chunk (fire-and-forget; completion arrives as
    /// worker events).
    ///
    /// If the broker refuses the task, the chunk returns to `retrying`
    /// without consuming retry budget and releases its reservation. If that
    /// write cannot reach the store either, the chunk stays admitted without
    /// heartbeats and the watchdog reclaims it.
    pub async fn submit(&self, chunk: &Chunk) -> SubmitOutcome {
        let Some(task) = ChunkTask::for_chunk(chunk) else {
            return SubmitOutcome::Requeued {
                error: format!("chunk {} has no dispatch id", chunk.id),
            };
        };
        let dispatch_id = task.dispatch_id.clone();

        match self.broker.enqueue(task).await {
            Ok(task_handle) => {
                info!(
                    chunk_id = %chunk.id,
                    broker = self.broker.name(),
                    task_handle = %task_handle,
                    "Chunk submitted"
                );
                let attach = self
                    .store_retry
                    .run("attach_task", || {
                        self.store.attach_task(&chunk.id, &dispatch_id, &task_handle)
                    })
                    .await;
                if let Err(e) = attach {
                    // The chunk may already have finished or been reclaimed.
                    debug!(chunk_id = %chunk.id, error = %e, "Could not record task handle");
                }
                SubmitOutcome::Submitted { task_handle }
            }
            Err(e) => {
                warn!(chunk_id = %chunk.id, error = %e, "Broker refused chunk, requeueing");
                metrics::CHUNK_RETRIES.with_label_values(&["enqueue"]).inc();
                let next_attempt =
                    Utc::now() + chrono::Duration::from_std(self.requeue_delay).unwrap_or(chrono::Duration::zero());
                let requeue = self
                    .store_retry
                    .run("requeue_chunk", || {
                        self.store.transition_chunk(
                            &chunk.id,
                            ChunkUpdate::to(ChunkStatus::Retrying)
                                .for_dispatch(dispatch_id.clone())
                                .with_error(e.to_string())
                                .requeue_at(next_attempt),
                        )
                    })
                    .await;
                if let Err(store_err) = requeue {
                    warn!(chunk_id = %chunk.id, error = %store_err, "Failed to requeue chunk");
                }
                SubmitOutcome::Requeued {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Revokes the chunk's broker task. Returns true if the task was removed
    /// before it started.
    pub async fn revoke(&self, chunk: &Chunk) -> bool {
        let Some(ref handle) = chunk.task_handle else {
            return false;
        };
        match self.broker.revoke(handle).await {
            Ok(revoked) => revoked,
            Err(e) => {
                warn!(chunk_id = %chunk.id, task_handle = %handle, error = %e, "Failed to revoke task");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AdmissionLimits, AdmissionOutcome, JobStatus, NewJob, SqliteJobStore};
    use crate::testing::MockTaskBroker;

    fn admitted_chunk(store: &SqliteJobStore) -> Chunk {
        let job = store
            .create_job(NewJob {
                owner: "owner".to_string(),
                requested_items: 5,
                chunk_size: 5,
                chunk_item_counts: vec![5],
            })
            .unwrap();
        store.set_job_status(&job.id, JobStatus::Running).unwrap();
        let limits = AdmissionLimits {
            max_concurrent_chunks: 1,
            max_scratch_bytes: 100,
            required_bytes: 10,
        };
        match store.try_admit(&job.chunk_ids[0], &limits, "d1").unwrap() {
            AdmissionOutcome::Admitted(chunk) => chunk,
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_submit_records_task_handle() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let broker = Arc::new(MockTaskBroker::new());
        let scheduler = ChunkScheduler::new(store.clone(), broker.clone());
        let chunk = admitted_chunk(&store);

        let outcome = scheduler.submit(&chunk).await;
        let SubmitOutcome::Submitted { task_handle } = outcome else {
            panic!("expected submission");
        };

        let tasks = broker.enqueued().await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].dispatch_id, "d1");

        let stored = store.get_chunk(&chunk.id).unwrap().unwrap();
        assert_eq!(stored.task_handle.as_deref(), Some(task_handle.as_str()));
    }

    #[tokio::test]
    async fn test_enqueue_failure_requeues_without_retry_budget() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let broker = Arc::new(MockTaskBroker::new());
        broker
            .set_next_error(crate::scheduler::BrokerError::Unavailable("down".to_string()))
            .await;
        let scheduler = ChunkScheduler::new(store.clone(), broker.clone())
            .with_requeue_delay(Duration::from_millis(0));
        let chunk = admitted_chunk(&store);

        let outcome = scheduler.submit(&chunk).await;
        assert!(matches!(outcome, SubmitOutcome::Requeued { .. }));

        let stored = store.get_chunk(&chunk.id).unwrap().unwrap();
        assert_eq!(stored.status, ChunkStatus::Retrying);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.reserved_bytes, 0);
        assert_eq!(store.count_active_chunks().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_revoke_without_handle_is_noop() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let broker = Arc::new(MockTaskBroker::new());
        let scheduler = ChunkScheduler::new(store.clone(), broker);
        let chunk = admitted_chunk(&store);
        assert!(!scheduler.revoke(&chunk).await);
    }
}
