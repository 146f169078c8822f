//! Job aggregator: owns the job record and its verdict.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::verdict::{derive_verdict, AggregationConfig, ChunkTally};
use crate::job::{
    partition_items, Chunk, ChunkCounters, ChunkStatus, Job, JobCounters, JobStatus, JobStore,
    JobStoreError, NewJob,
};
use crate::metrics;

/// Callback invoked with `(job_id, new_status)` whenever a job changes status.
pub type JobUpdateCallback = Arc<dyn Fn(&str, JobStatus) + Send + Sync>;

/// Errors from job-level operations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid job request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Request to create a job.
#[derive(Debug, Clone, Serialize)]
pub struct CreateJobRequest {
    pub owner: String,
    pub requested_items: u64,
    /// Items per chunk; the budget's chunk item count when unset.
    pub chunk_size: Option<u64>,
}

/// Per-chunk view in a progress report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChunkSummary {
    pub chunk_id: String,
    pub ordinal: u32,
    pub status: ChunkStatus,
    pub item_count: u64,
    pub retry_count: u32,
    pub counters: ChunkCounters,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl From<&Chunk> for ChunkSummary {
    fn from(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            ordinal: chunk.ordinal,
            status: chunk.status,
            item_count: chunk.item_count,
            retry_count: chunk.retry_count,
            counters: chunk.counters,
            last_error: chunk.last_error.clone(),
            started_at: chunk.started_at,
            ended_at: chunk.ended_at,
        }
    }
}

/// Progress report for a job.
#[derive(Debug, Clone, Serialize)]
pub struct JobProgress {
    pub job_id: String,
    pub status: JobStatus,
    pub attempt: u32,
    pub cancel_requested: bool,
    pub requested_items: u64,
    pub counters: JobCounters,
    pub tally: ChunkTally,
    pub chunk_summaries: Vec<ChunkSummary>,
}

/// Derives job status from chunk statuses and keeps counters current.
pub struct JobAggregator {
    store: Arc<dyn JobStore>,
    config: AggregationConfig,
    default_chunk_size: u64,
    update_callback: Option<JobUpdateCallback>,
}

impl JobAggregator {
    pub fn new(store: Arc<dyn JobStore>, config: AggregationConfig, default_chunk_size: u64) -> Self {
        Self {
            store,
            config,
            default_chunk_size,
            update_callback: None,
        }
    }

    /// Set callback for job status updates.
    pub fn with_update_callback(mut self, callback: JobUpdateCallback) -> Self {
        self.update_callback = Some(callback);
        self
    }

    /// Records the job and partitions it into pending chunks.
    pub fn create_job(&self, request: CreateJobRequest) -> Result<Job, JobError> {
        if request.requested_items == 0 {
            return Err(JobError::InvalidRequest(
                "requested_items must be greater than 0".to_string(),
            ));
        }
        if request.requested_items > self.config.max_requested_items {
            return Err(JobError::InvalidRequest(format!(
                "requested_items {} exceeds the limit of {}",
                request.requested_items, self.config.max_requested_items
            )));
        }
        let chunk_size = request.chunk_size.unwrap_or(self.default_chunk_size);
        if chunk_size == 0 {
            return Err(JobError::InvalidRequest(
                "chunk_size must be greater than 0".to_string(),
            ));
        }
        if chunk_size > self.config.max_requested_items {
            return Err(JobError::InvalidRequest(format!(
                "chunk_size {} exceeds the limit of {}",
                chunk_size, self.config.max_requested_items
            )));
        }
        let chunk_count = request.requested_items.div_ceil(chunk_size);
        if chunk_count > self.config.max_chunks_per_job {
            return Err(JobError::InvalidRequest(format!(
                "{} items in chunks of {} make {} chunks, more than the limit of {}",
                request.requested_items, chunk_size, chunk_count, self.config.max_chunks_per_job
            )));
        }

        let chunk_item_counts = partition_items(request.requested_items, chunk_size);
        let job = self.store.create_job(NewJob {
            owner: request.owner,
            requested_items: request.requested_items,
            chunk_size,
            chunk_item_counts,
        })?;

        info!(
            job_id = %job.id,
            owner = %job.owner,
            requested_items = job.requested_items,
            chunks = job.chunk_ids.len(),
            "Job created"
        );
        self.notify(&job.id, job.status);
        Ok(job)
    }

    /// `created -> running`; its chunks become eligible for admission.
    pub fn start_job(&self, job_id: &str) -> Result<Job, JobError> {
        let job = self.get(job_id)?;
        if job.status != JobStatus::Created {
            return Err(invalid_state(&job, "start").into());
        }
        if job.cancel_requested {
            return Err(invalid_state(&job, "start a cancelled").into());
        }

        let job = self.store.set_job_status(job_id, JobStatus::Running)?;
        info!(job_id, "Job started");
        self.notify(job_id, job.status);
        Ok(job)
    }

    /// Sets the cooperative cancellation flag.
    pub fn request_cancel(&self, job_id: &str) -> Result<Job, JobError> {
        Ok(self.store.request_cancel(job_id)?)
    }

    /// Starts a new execution attempt that re-creates only the chunks that
    /// did not complete.
    pub fn retry_job(&self, job_id: &str) -> Result<Job, JobError> {
        let job = self.store.begin_retry(job_id)?;
        info!(
            job_id,
            attempt = job.attempt,
            "Job retry started"
        );
        self.notify(job_id, job.status);
        // Nothing to redo if every chunk had completed already.
        self.refresh(job_id)?;
        Ok(self.get(job_id)?)
    }

    /// Recomputes counters from the current chunk set and applies the
    /// verdict once every chunk is terminal. Returns the new terminal status
    /// if this call set it.
    pub fn refresh(&self, job_id: &str) -> Result<Option<JobStatus>, JobError> {
        let job = self.get(job_id)?;
        if job.status.is_terminal() {
            return Ok(None);
        }

        let chunks = self.store.list_chunks(job_id)?;
        let counters = JobCounters::from_chunks(&chunks);
        if counters != job.counters {
            self.store.set_job_counters(job_id, counters)?;
        }

        let Some(verdict) = derive_verdict(&chunks, job.cancel_requested, &self.config) else {
            return Ok(None);
        };

        match self.store.set_job_status(job_id, verdict) {
            Ok(_) => {}
            Err(JobStoreError::Conflict(_)) => {
                // Another orchestrator settled the job first.
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let tally = ChunkTally::from_chunks(&chunks);
        match verdict {
            JobStatus::Completed | JobStatus::Cancelled => info!(
                job_id,
                status = %verdict,
                items_completed = counters.items_completed,
                items_failed = counters.items_failed,
                "Job finished"
            ),
            _ => warn!(
                job_id,
                status = %verdict,
                chunks_failed = tally.failed,
                chunks_completed = tally.completed,
                "Job finished with failures"
            ),
        }
        metrics::JOB_VERDICTS
            .with_label_values(&[verdict.as_str()])
            .inc();
        self.notify(job_id, verdict);
        Ok(Some(verdict))
    }

    pub fn progress(&self, job_id: &str) -> Result<JobProgress, JobError> {
        let job = self.get(job_id)?;
        let chunks = self.store.list_chunks(job_id)?;
        Ok(JobProgress {
            job_id: job.id,
            status: job.status,
            attempt: job.attempt,
            cancel_requested: job.cancel_requested,
            requested_items: job.requested_items,
            counters: JobCounters::from_chunks(&chunks),
            tally: ChunkTally::from_chunks(&chunks),
            chunk_summaries: chunks.iter().map(ChunkSummary::from).collect(),
        })
    }

    fn get(&self, job_id: &str) -> Result<Job, JobStoreError> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| JobStoreError::NotFound(job_id.to_string()))
    }

    fn notify(&self, job_id: &str, status: JobStatus) {
        if let Some(ref callback) = self.update_callback {
            callback(job_id, status);
        }
    }
}

fn invalid_state(job: &Job, operation: &str) -> JobStoreError {
    JobStoreError::InvalidState {
        job_id: job.id.clone(),
        current_state: job.status.to_string(),
        operation: operation.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AdmissionLimits, ChunkUpdate, JobFilter, SqliteJobStore};
    use std::sync::Mutex;

    fn aggregator() -> (Arc<SqliteJobStore>, JobAggregator) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let aggregator = JobAggregator::new(store.clone(), AggregationConfig::default(), 500);
        (store, aggregator)
    }

    fn request(items: u64) -> CreateJobRequest {
        CreateJobRequest {
            owner: "tenant-1".to_string(),
            requested_items: items,
            chunk_size: None,
        }
    }

    fn finish(store: &SqliteJobStore, chunk_id: &str, status: ChunkStatus, completed: u64, failed: u64) {
        let limits = AdmissionLimits {
            max_concurrent_chunks: 100,
            max_scratch_bytes: 1_000_000,
            required_bytes: 1,
        };
        let dispatch = uuid::Uuid::new_v4().to_string();
        store.try_admit(chunk_id, &limits, &dispatch).unwrap();
        store
            .transition_chunk(
                chunk_id,
                ChunkUpdate::to(status)
                    .for_dispatch(dispatch)
                    .with_counters(ChunkCounters {
                        items_downloaded: completed + failed,
                        items_completed: completed,
                        items_failed: failed,
                    }),
            )
            .unwrap();
    }

    #[test]
    fn test_create_job_partitions_items() {
        let (_, aggregator) = aggregator();
        let job = aggregator.create_job(request(1200)).unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.chunk_size, 500);

        let progress = aggregator.progress(&job.id).unwrap();
        let sizes: Vec<u64> = progress.chunk_summaries.iter().map(|c| c.item_count).collect();
        assert_eq!(sizes, vec![500, 500, 200]);
    }

    #[test]
    fn test_create_job_rejects_empty_request() {
        let (_, aggregator) = aggregator();
        assert!(matches!(
            aggregator.create_job(request(0)),
            Err(JobError::InvalidRequest(_))
        ));
        assert!(matches!(
            aggregator.create_job(CreateJobRequest {
                chunk_size: Some(0),
                ..request(10)
            }),
            Err(JobError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_create_job_rejects_oversized_request() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let config = AggregationConfig {
            max_requested_items: 1_000,
            max_chunks_per_job: 4,
            ..Default::default()
        };
        let aggregator = JobAggregator::new(store.clone(), config, 500);

        for oversized in [
            request(1_001),
            request(u64::MAX),
            CreateJobRequest {
                chunk_size: Some(1),
                ..request(1_000)
            },
            CreateJobRequest {
                chunk_size: Some(u64::MAX),
                ..request(10)
            },
        ] {
            assert!(matches!(
                aggregator.create_job(oversized),
                Err(JobError::InvalidRequest(_))
            ));
        }
        assert_eq!(store.count_jobs(&JobFilter::new()).unwrap(), 0);

        let job = aggregator
            .create_job(CreateJobRequest {
                chunk_size: Some(250),
                ..request(1_000)
            })
            .unwrap();
        assert_eq!(job.chunk_ids.len(), 4);
    }

    #[test]
    fn test_start_only_from_created() {
        let (_, aggregator) = aggregator();
        let job = aggregator.create_job(request(10)).unwrap();
        assert_eq!(aggregator.start_job(&job.id).unwrap().status, JobStatus::Running);
        assert!(matches!(
            aggregator.start_job(&job.id),
            Err(JobError::Store(JobStoreError::InvalidState { .. }))
        ));
    }

    #[test]
    fn test_refresh_waits_for_all_chunks() {
        let (store, aggregator) = aggregator();
        let job = aggregator.create_job(request(1000)).unwrap();
        aggregator.start_job(&job.id).unwrap();

        finish(&store, &job.chunk_ids[0], ChunkStatus::Completed, 500, 0);
        assert_eq!(aggregator.refresh(&job.id).unwrap(), None);

        finish(&store, &job.chunk_ids[1], ChunkStatus::Completed, 480, 20);
        assert_eq!(aggregator.refresh(&job.id).unwrap(), Some(JobStatus::Completed));

        let job = store.get_job(&job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.counters.items_completed, 980);
        assert_eq!(job.counters.items_failed, 20);
        assert_eq!(job.counters.total_items_processed, 1000);
        assert!(job.completed_at.is_some());

        // Terminal jobs are left alone.
        assert_eq!(aggregator.refresh(&job.id).unwrap(), None);
    }

    #[test]
    fn test_partial_failure_and_retry_preserves_completed_chunks() {
        let (store, aggregator) = aggregator();
        let job = aggregator.create_job(request(1000)).unwrap();
        aggregator.start_job(&job.id).unwrap();

        finish(&store, &job.chunk_ids[0], ChunkStatus::Completed, 500, 0);
        finish(&store, &job.chunk_ids[1], ChunkStatus::Failed, 0, 0);
        assert_eq!(
            aggregator.refresh(&job.id).unwrap(),
            Some(JobStatus::CompletedWithErrors)
        );

        let retried = aggregator.retry_job(&job.id).unwrap();
        assert_eq!(retried.status, JobStatus::Running);
        assert_eq!(retried.attempt, 2);

        let progress = aggregator.progress(&job.id).unwrap();
        assert_eq!(progress.chunk_summaries[0].status, ChunkStatus::Completed);
        assert_eq!(progress.chunk_summaries[1].status, ChunkStatus::Pending);
        assert_eq!(progress.counters.items_completed, 500);
    }

    #[test]
    fn test_retry_rejected_for_completed_job() {
        let (store, aggregator) = aggregator();
        let job = aggregator.create_job(request(10)).unwrap();
        aggregator.start_job(&job.id).unwrap();
        finish(&store, &job.chunk_ids[0], ChunkStatus::Completed, 10, 0);
        aggregator.refresh(&job.id).unwrap();

        assert!(matches!(
            aggregator.retry_job(&job.id),
            Err(JobError::Store(JobStoreError::InvalidState { .. }))
        ));
    }

    #[test]
    fn test_update_callback_sees_every_status() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let callback: JobUpdateCallback = Arc::new(move |_job_id: &str, status: JobStatus| {
            seen_cb.lock().unwrap().push(status);
        });
        let aggregator = JobAggregator::new(store.clone(), AggregationConfig::default(), 10)
            .with_update_callback(callback);

        let job = aggregator.create_job(request(10)).unwrap();
        aggregator.start_job(&job.id).unwrap();
        finish(&store, &job.chunk_ids[0], ChunkStatus::Failed, 0, 10);
        aggregator.refresh(&job.id).unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![JobStatus::Created, JobStatus::Running, JobStatus::Failed]
        );
    }

    #[test]
    fn test_missing_job() {
        let (_, aggregator) = aggregator();
        assert!(matches!(
            aggregator.progress("missing"),
            Err(JobError::Store(JobStoreError::NotFound(_)))
        ));
    }
}
