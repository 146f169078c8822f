//! Job store trait and types.
//!
//! The job store is the authoritative record of jobs and chunks. Every
//! orchestrator instance reads resource usage from it and admits chunks
//! through a single conditional update against it.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::DbFailure;
use crate::job::{Chunk, ChunkCounters, ChunkStatus, Job, JobCounters, JobStatus};

/// Error type for job store operations.
#[derive(Debug, Error)]
pub enum JobStoreError {
    /// Job not found.
    #[error("job not found: {0}")]
    NotFound(String),

    /// Chunk not found.
    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    /// The chunk state machine does not allow this transition.
    #[error("chunk {chunk_id} cannot move from {from} to {to}")]
    InvalidTransition {
        chunk_id: String,
        from: ChunkStatus,
        to: ChunkStatus,
    },

    /// Cannot perform the operation in the job's current state.
    #[error("cannot {operation} job {job_id}: current status is {current_state}")]
    InvalidState {
        job_id: String,
        current_state: String,
        operation: String,
    },

    /// A concurrent writer changed the record between read and update.
    #[error("concurrent update on {0}")]
    Conflict(String),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Any other database error.
    #[error("database error: {0}")]
    Database(String),
}

impl JobStoreError {
    /// Returns true if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, JobStoreError::Unavailable(_) | JobStoreError::Conflict(_))
    }
}

impl From<rusqlite::Error> for JobStoreError {
    fn from(err: rusqlite::Error) -> Self {
        match crate::db::classify(err) {
            DbFailure::Unavailable(msg) => JobStoreError::Unavailable(msg),
            DbFailure::Query(msg) => JobStoreError::Database(msg),
        }
    }
}

/// A job to be recorded together with its partitioned chunks.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub owner: String,
    pub requested_items: u64,
    pub chunk_size: u64,
    /// Item count of each chunk, in ordinal order.
    pub chunk_item_counts: Vec<u64>,
}

/// Ceilings checked by the atomic admission update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub max_concurrent_chunks: u64,
    pub max_scratch_bytes: u64,
    /// Scratch bytes the chunk reserves while active.
    pub required_bytes: u64,
}

/// Result of an atomic admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionOutcome {
    /// The chunk moved to `admitted` and holds its reservation.
    Admitted(Chunk),
    /// The active-chunk ceiling was reached.
    ConcurrencyCeiling { active: u64 },
    /// The scratch budget cannot hold the chunk's reservation.
    ScratchBudget { used: u64 },
    /// The chunk is no longer waiting for admission (or its job is not running).
    NotEligible { status: ChunkStatus },
}

/// A status change applied to a chunk.
#[derive(Debug, Clone)]
pub struct ChunkUpdate {
    pub status: ChunkStatus,
    /// Only applied if the chunk's current dispatch id matches.
    pub expected_dispatch: Option<String>,
    pub counters: Option<ChunkCounters>,
    pub error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub increment_retry: bool,
}

impl ChunkUpdate {
    pub fn to(status: ChunkStatus) -> Self {
        Self {
            status,
            expected_dispatch: None,
            counters: None,
            error: None,
            next_attempt_at: None,
            increment_retry: false,
        }
    }

    pub fn for_dispatch(mut self, dispatch_id: impl Into<String>) -> Self {
        self.expected_dispatch = Some(dispatch_id.into());
        self
    }

    pub fn with_counters(mut self, counters: ChunkCounters) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn retry_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self.increment_retry = true;
        self
    }

    /// Schedules another attempt without consuming retry budget.
    pub fn requeue_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }
}

/// Filter for querying jobs.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub owner: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

impl JobFilter {
    pub fn new() -> Self {
        Self {
            status: None,
            owner: None,
            limit: 100,
            offset: 0,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }
}

/// Trait for authoritative job/chunk storage backends.
pub trait JobStore: Send + Sync {
    /// Record a job and its chunks (status `created`, chunks `pending`).
    fn create_job(&self, job: NewJob) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError>;

    /// List jobs matching the filter, newest first.
    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Count jobs matching the filter.
    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobStoreError>;

    /// Move a job to a new status, stamping start/completion times.
    fn set_job_status(&self, id: &str, status: JobStatus) -> Result<Job, JobStoreError>;

    /// Overwrite a job's aggregate counters.
    fn set_job_counters(&self, id: &str, counters: JobCounters) -> Result<(), JobStoreError>;

    /// Set the cooperative cancellation flag.
    fn request_cancel(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Whether cancellation was requested for the job.
    fn is_cancel_requested(&self, id: &str) -> Result<bool, JobStoreError>;

    /// Start a new execution attempt: supersede every chunk that did not
    /// complete and create fresh pending chunks in their place.
    fn begin_retry(&self, id: &str) -> Result<Job, JobStoreError>;

    /// Get a chunk by ID.
    fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, JobStoreError>;

    /// Chunks of the job's current attempt, by ordinal.
    fn list_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, JobStoreError>;

    /// Chunks waiting for admission whose backoff has elapsed, belonging to
    /// running jobs without a cancellation request, oldest job first.
    fn list_admission_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Chunk>, JobStoreError>;

    /// Active chunks whose last heartbeat is older than `cutoff`.
    fn list_stale_chunks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>, JobStoreError>;

    /// Number of chunks in an active status across all jobs.
    fn count_active_chunks(&self) -> Result<u64, JobStoreError>;

    /// Sum of scratch bytes reserved by active chunks.
    fn scratch_usage_bytes(&self) -> Result<u64, JobStoreError>;

    /// Count chunks (current attempts only) per status.
    fn count_chunks_by_status(&self) -> Result<Vec<(ChunkStatus, u64)>, JobStoreError>;

    /// Atomically admit a chunk if both ceilings still hold.
    fn try_admit(
        &self,
        chunk_id: &str,
        limits: &AdmissionLimits,
        dispatch_id: &str,
    ) -> Result<AdmissionOutcome, JobStoreError>;

    /// Record the broker's task handle for the chunk's current dispatch.
    fn attach_task(
        &self,
        chunk_id: &str,
        dispatch_id: &str,
        task_handle: &str,
    ) -> Result<(), JobStoreError>;

    /// Apply a validated status transition using compare-and-swap on the
    /// current status.
    fn transition_chunk(&self, chunk_id: &str, update: ChunkUpdate)
        -> Result<Chunk, JobStoreError>;

    /// Refresh the heartbeat of an active chunk's current dispatch.
    fn record_heartbeat(&self, chunk_id: &str, dispatch_id: &str) -> Result<bool, JobStoreError>;
}
