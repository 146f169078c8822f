//! Stores that drop out for a set number of calls.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};

use crate::job::{
    AdmissionLimits, AdmissionOutcome, Chunk, ChunkStatus, ChunkUpdate, Job, JobCounters,
    JobFilter, JobStatus, JobStore, JobStoreError, NewJob, SqliteJobStore,
};
use crate::storage::{
    ArtifactFilter, ArtifactStore, ArtifactStoreError, DatasetArtifact, NewArtifact,
    RehydrationPriority, SqliteArtifactStore, TierChange, TierTransitionRecord,
};

/// Takes one failure off the counter; true while failures remain.
fn take_failure(remaining: &AtomicU32) -> bool {
    remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// An in-memory job store whose `get_job` reports the store unavailable
/// for the next `n` calls after [`FlakyJobStore::fail_get_job`].
pub struct FlakyJobStore {
    inner: SqliteJobStore,
    get_job_failures: AtomicU32,
}

impl FlakyJobStore {
    pub fn in_memory() -> Result<Self, JobStoreError> {
        Ok(Self {
            inner: SqliteJobStore::in_memory()?,
            get_job_failures: AtomicU32::new(0),
        })
    }

    pub fn fail_get_job(&self, times: u32) {
        self.get_job_failures.store(times, Ordering::SeqCst);
    }
}

impl JobStore for FlakyJobStore {
    fn create_job(&self, job: NewJob) -> Result<Job, JobStoreError> {
        self.inner.create_job(job)
    }

    fn get_job(&self, id: &str) -> Result<Option<Job>, JobStoreError> {
        if take_failure(&self.get_job_failures) {
            return Err(JobStoreError::Unavailable("database is locked".to_string()));
        }
        self.inner.get_job(id)
    }

    fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.inner.list_jobs(filter)
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<i64, JobStoreError> {
        self.inner.count_jobs(filter)
    }

    fn set_job_status(&self, id: &str, status: JobStatus) -> Result<Job, JobStoreError> {
        self.inner.set_job_status(id, status)
    }

    fn set_job_counters(&self, id: &str, counters: JobCounters) -> Result<(), JobStoreError> {
        self.inner.set_job_counters(id, counters)
    }

    fn request_cancel(&self, id: &str) -> Result<Job, JobStoreError> {
        self.inner.request_cancel(id)
    }

    fn is_cancel_requested(&self, id: &str) -> Result<bool, JobStoreError> {
        self.inner.is_cancel_requested(id)
    }

    fn begin_retry(&self, id: &str) -> Result<Job, JobStoreError> {
        self.inner.begin_retry(id)
    }

    fn get_chunk(&self, id: &str) -> Result<Option<Chunk>, JobStoreError> {
        self.inner.get_chunk(id)
    }

    fn list_chunks(&self, job_id: &str) -> Result<Vec<Chunk>, JobStoreError> {
        self.inner.list_chunks(job_id)
    }

    fn list_admission_candidates(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Chunk>, JobStoreError> {
        self.inner.list_admission_candidates(now, limit)
    }

    fn list_stale_chunks(&self, cutoff: DateTime<Utc>) -> Result<Vec<Chunk>, JobStoreError> {
        self.inner.list_stale_chunks(cutoff)
    }

    fn count_active_chunks(&self) -> Result<u64, JobStoreError> {
        self.inner.count_active_chunks()
    }

    fn scratch_usage_bytes(&self) -> Result<u64, JobStoreError> {
        self.inner.scratch_usage_bytes()
    }

    fn count_chunks_by_status(&self) -> Result<Vec<(ChunkStatus, u64)>, JobStoreError> {
        self.inner.count_chunks_by_status()
    }

    fn try_admit(
        &self,
        chunk_id: &str,
        limits: &AdmissionLimits,
        dispatch_id: &str,
    ) -> Result<AdmissionOutcome, JobStoreError> {
        self.inner.try_admit(chunk_id, limits, dispatch_id)
    }

    fn attach_task(
        &self,
        chunk_id: &str,
        dispatch_id: &str,
        task_handle: &str,
    ) -> Result<(), JobStoreError> {
        self.inner.attach_task(chunk_id, dispatch_id, task_handle)
    }

    fn transition_chunk(&self, chunk_id: &str, update: ChunkUpdate) -> Result<Chunk, JobStoreError> {
        self.inner.transition_chunk(chunk_id, update)
    }

    fn record_heartbeat(&self, chunk_id: &str, dispatch_id: &str) -> Result<bool, JobStoreError> {
        self.inner.record_heartbeat(chunk_id, dispatch_id)
    }
}

/// An in-memory artifact store whose inserts report the store unavailable
/// for the next `n` calls after [`FlakyArtifactStore::fail_inserts`].
pub struct FlakyArtifactStore {
    inner: SqliteArtifactStore,
    insert_failures: AtomicU32,
}

impl FlakyArtifactStore {
    pub fn in_memory() -> Result<Self, ArtifactStoreError> {
        Ok(Self {
            inner: SqliteArtifactStore::in_memory()?,
            insert_failures: AtomicU32::new(0),
        })
    }

    pub fn fail_inserts(&self, times: u32) {
        self.insert_failures.store(times, Ordering::SeqCst);
    }
}

impl ArtifactStore for FlakyArtifactStore {
    fn insert_artifact(&self, artifact: NewArtifact) -> Result<DatasetArtifact, ArtifactStoreError> {
        if take_failure(&self.insert_failures) {
            return Err(ArtifactStoreError::Unavailable(
                "database is locked".to_string(),
            ));
        }
        self.inner.insert_artifact(artifact)
    }

    fn get_artifact(&self, id: &str) -> Result<Option<DatasetArtifact>, ArtifactStoreError> {
        self.inner.get_artifact(id)
    }

    fn list_artifacts(
        &self,
        filter: &ArtifactFilter,
    ) -> Result<Vec<DatasetArtifact>, ArtifactStoreError> {
        self.inner.list_artifacts(filter)
    }

    fn apply_tier_change(
        &self,
        id: &str,
        change: &TierChange,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        self.inner.apply_tier_change(id, change)
    }

    fn mark_rehydrating(
        &self,
        id: &str,
        priority: RehydrationPriority,
        eta: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        self.inner.mark_rehydrating(id, priority, eta)
    }

    fn record_access(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError> {
        self.inner.record_access(id, at)
    }

    fn delete_artifact(&self, id: &str, reason: &str) -> Result<(), ArtifactStoreError> {
        self.inner.delete_artifact(id, reason)
    }

    fn list_transitions(
        &self,
        artifact_id: &str,
    ) -> Result<Vec<TierTransitionRecord>, ArtifactStoreError> {
        self.inner.list_transitions(artifact_id)
    }
}
