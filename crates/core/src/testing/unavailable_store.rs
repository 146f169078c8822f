//! A job store that is never reachable.

use chrono::{DateTime, Utc};

use crate::job::{
    AdmissionLimits, AdmissionOutcome, Chunk, ChunkStatus, ChunkUpdate, Job, JobCounters,
    JobFilter, JobStatus, JobStore, JobStoreError, NewJob,
};

/// Every call fails with `JobStoreError::Unavailable`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableJobStore;

fn down<T>() -> Result<T, JobStoreError> {
    Err(JobStoreError::Unavailable("store is down".to_string()))
}

impl JobStore for UnavailableJobStore {
    fn create_job(&self, _job: NewJob) -> Result<Job, JobStoreError> {
        down()
    }

    fn get_job(&self, _id: &str) -> Result<Option<Job>, JobStoreError> {
        down()
    }

    fn list_jobs(&self, _filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        down()
    }

    fn count_jobs(&self, _filter: &JobFilter) -> Result<i64, JobStoreError> {
        down()
    }

    fn set_job_status(&self, _id: &str, _status: JobStatus) -> Result<Job, JobStoreError> {
        down()
    }

    fn set_job_counters(&self, _id: &str, _counters: JobCounters) -> Result<(), JobStoreError> {
        down()
    }

    fn request_cancel(&self, _id: &str) -> Result<Job, JobStoreError> {
        down()
    }

    fn is_cancel_requested(&self, _id: &str) -> Result<bool, JobStoreError> {
        down()
    }

    fn begin_retry(&self, _id: &str) -> Result<Job, JobStoreError> {
        down()
    }

    fn get_chunk(&self, _id: &str) -> Result<Option<Chunk>, JobStoreError> {
        down()
    }

    fn list_chunks(&self, _job_id: &str) -> Result<Vec<Chunk>, JobStoreError> {
        down()
    }

    fn list_admission_candidates(
        &self,
        _now: DateTime<Utc>,
        _limit: i64,
    ) -> Result<Vec<Chunk>, JobStoreError> {
        down()
    }

    fn list_stale_chunks(&self, _cutoff: DateTime<Utc>) -> Result<Vec<Chunk>, JobStoreError> {
        down()
    }

    fn count_active_chunks(&self) -> Result<u64, JobStoreError> {
        down()
    }

    fn scratch_usage_bytes(&self) -> Result<u64, JobStoreError> {
        down()
    }

    fn count_chunks_by_status(&self) -> Result<Vec<(ChunkStatus, u64)>, JobStoreError> {
        down()
    }

    fn try_admit(
        &self,
        _chunk_id: &str,
        _limits: &AdmissionLimits,
        _dispatch_id: &str,
    ) -> Result<AdmissionOutcome, JobStoreError> {
        down()
    }

    fn attach_task(
        &self,
        _chunk_id: &str,
        _dispatch_id: &str,
        _task_handle: &str,
    ) -> Result<(), JobStoreError> {
        down()
    }

    fn transition_chunk(
        &self,
        _chunk_id: &str,
        _update: ChunkUpdate,
    ) -> Result<Chunk, JobStoreError> {
        down()
    }

    fn record_heartbeat(&self, _chunk_id: &str, _dispatch_id: &str) -> Result<bool, JobStoreError> {
        down()
    }
}
