//! Jobs, chunks and their authoritative store.

mod sqlite_store;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use store::{
    AdmissionLimits, AdmissionOutcome, ChunkUpdate, JobFilter, JobStore, JobStoreError, NewJob,
};
pub use types::{
    partition_items, Chunk, ChunkCounters, ChunkStatus, Job, JobCounters, JobStatus,
};
