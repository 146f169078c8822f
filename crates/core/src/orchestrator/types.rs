//! Types for the dataset orchestrator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::aggregator::JobError;
use crate::job::{Chunk, ChunkStatus, JobStoreError};
use crate::policy::{PolicyError, PolicyStoreError};
use crate::resources::{DenyReason, ResourceBudget, ResourceSnapshot};
use crate::storage::{ArtifactStoreError, StorageError};

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// A resource ceiling was reached; retry later.
    #[error("admission denied: {0}")]
    AdmissionDenied(DenyReason),

    /// A chunk exhausted its retries on worker-reported errors.
    #[error("chunk {chunk_id} failed: {error}")]
    ChunkExecutionFailed { chunk_id: String, error: String },

    /// A chunk exhausted its retries on lost heartbeats.
    #[error("chunk {chunk_id} timed out")]
    ChunkTimeout { chunk_id: String },

    /// The object storage rejected a tier change.
    #[error("tier transition of {artifact_id} failed: {reason}")]
    TierTransitionFailed { artifact_id: String, reason: String },

    /// The artifact is archived or still rehydrating.
    #[error("artifact {artifact_id} is not yet accessible")]
    ArtifactNotYetAccessible {
        artifact_id: String,
        eta: Option<DateTime<Utc>>,
    },

    /// The authoritative store could not be reached.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("cannot {operation} job {job_id}: current status is {current_state}")]
    InvalidState {
        job_id: String,
        current_state: String,
        operation: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Any other store or storage failure.
    #[error("{0}")]
    Internal(String),
}

impl OrchestratorError {
    /// The surfaced error of a chunk that failed terminally.
    pub fn for_failed_chunk(chunk: &Chunk) -> Option<Self> {
        if chunk.status != ChunkStatus::Failed {
            return None;
        }
        let error = chunk.last_error.clone().unwrap_or_default();
        Some(if error.starts_with("timeout:") {
            OrchestratorError::ChunkTimeout {
                chunk_id: chunk.id.clone(),
            }
        } else {
            OrchestratorError::ChunkExecutionFailed {
                chunk_id: chunk.id.clone(),
                error,
            }
        })
    }
}

impl From<JobStoreError> for OrchestratorError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => OrchestratorError::JobNotFound(id),
            JobStoreError::ChunkNotFound(id) => OrchestratorError::NotFound(id),
            JobStoreError::InvalidState {
                job_id,
                current_state,
                operation,
            } => OrchestratorError::InvalidState {
                job_id,
                current_state,
                operation,
            },
            JobStoreError::Unavailable(msg) => OrchestratorError::StoreUnavailable(msg),
            other => OrchestratorError::Internal(other.to_string()),
        }
    }
}

impl From<JobError> for OrchestratorError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::InvalidRequest(msg) => OrchestratorError::InvalidRequest(msg),
            JobError::Store(e) => e.into(),
        }
    }
}

impl From<StorageError> for OrchestratorError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => OrchestratorError::NotFound(id),
            StorageError::NotYetAccessible { artifact_id, eta } => {
                OrchestratorError::ArtifactNotYetAccessible { artifact_id, eta }
            }
            StorageError::RequiresRehydration { artifact_id } => {
                OrchestratorError::ArtifactNotYetAccessible {
                    artifact_id,
                    eta: None,
                }
            }
            StorageError::TierTransitionFailed {
                artifact_id,
                reason,
                ..
            } => OrchestratorError::TierTransitionFailed {
                artifact_id,
                reason,
            },
            StorageError::Store(ArtifactStoreError::Unavailable(msg)) => {
                OrchestratorError::StoreUnavailable(msg)
            }
            StorageError::Store(e) => OrchestratorError::Internal(e.to_string()),
        }
    }
}

impl From<PolicyError> for OrchestratorError {
    fn from(err: PolicyError) -> Self {
        match err {
            PolicyError::NotFound(id) => OrchestratorError::NotFound(id),
            PolicyError::NameTaken(name) => {
                OrchestratorError::InvalidRequest(format!("policy name already in use: {}", name))
            }
            PolicyError::Store(PolicyStoreError::Unavailable(msg)) => {
                OrchestratorError::StoreUnavailable(msg)
            }
            PolicyError::Store(e) => OrchestratorError::Internal(e.to_string()),
        }
    }
}

/// Result of one admission sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Chunks considered.
    pub candidates: usize,
    /// Admitted and accepted by the broker.
    pub admitted: usize,
    /// Admitted but refused by the broker.
    pub requeued: usize,
    /// Denied for capacity or unknown resource usage.
    pub denied: usize,
}

impl SweepReport {
    /// Every candidate was denied.
    pub fn fully_denied(&self) -> bool {
        self.candidates > 0 && self.admitted == 0
    }
}

/// Current status of the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    /// Whether the background loops are running.
    pub running: bool,
    pub broker: String,
    pub budget: ResourceBudget,
    pub resources: ResourceSnapshot,
    /// `None` when the store could not be read.
    pub jobs_by_status: Option<BTreeMap<String, u64>>,
    /// `None` when the store could not be read.
    pub chunks_by_status: Option<BTreeMap<String, u64>>,
}
