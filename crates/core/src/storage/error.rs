//! Error types for the storage module.

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::types::Tier;
use crate::db::DbFailure;

/// Errors reported by an object storage service.
#[derive(Debug, Error)]
pub enum ObjectStorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// The service refused the operation.
    #[error("operation on {location} rejected: {reason}")]
    Rejected { location: String, reason: String },

    #[error("object storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the artifact record store.
#[derive(Debug, Error)]
pub enum ArtifactStoreError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The record changed between read and update.
    #[error("concurrent update on artifact {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for ArtifactStoreError {
    fn from(err: rusqlite::Error) -> Self {
        match crate::db::classify(err) {
            DbFailure::Unavailable(msg) => ArtifactStoreError::Unavailable(msg),
            DbFailure::Query(msg) => ArtifactStoreError::Database(msg),
        }
    }
}

/// Errors from the storage tier manager.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact not found: {0}")]
    NotFound(String),

    /// The artifact is archived or still rehydrating.
    #[error("artifact {artifact_id} is not yet accessible")]
    NotYetAccessible {
        artifact_id: String,
        eta: Option<DateTime<Utc>>,
    },

    /// Leaving the archive tier goes through `request_rehydration`.
    #[error("artifact {artifact_id} is archived and must be rehydrated first")]
    RequiresRehydration { artifact_id: String },

    /// The object storage service rejected the transition.
    #[error("tier transition of {artifact_id} to {target} failed: {reason}")]
    TierTransitionFailed {
        artifact_id: String,
        target: Tier,
        reason: String,
    },

    #[error(transparent)]
    Store(#[from] ArtifactStoreError),
}
