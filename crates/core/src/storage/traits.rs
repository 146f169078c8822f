//! Trait definitions for the storage module.

use async_trait::async_trait;

use super::error::{ArtifactStoreError, ObjectStorageError};
use super::types::{
    DatasetArtifact, NewArtifact, ObjectProperties, RehydrationPriority, RehydrationState, Tier,
    TierChange, TierTransitionRecord,
};
use chrono::{DateTime, Utc};

/// An object storage service with access tiers.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Returns the name of this storage implementation.
    fn name(&self) -> &str;

    /// Moves an online object between hot and cool, or into archive.
    async fn set_tier(&self, location: &str, tier: Tier) -> Result<(), ObjectStorageError>;

    /// Reads the object's current tier and size.
    async fn get_properties(&self, location: &str)
        -> Result<ObjectProperties, ObjectStorageError>;

    /// Starts moving an archived object back online. Returns a handle for
    /// the pending operation; completion shows up in `get_properties`.
    async fn rehydrate(
        &self,
        location: &str,
        priority: RehydrationPriority,
    ) -> Result<String, ObjectStorageError>;

    /// Removes the object. Missing objects are not an error.
    async fn delete(&self, location: &str) -> Result<(), ObjectStorageError>;
}

/// Filter for querying artifacts.
#[derive(Debug, Clone, Default)]
pub struct ArtifactFilter {
    pub job_id: Option<String>,
    pub tier: Option<Tier>,
    pub rehydration_state: Option<RehydrationState>,
    pub limit: Option<i64>,
}

impl ArtifactFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_rehydration_state(mut self, state: RehydrationState) -> Self {
        self.rehydration_state = Some(state);
        self
    }
}

/// Authoritative record of artifacts and their tier history.
pub trait ArtifactStore: Send + Sync {
    /// Records an artifact in the hot tier. Registering the same location
    /// twice returns the existing record.
    fn insert_artifact(&self, artifact: NewArtifact) -> Result<DatasetArtifact, ArtifactStoreError>;

    fn get_artifact(&self, id: &str) -> Result<Option<DatasetArtifact>, ArtifactStoreError>;

    /// Artifacts matching the filter, oldest first.
    fn list_artifacts(
        &self,
        filter: &ArtifactFilter,
    ) -> Result<Vec<DatasetArtifact>, ArtifactStoreError>;

    /// Applies a tier change if the record is still in `change.from`, and
    /// appends it to the transition history.
    fn apply_tier_change(
        &self,
        id: &str,
        change: &TierChange,
    ) -> Result<DatasetArtifact, ArtifactStoreError>;

    /// Marks an archived artifact as rehydrating.
    fn mark_rehydrating(
        &self,
        id: &str,
        priority: RehydrationPriority,
        eta: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError>;

    /// Increments the access count and stamps the access time.
    fn record_access(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<DatasetArtifact, ArtifactStoreError>;

    /// Removes the record and appends a deletion to the history.
    fn delete_artifact(&self, id: &str, reason: &str) -> Result<(), ArtifactStoreError>;

    /// Tier history of an artifact, oldest first.
    fn list_transitions(
        &self,
        artifact_id: &str,
    ) -> Result<Vec<TierTransitionRecord>, ArtifactStoreError>;
}
