//! Storage tier manager.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::config::StorageConfig;
use super::error::{ArtifactStoreError, ObjectStorageError, StorageError};
use super::traits::{ArtifactFilter, ArtifactStore, ObjectStorage};
use super::types::{
    DatasetArtifact, NewArtifact, RehydrationHandle, RehydrationPriority, RehydrationState, Tier,
    TierChange, TierTransitionRecord, TransitionOutcome,
};
use crate::metrics;
use crate::processor::ProducedArtifact;

/// Places artifacts across hot/cool/archive tiers and mediates rehydration.
pub struct StorageTierManager {
    artifacts: Arc<dyn ArtifactStore>,
    objects: Arc<dyn ObjectStorage>,
    config: StorageConfig,
}

impl StorageTierManager {
    pub fn new(
        artifacts: Arc<dyn ArtifactStore>,
        objects: Arc<dyn ObjectStorage>,
        config: StorageConfig,
    ) -> Self {
        Self {
            artifacts,
            objects,
            config,
        }
    }

    pub fn artifact_store(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Records an artifact produced by a chunk. New artifacts start hot.
    pub fn register_artifact(
        &self,
        job_id: &str,
        chunk_id: Option<&str>,
        produced: &ProducedArtifact,
    ) -> Result<DatasetArtifact, StorageError> {
        let artifact = self.artifacts.insert_artifact(NewArtifact {
            job_id: job_id.to_string(),
            chunk_id: chunk_id.map(str::to_string),
            location: produced.location.clone(),
            size_bytes: produced.size_bytes,
        })?;
        debug!(
            artifact_id = %artifact.id,
            job_id,
            location = %artifact.location,
            "Artifact registered"
        );
        Ok(artifact)
    }

    pub fn get_artifact(&self, artifact_id: &str) -> Result<DatasetArtifact, StorageError> {
        self.artifacts
            .get_artifact(artifact_id)?
            .ok_or_else(|| StorageError::NotFound(artifact_id.to_string()))
    }

    pub fn list_artifacts(
        &self,
        filter: &ArtifactFilter,
    ) -> Result<Vec<DatasetArtifact>, StorageError> {
        Ok(self.artifacts.list_artifacts(filter)?)
    }

    pub fn list_transitions(
        &self,
        artifact_id: &str,
    ) -> Result<Vec<TierTransitionRecord>, StorageError> {
        Ok(self.artifacts.list_transitions(artifact_id)?)
    }

    /// Moves an artifact between online tiers, or into archive. Leaving the
    /// archive goes through [`StorageTierManager::request_rehydration`].
    pub async fn set_tier(
        &self,
        artifact_id: &str,
        target: Tier,
        reason: &str,
    ) -> Result<TransitionOutcome, StorageError> {
        let artifact = self.get_artifact(artifact_id)?;
        if artifact.tier == target {
            return Ok(TransitionOutcome::AlreadyAtTarget(artifact));
        }
        if artifact.tier == Tier::Archive {
            return Err(StorageError::RequiresRehydration {
                artifact_id: artifact_id.to_string(),
            });
        }

        if let Err(e) = self.objects.set_tier(&artifact.location, target).await {
            metrics::TIER_TRANSITIONS
                .with_label_values(&[target.as_str(), "failed"])
                .inc();
            warn!(
                artifact_id,
                target = %target,
                error = %e,
                "Tier transition rejected by object storage"
            );
            return Err(StorageError::TierTransitionFailed {
                artifact_id: artifact_id.to_string(),
                target,
                reason: e.to_string(),
            });
        }

        let updated = self.artifacts.apply_tier_change(
            artifact_id,
            &TierChange {
                from: artifact.tier,
                to: target,
                rehydration: RehydrationState::Absent,
                reason: reason.to_string(),
            },
        )?;
        metrics::TIER_TRANSITIONS
            .with_label_values(&[target.as_str(), "applied"])
            .inc();
        info!(
            artifact_id,
            from = %artifact.tier,
            to = %target,
            reason,
            "Artifact tier changed"
        );
        Ok(TransitionOutcome::Applied(updated))
    }

    /// Starts moving an archived artifact back to an accessible tier.
    ///
    /// Returns immediately with the rehydration in progress and its ETA;
    /// callers poll [`StorageTierManager::poll_rehydration`]. Repeating the
    /// request while one is in progress returns the pending rehydration.
    pub async fn request_rehydration(
        &self,
        artifact_id: &str,
        priority: RehydrationPriority,
    ) -> Result<RehydrationHandle, StorageError> {
        let artifact = self.get_artifact(artifact_id)?;
        if artifact.tier.is_accessible() {
            return Ok(RehydrationHandle {
                artifact_id: artifact.id,
                handle: None,
                priority,
                state: artifact.rehydration_state,
                eta: None,
            });
        }
        if artifact.rehydration_state == RehydrationState::InProgress
            && artifact.rehydration_priority == Some(priority)
        {
            return Ok(RehydrationHandle {
                artifact_id: artifact.id,
                handle: None,
                priority,
                state: RehydrationState::InProgress,
                eta: artifact.rehydration_eta,
            });
        }

        let handle = self
            .objects
            .rehydrate(&artifact.location, priority)
            .await
            .map_err(|e| StorageError::TierTransitionFailed {
                artifact_id: artifact_id.to_string(),
                target: Tier::Hot,
                reason: e.to_string(),
            })?;

        let eta = Utc::now()
            + chrono::Duration::from_std(self.config.rehydration_eta(priority))
                .unwrap_or(chrono::Duration::zero());
        let eta = match artifact.rehydration_eta {
            Some(existing) if artifact.rehydration_state == RehydrationState::InProgress => {
                existing.min(eta)
            }
            _ => eta,
        };
        let updated = self.artifacts.mark_rehydrating(artifact_id, priority, eta)?;

        metrics::REHYDRATIONS_REQUESTED
            .with_label_values(&[priority.as_str()])
            .inc();
        info!(
            artifact_id,
            priority = priority.as_str(),
            eta = %eta,
            "Rehydration requested"
        );
        Ok(RehydrationHandle {
            artifact_id: updated.id,
            handle: Some(handle),
            priority,
            state: updated.rehydration_state,
            eta: updated.rehydration_eta,
        })
    }

    /// Checks a pending rehydration against the object storage. The
    /// artifact becomes `ready` only once the storage reports it online.
    pub async fn poll_rehydration(
        &self,
        artifact_id: &str,
    ) -> Result<RehydrationState, StorageError> {
        let artifact = self.get_artifact(artifact_id)?;
        if artifact.rehydration_state != RehydrationState::InProgress {
            return Ok(artifact.rehydration_state);
        }

        let props = self
            .objects
            .get_properties(&artifact.location)
            .await
            .map_err(|e| StorageError::TierTransitionFailed {
                artifact_id: artifact_id.to_string(),
                target: Tier::Hot,
                reason: e.to_string(),
            })?;
        if !props.tier.is_accessible() {
            return Ok(RehydrationState::InProgress);
        }

        let updated = self.artifacts.apply_tier_change(
            artifact_id,
            &TierChange {
                from: artifact.tier,
                to: props.tier,
                rehydration: RehydrationState::Ready,
                reason: "rehydration".to_string(),
            },
        )?;
        metrics::REHYDRATIONS_COMPLETED.inc();
        info!(artifact_id, tier = %updated.tier, "Rehydration completed");
        Ok(updated.rehydration_state)
    }

    /// Polls every pending rehydration. Returns how many became ready.
    pub async fn poll_all_rehydrations(&self) -> Result<usize, StorageError> {
        let pending = self.artifacts.list_artifacts(
            &ArtifactFilter::new().with_rehydration_state(RehydrationState::InProgress),
        )?;

        let mut ready = 0;
        for artifact in pending {
            match self.poll_rehydration(&artifact.id).await {
                Ok(RehydrationState::Ready) => ready += 1,
                Ok(_) => {}
                Err(e) => warn!(artifact_id = %artifact.id, error = %e, "Rehydration poll failed"),
            }
        }
        Ok(ready)
    }

    /// Grants access to an artifact and records the access.
    ///
    /// Archived artifacts fail with [`StorageError::NotYetAccessible`],
    /// carrying the ETA while a rehydration is in progress.
    pub fn open_artifact(&self, artifact_id: &str) -> Result<DatasetArtifact, StorageError> {
        let artifact = self.get_artifact(artifact_id)?;
        if !artifact.tier.is_accessible() {
            let eta = match artifact.rehydration_state {
                RehydrationState::InProgress => artifact.rehydration_eta,
                _ => None,
            };
            return Err(StorageError::NotYetAccessible {
                artifact_id: artifact.id,
                eta,
            });
        }
        Ok(self.artifacts.record_access(artifact_id, Utc::now())?)
    }

    /// Removes the object and its record.
    pub async fn delete_artifact(&self, artifact_id: &str, reason: &str) -> Result<(), StorageError> {
        let artifact = self.get_artifact(artifact_id)?;
        match self.objects.delete(&artifact.location).await {
            Ok(()) | Err(ObjectStorageError::NotFound(_)) => {}
            Err(e) => {
                metrics::TIER_TRANSITIONS
                    .with_label_values(&["deleted", "failed"])
                    .inc();
                return Err(StorageError::TierTransitionFailed {
                    artifact_id: artifact_id.to_string(),
                    target: artifact.tier,
                    reason: e.to_string(),
                });
            }
        }

        match self.artifacts.delete_artifact(artifact_id, reason) {
            Ok(()) | Err(ArtifactStoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }
        metrics::TIER_TRANSITIONS
            .with_label_values(&["deleted", "applied"])
            .inc();
        info!(artifact_id, reason, "Artifact deleted");
        Ok(())
    }
}
