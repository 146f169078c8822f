//! Artifact storage tiers.
//!
//! Persisted chunk outputs are registered as [`DatasetArtifact`]s and move
//! between hot, cool and archive tiers through the [`StorageTierManager`].
//! Leaving the archive is asynchronous: a rehydration is requested, recorded
//! as in progress with an ETA, and polled until the object storage reports
//! the object online.

mod config;
mod error;
mod fs_storage;
mod manager;
mod sqlite;
mod traits;
mod types;

pub use config::StorageConfig;
pub use error::{ArtifactStoreError, ObjectStorageError, StorageError};
pub use fs_storage::FsObjectStorage;
pub use manager::StorageTierManager;
pub use sqlite::SqliteArtifactStore;
pub use traits::{ArtifactFilter, ArtifactStore, ObjectStorage};
pub use types::{
    DatasetArtifact, NewArtifact, ObjectProperties, RehydrationHandle, RehydrationPriority,
    RehydrationState, Tier, TierChange, TierTransitionRecord, TransitionOutcome,
};
