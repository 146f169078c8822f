//! The opaque per-chunk work executed by workers.

use async_trait::async_trait;

use super::types::{DownloadOutcome, PersistOutcome, StageError, ValidationOutcome};
use crate::scheduler::ChunkTask;

/// Download, validation and persistence of a chunk's items.
///
/// The orchestrator only cares about the counters and artifacts each stage
/// reports, never about how items are fetched or scored.
#[async_trait]
pub trait ItemPipeline: Send + Sync {
    /// Returns the pipeline name for logging.
    fn name(&self) -> &str;

    async fn download(&self, task: &ChunkTask) -> Result<DownloadOutcome, StageError>;

    async fn validate(
        &self,
        task: &ChunkTask,
        downloaded: &DownloadOutcome,
    ) -> Result<ValidationOutcome, StageError>;

    async fn persist(
        &self,
        task: &ChunkTask,
        validated: &ValidationOutcome,
    ) -> Result<PersistOutcome, StageError>;
}
