//! Mock item pipeline for testing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::processor::{
    DownloadOutcome, ItemPipeline, PersistOutcome, ProducedArtifact, Stage, StageError,
    ValidationOutcome,
};
use crate::scheduler::ChunkTask;

type StageHook = Arc<dyn Fn() + Send + Sync>;

/// Bytes reported per persisted item.
const BYTES_PER_ITEM: u64 = 1024;

/// Mock implementation of the ItemPipeline trait.
///
/// Provides controllable behavior for testing:
/// - Every downloaded item is valid unless `set_invalid_items` says otherwise
/// - One-shot stage failures via `fail_next`
/// - Persistent failures for chunk ordinals via `fail_ordinal`
/// - Hooks that run after a stage, e.g. to request cancellation
///
/// Each successful persist produces one artifact at
/// `mock://{job_id}/{chunk_id}/{dispatch_id}`.
pub struct MockItemPipeline {
    invalid_items: Arc<RwLock<u64>>,
    next_failures: Arc<RwLock<HashMap<Stage, StageError>>>,
    failing_ordinals: Arc<RwLock<HashSet<u32>>>,
    hooks: Arc<RwLock<HashMap<Stage, StageHook>>>,
    stage_delay: Arc<RwLock<Duration>>,
    stages_run: Arc<RwLock<Vec<Stage>>>,
}

impl Default for MockItemPipeline {
    fn default() -> Self {
        Self::new()
    }
}

impl MockItemPipeline {
    pub fn new() -> Self {
        Self {
            invalid_items: Arc::new(RwLock::new(0)),
            next_failures: Arc::new(RwLock::new(HashMap::new())),
            failing_ordinals: Arc::new(RwLock::new(HashSet::new())),
            hooks: Arc::new(RwLock::new(HashMap::new())),
            stage_delay: Arc::new(RwLock::new(Duration::ZERO)),
            stages_run: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Items of every chunk that fail validation.
    pub async fn set_invalid_items(&self, count: u64) {
        *self.invalid_items.write().await = count;
    }

    /// The next run of `stage` fails with `error`.
    pub async fn fail_next(&self, stage: Stage, error: StageError) {
        self.next_failures.write().await.insert(stage, error);
    }

    /// Every download of the chunk with this ordinal fails.
    pub async fn fail_ordinal(&self, ordinal: u32) {
        self.failing_ordinals.write().await.insert(ordinal);
    }

    /// Stops failing the chunk with this ordinal.
    pub async fn heal_ordinal(&self, ordinal: u32) {
        self.failing_ordinals.write().await.remove(&ordinal);
    }

    /// Runs `hook` after every successful run of `stage`.
    pub async fn on_stage_finished(&self, stage: Stage, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.write().await.insert(stage, Arc::new(hook));
    }

    /// Simulated duration of each stage.
    pub async fn set_stage_delay(&self, delay: Duration) {
        *self.stage_delay.write().await = delay;
    }

    /// Stages run so far, across all chunks.
    pub async fn stages_run(&self) -> Vec<Stage> {
        self.stages_run.read().await.clone()
    }

    async fn enter(&self, stage: Stage) -> Result<(), StageError> {
        self.stages_run.write().await.push(stage);
        let delay = *self.stage_delay.read().await;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match self.next_failures.write().await.remove(&stage) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn finish(&self, stage: Stage) {
        let hook = self.hooks.read().await.get(&stage).cloned();
        if let Some(hook) = hook {
            hook();
        }
    }
}

#[async_trait]
impl ItemPipeline for MockItemPipeline {
    fn name(&self) -> &str {
        "mock"
    }

    async fn download(&self, task: &ChunkTask) -> Result<DownloadOutcome, StageError> {
        self.enter(Stage::Download).await?;
        if self.failing_ordinals.read().await.contains(&task.ordinal) {
            return Err(StageError::Failed {
                stage: Stage::Download,
                message: format!("source refused chunk {}", task.ordinal),
            });
        }
        self.finish(Stage::Download).await;
        Ok(DownloadOutcome {
            items_downloaded: task.item_count,
            items_failed: 0,
            scratch_ref: Some(format!("scratch/{}", task.chunk_id)),
        })
    }

    async fn validate(
        &self,
        _task: &ChunkTask,
        downloaded: &DownloadOutcome,
    ) -> Result<ValidationOutcome, StageError> {
        self.enter(Stage::Validate).await?;
        let invalid = (*self.invalid_items.read().await).min(downloaded.items_downloaded);
        self.finish(Stage::Validate).await;
        Ok(ValidationOutcome {
            items_valid: downloaded.items_downloaded - invalid,
            items_invalid: invalid,
            scratch_ref: downloaded.scratch_ref.clone(),
        })
    }

    async fn persist(
        &self,
        task: &ChunkTask,
        validated: &ValidationOutcome,
    ) -> Result<PersistOutcome, StageError> {
        self.enter(Stage::Persist).await?;
        self.finish(Stage::Persist).await;
        Ok(PersistOutcome {
            items_persisted: validated.items_valid,
            artifacts: vec![ProducedArtifact {
                location: format!(
                    "mock://{}/{}/{}",
                    task.job_id, task.chunk_id, task.dispatch_id
                ),
                size_bytes: validated.items_valid * BYTES_PER_ITEM,
            }],
        })
    }
}
