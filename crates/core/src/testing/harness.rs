//! In-memory orchestrator wiring for end-to-end tests.

use std::sync::Arc;

use crate::aggregator::AggregationConfig;
use crate::job::{Chunk, ChunkCounters, JobStore, SqliteJobStore};
use crate::orchestrator::{DatasetOrchestrator, OrchestratorConfig, OrchestratorParts};
use crate::policy::{PolicyEngine, PolicyEngineConfig, SqlitePolicyStore};
use crate::processor::{ProducedArtifact, RetryConfig};
use crate::resources::ResourceBudget;
use crate::retry::StoreRetryPolicy;
use crate::scheduler::{ChunkTask, WorkerEvent};
use crate::storage::{SqliteArtifactStore, StorageConfig, StorageTierManager};

use super::{MockObjectStorage, MockTaskBroker};

/// An orchestrator over in-memory stores, a recording broker and mock
/// object storage. Background loops are not started; tests call
/// `admit_pending`, `process_event` and `check_timeouts` directly.
pub struct TestHarness {
    pub store: Arc<SqliteJobStore>,
    pub broker: Arc<MockTaskBroker>,
    pub objects: Arc<MockObjectStorage>,
    pub tiers: Arc<StorageTierManager>,
    pub policies: Arc<PolicyEngine>,
    pub orchestrator: Arc<DatasetOrchestrator>,
}

/// Options for [`TestHarness::build`].
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    pub budget: ResourceBudget,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
    pub orchestrator: OrchestratorConfig,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            budget: super::fixtures::budget(4, 1024 * 1024),
            retry: RetryConfig::default().with_initial_delay_ms(0),
            aggregation: AggregationConfig::default(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl TestHarness {
    pub fn new(budget: ResourceBudget) -> Self {
        Self::build(HarnessOptions {
            budget,
            ..Default::default()
        })
    }

    pub fn build(options: HarnessOptions) -> Self {
        let store = Arc::new(SqliteJobStore::in_memory().expect("in-memory job store"));
        let broker = Arc::new(MockTaskBroker::new());
        let objects = Arc::new(MockObjectStorage::new());
        let tiers = Arc::new(StorageTierManager::new(
            Arc::new(SqliteArtifactStore::in_memory().expect("in-memory artifact store")),
            objects.clone(),
            StorageConfig::default(),
        ));
        let policies = Arc::new(PolicyEngine::new(
            Arc::new(SqlitePolicyStore::in_memory().expect("in-memory policy store")),
            tiers.clone(),
            PolicyEngineConfig::default(),
        ));

        let orchestrator = DatasetOrchestrator::new(
            options.orchestrator,
            OrchestratorParts {
                store: store.clone(),
                broker: broker.clone(),
                tiers: tiers.clone(),
                policies: policies.clone(),
                budget: options.budget,
                retry: options.retry,
                aggregation: options.aggregation,
            },
        )
        .with_store_retry(StoreRetryPolicy::none());

        Self {
            store,
            broker,
            objects,
            tiers,
            policies,
            orchestrator: Arc::new(orchestrator),
        }
    }

    pub fn chunks(&self, job_id: &str) -> Vec<Chunk> {
        self.store.list_chunks(job_id).expect("list chunks")
    }

    /// Reports `Started` followed by `Completed` for the task.
    pub async fn complete(&self, task: &ChunkTask, counters: ChunkCounters) {
        self.event(started(task)).await;
        self.event(WorkerEvent::Completed {
            chunk_id: task.chunk_id.clone(),
            dispatch_id: task.dispatch_id.clone(),
            counters,
            artifacts: vec![ProducedArtifact {
                location: format!("mock://{}/{}", task.job_id, task.chunk_id),
                size_bytes: counters.items_completed * 1024,
            }],
        })
        .await;
    }

    /// Reports `Started` followed by `Failed` for the task.
    pub async fn fail(&self, task: &ChunkTask, error: &str) {
        self.event(started(task)).await;
        self.event(WorkerEvent::Failed {
            chunk_id: task.chunk_id.clone(),
            dispatch_id: task.dispatch_id.clone(),
            error: error.to_string(),
            counters: ChunkCounters::default(),
        })
        .await;
    }

    pub async fn event(&self, event: WorkerEvent) {
        self.orchestrator
            .process_event(event)
            .await
            .expect("process worker event");
    }
}

fn started(task: &ChunkTask) -> WorkerEvent {
    WorkerEvent::Started {
        chunk_id: task.chunk_id.clone(),
        dispatch_id: task.dispatch_id.clone(),
    }
}
