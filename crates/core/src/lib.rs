pub mod aggregator;
pub mod config;
pub(crate) mod db;
pub mod job;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod processor;
pub mod resources;
pub mod retry;
pub mod scheduler;
pub mod storage;
pub mod testing;

pub use aggregator::{AggregationConfig, CreateJobRequest, JobAggregator, JobError, JobProgress};
pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use job::{Chunk, ChunkStatus, Job, JobStatus, JobStore, JobStoreError, SqliteJobStore};
pub use orchestrator::{
    DatasetOrchestrator, OrchestratorConfig, OrchestratorError, OrchestratorParts,
    OrchestratorStatus, SweepReport,
};
pub use policy::{PolicyEngine, PolicyError, SqlitePolicyStore};
pub use processor::{ChunkRunner, HttpItemPipeline, ItemPipeline};
pub use resources::{AdmissionController, ResourceBudget, ResourceMonitor};
pub use scheduler::{TaskBroker, WorkerEvent, WorkerPoolBroker};
pub use storage::{FsObjectStorage, SqliteArtifactStore, StorageTierManager, Tier};
