use std::sync::Arc;

use crawlforge_core::scheduler::PoolStatus;
use crawlforge_core::{Config, DatasetOrchestrator, SanitizedConfig, WorkerPoolBroker};

/// Shared application state
pub struct AppState {
    config: Config,
    orchestrator: Option<Arc<DatasetOrchestrator>>,
    pool: Option<Arc<WorkerPoolBroker>>,
}

impl AppState {
    pub fn new(
        config: Config,
        orchestrator: Option<Arc<DatasetOrchestrator>>,
        pool: Option<Arc<WorkerPoolBroker>>,
    ) -> Self {
        Self {
            config,
            orchestrator,
            pool,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    /// The orchestrator, when a worker endpoint is configured.
    pub fn orchestrator(&self) -> Option<&Arc<DatasetOrchestrator>> {
        self.orchestrator.as_ref()
    }

    pub fn pool_status(&self) -> Option<PoolStatus> {
        self.pool.as_ref().map(|pool| pool.status())
    }
}
