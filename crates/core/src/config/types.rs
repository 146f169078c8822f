use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

use crate::aggregator::AggregationConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::policy::PolicyEngineConfig;
use crate::processor::{RetryConfig, WorkerConfig};
use crate::resources::{BudgetConfig, BudgetPreset, ResourceBudget};
use crate::storage::StorageConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub policy: PolicyEngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Single SQLite file shared by every store (and every orchestrator instance).
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("crawlforge.db")
}

/// Sanitized config for API responses
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub budget: SanitizedBudgetConfig,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
    pub orchestrator: OrchestratorConfig,
    pub storage: StorageConfig,
    pub policy: PolicyEngineConfig,
    pub worker: SanitizedWorkerConfig,
}

/// Budget preset together with the effective limits after overrides.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedBudgetConfig {
    pub preset: BudgetPreset,
    pub effective: ResourceBudget,
}

/// Worker config (endpoint hidden)
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedWorkerConfig {
    pub pool_size: usize,
    pub heartbeat_interval_ms: u64,
    pub endpoint_configured: bool,
    pub request_timeout_secs: u64,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            budget: SanitizedBudgetConfig {
                preset: config.budget.preset,
                effective: config.budget.resolve(),
            },
            retry: config.retry.clone(),
            aggregation: config.aggregation.clone(),
            orchestrator: config.orchestrator.clone(),
            storage: config.storage.clone(),
            policy: config.policy.clone(),
            worker: SanitizedWorkerConfig {
                pool_size: config.worker.pool_size,
                heartbeat_interval_ms: config.worker.heartbeat_interval_ms,
                endpoint_configured: config
                    .worker
                    .endpoint
                    .as_deref()
                    .is_some_and(|e| !e.is_empty()),
                request_timeout_secs: config.worker.request_timeout_secs,
            },
        }
    }
}
