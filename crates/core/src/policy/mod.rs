//! Archival and cleanup policies.

mod config;
mod engine;
mod sqlite;
mod store;
mod types;

pub use config::PolicyEngineConfig;
pub use engine::{PolicyEngine, PolicyError};
pub use sqlite::SqlitePolicyStore;
pub use store::{PolicyStore, PolicyStoreError};
pub use types::{
    ExecutionResult, NewExecutionLog, NewPolicy, Policy, PolicyAction, PolicyExecutionLog,
    PolicyKind, PolicyPredicate, RunOutcome,
};
