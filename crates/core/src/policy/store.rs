//! Policy store trait.

use std::collections::HashSet;

use thiserror::Error;

use super::types::{NewExecutionLog, NewPolicy, Policy, PolicyExecutionLog};
use crate::db::DbFailure;

/// Error type for policy store operations.
#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("policy not found: {0}")]
    NotFound(String),

    #[error("policy name already in use: {0}")]
    NameTaken(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for PolicyStoreError {
    fn from(err: rusqlite::Error) -> Self {
        match crate::db::classify(err) {
            DbFailure::Unavailable(msg) => PolicyStoreError::Unavailable(msg),
            DbFailure::Query(msg) => PolicyStoreError::Database(msg),
        }
    }
}

/// Storage for policies, their execution log and per-run progress.
pub trait PolicyStore: Send + Sync {
    fn create_policy(&self, policy: NewPolicy) -> Result<Policy, PolicyStoreError>;

    fn get_policy(&self, id: &str) -> Result<Option<Policy>, PolicyStoreError>;

    fn get_policy_by_name(&self, name: &str) -> Result<Option<Policy>, PolicyStoreError>;

    /// Policies ordered by name.
    fn list_policies(&self, active_only: bool) -> Result<Vec<Policy>, PolicyStoreError>;

    fn set_active(&self, id: &str, active: bool) -> Result<Policy, PolicyStoreError>;

    /// Appends an execution log entry. Entries are never updated.
    fn append_execution_log(
        &self,
        entry: NewExecutionLog,
    ) -> Result<PolicyExecutionLog, PolicyStoreError>;

    /// Execution log of a policy, newest first.
    fn list_execution_log(
        &self,
        policy_id: &str,
        limit: i64,
    ) -> Result<Vec<PolicyExecutionLog>, PolicyStoreError>;

    /// Records that the run acted on the artifact.
    fn record_run_item(
        &self,
        policy_id: &str,
        run_key: &str,
        artifact_id: &str,
    ) -> Result<(), PolicyStoreError>;

    /// Artifacts the run has already acted on.
    fn processed_in_run(
        &self,
        policy_id: &str,
        run_key: &str,
    ) -> Result<HashSet<String>, PolicyStoreError>;
}
