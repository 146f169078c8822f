//! Policy engine: evaluates archival and cleanup policies against artifacts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::config::PolicyEngineConfig;
use super::store::{PolicyStore, PolicyStoreError};
use super::types::{
    ExecutionResult, NewExecutionLog, NewPolicy, Policy, PolicyAction, PolicyExecutionLog,
    RunOutcome,
};
use crate::db::format_ts;
use crate::metrics;
use crate::storage::{ArtifactFilter, DatasetArtifact, StorageError, StorageTierManager, TransitionOutcome};

/// Errors from policy operations.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy not found: {0}")]
    NotFound(String),

    #[error("policy name already in use: {0}")]
    NameTaken(String),

    #[error(transparent)]
    Store(PolicyStoreError),
}

impl From<PolicyStoreError> for PolicyError {
    fn from(err: PolicyStoreError) -> Self {
        match err {
            PolicyStoreError::NotFound(id) => PolicyError::NotFound(id),
            PolicyStoreError::NameTaken(name) => PolicyError::NameTaken(name),
            other => PolicyError::Store(other),
        }
    }
}

enum ItemResult {
    Applied,
    Skipped,
    Failed(String),
}

/// Evaluates policies, one evaluation at a time per policy.
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    tiers: Arc<StorageTierManager>,
    config: PolicyEngineConfig,
    running: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn PolicyStore>,
        tiers: Arc<StorageTierManager>,
        config: PolicyEngineConfig,
    ) -> Self {
        Self {
            store,
            tiers,
            config,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PolicyEngineConfig {
        &self.config
    }

    pub fn create_policy(&self, policy: NewPolicy) -> Result<Policy, PolicyError> {
        let policy = self.store.create_policy(policy)?;
        info!(policy_id = %policy.id, name = %policy.name, "Policy created");
        Ok(policy)
    }

    pub fn list_policies(&self, active_only: bool) -> Result<Vec<Policy>, PolicyError> {
        Ok(self.store.list_policies(active_only)?)
    }

    pub fn execution_log(
        &self,
        policy_id: &str,
        limit: i64,
    ) -> Result<Vec<PolicyExecutionLog>, PolicyError> {
        Ok(self.store.list_execution_log(policy_id, limit)?)
    }

    /// Start of the run window containing `now`.
    pub fn run_key(&self, now: DateTime<Utc>) -> String {
        let window = self.config.run_window_secs.max(1) as i64;
        let start = now.timestamp().div_euclid(window) * window;
        let start = Utc.timestamp_opt(start, 0).single().unwrap_or(now);
        format_ts(start)
    }

    /// Evaluates one policy now, whether or not it is active.
    ///
    /// Artifacts already handled by the current run are skipped, as are
    /// artifacts already at the target tier. Every call appends one
    /// execution log entry, including failed ones.
    pub async fn evaluate(&self, policy_id: &str) -> Result<ExecutionResult, PolicyError> {
        // Unknown ids never get a gate.
        if self.store.get_policy(policy_id)?.is_none() {
            return Err(PolicyError::NotFound(policy_id.to_string()));
        }
        let gate = self.gate(policy_id);
        let _guard = gate.lock().await;

        let Some(policy) = self.store.get_policy(policy_id)? else {
            self.release_gate(policy_id);
            return Err(PolicyError::NotFound(policy_id.to_string()));
        };

        let now = Utc::now();
        let run_key = self.run_key(now);

        let (matched, candidates) = match self.select(&policy, &run_key, now) {
            Ok(selection) => selection,
            Err(error) => {
                warn!(policy = %policy.name, error = %error, "Policy selection failed");
                return self.finish(&policy, run_key, 0, 0, 0, 0, Some(error));
            }
        };

        let mut affected = 0u64;
        let mut skipped = matched - candidates.len() as u64;
        let mut failed = 0u64;
        let mut last_error = None;

        for artifact in candidates {
            match self.apply(&policy, &artifact).await {
                ItemResult::Applied => {
                    affected += 1;
                    if let Err(e) = self.store.record_run_item(&policy.id, &run_key, &artifact.id) {
                        // The tier check keeps a re-run from acting twice.
                        warn!(policy = %policy.name, artifact_id = %artifact.id, error = %e, "Failed to record run item");
                    }
                }
                ItemResult::Skipped => skipped += 1,
                ItemResult::Failed(error) => {
                    failed += 1;
                    warn!(
                        policy = %policy.name,
                        artifact_id = %artifact.id,
                        error = %error,
                        "Policy action failed"
                    );
                    last_error = Some(error);
                }
            }
        }

        self.finish(&policy, run_key, matched, affected, skipped, failed, last_error)
    }

    /// Evaluates every active policy. Policies run concurrently and a
    /// failing policy does not affect the others.
    pub async fn evaluate_all_active(
        &self,
    ) -> Result<Vec<(String, Result<ExecutionResult, PolicyError>)>, PolicyError> {
        let policies = self.store.list_policies(true)?;
        let runs = policies.iter().map(|policy| async move {
            (policy.id.clone(), self.evaluate(&policy.id).await)
        });
        Ok(join_all(runs).await)
    }

    fn gate(&self, policy_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running
            .entry(policy_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, policy_id: &str) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(policy_id);
    }

    /// Matching artifacts, and those among them not yet handled in this run.
    fn select(
        &self,
        policy: &Policy,
        run_key: &str,
        now: DateTime<Utc>,
    ) -> Result<(u64, Vec<DatasetArtifact>), String> {
        let done = self
            .store
            .processed_in_run(&policy.id, run_key)
            .map_err(|e| e.to_string())?;
        let artifacts = self
            .tiers
            .list_artifacts(&ArtifactFilter::new())
            .map_err(|e| e.to_string())?;

        let matching: Vec<DatasetArtifact> = artifacts
            .into_iter()
            .filter(|a| policy.predicate.matches(a, now))
            .collect();
        let matched = matching.len() as u64;
        let pending = matching
            .into_iter()
            .filter(|a| !done.contains(&a.id))
            .collect();
        Ok((matched, pending))
    }

    async fn apply(&self, policy: &Policy, artifact: &DatasetArtifact) -> ItemResult {
        let reason = format!("policy:{}", policy.name);
        match policy.action {
            PolicyAction::TransitionTo(target) => {
                if artifact.tier == target {
                    return ItemResult::Skipped;
                }
                match self.tiers.set_tier(&artifact.id, target, &reason).await {
                    Ok(TransitionOutcome::Applied(_)) => ItemResult::Applied,
                    Ok(TransitionOutcome::AlreadyAtTarget(_)) => ItemResult::Skipped,
                    // Policies never rehydrate; an archived artifact stays put.
                    Err(StorageError::RequiresRehydration { .. }) => ItemResult::Skipped,
                    // Removed since selection.
                    Err(StorageError::NotFound(_)) => ItemResult::Skipped,
                    Err(e) => ItemResult::Failed(e.to_string()),
                }
            }
            PolicyAction::Delete => match self.tiers.delete_artifact(&artifact.id, &reason).await {
                Ok(()) => ItemResult::Applied,
                Err(StorageError::NotFound(_)) => ItemResult::Skipped,
                Err(e) => ItemResult::Failed(e.to_string()),
            },
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        policy: &Policy,
        run_key: String,
        matched: u64,
        affected: u64,
        skipped: u64,
        failed: u64,
        error: Option<String>,
    ) -> Result<ExecutionResult, PolicyError> {
        let outcome = if error.is_some() && affected == 0 && failed == 0 {
            RunOutcome::Failure
        } else {
            RunOutcome::from_counts(affected, failed)
        };

        let entry = self.store.append_execution_log(NewExecutionLog {
            policy_id: policy.id.clone(),
            run_key: run_key.clone(),
            artifacts_matched: matched,
            artifacts_affected: affected,
            artifacts_failed: failed,
            outcome,
            error,
        })?;

        metrics::POLICY_RUNS
            .with_label_values(&[outcome.as_str()])
            .inc();
        match outcome {
            RunOutcome::Success if affected == 0 => debug!(
                policy = %policy.name,
                matched,
                skipped,
                "Policy run made no changes"
            ),
            RunOutcome::Success => info!(
                policy = %policy.name,
                affected,
                skipped,
                "Policy run completed"
            ),
            _ => warn!(
                policy = %policy.name,
                outcome = outcome.as_str(),
                affected,
                failed,
                "Policy run had failures"
            ),
        }

        Ok(ExecutionResult {
            policy_id: policy.id.clone(),
            run_key,
            matched,
            affected,
            skipped,
            failed,
            outcome,
            log_id: entry.id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{PolicyPredicate, SqlitePolicyStore};
    use crate::processor::ProducedArtifact;
    use crate::storage::{FsObjectStorage, SqliteArtifactStore, StorageConfig, Tier};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        objects: Arc<FsObjectStorage>,
        tiers: Arc<StorageTierManager>,
        engine: Arc<PolicyEngine>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig::default().with_root(dir.path());
        let objects = Arc::new(
            FsObjectStorage::new(&config).with_rehydration_delays(Duration::ZERO, Duration::ZERO),
        );
        let tiers = Arc::new(StorageTierManager::new(
            Arc::new(SqliteArtifactStore::in_memory().unwrap()),
            objects.clone(),
            config,
        ));
        let engine = Arc::new(PolicyEngine::new(
            Arc::new(SqlitePolicyStore::in_memory().unwrap()),
            tiers.clone(),
            PolicyEngineConfig::default(),
        ));
        Fixture {
            _dir: dir,
            objects,
            tiers,
            engine,
        }
    }

    async fn artifact(fx: &Fixture, location: &str) -> DatasetArtifact {
        fx.objects.put(location, b"data").await.unwrap();
        fx.tiers
            .register_artifact(
                "job-1",
                None,
                &ProducedArtifact {
                    location: location.to_string(),
                    size_bytes: 4,
                },
            )
            .unwrap()
    }

    fn policy(fx: &Fixture, name: &str, action: PolicyAction) -> Policy {
        fx.engine
            .create_policy(NewPolicy {
                name: name.to_string(),
                active: true,
                predicate: PolicyPredicate {
                    max_access_count: Some(0),
                    ..Default::default()
                },
                action,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_evaluate_archives_matching_artifacts() {
        let fx = fixture();
        let idle = artifact(&fx, "idle.tar").await;
        let used = artifact(&fx, "used.tar").await;
        fx.tiers.open_artifact(&used.id).unwrap();
        let p = policy(&fx, "archive-unused", PolicyAction::TransitionTo(Tier::Archive));

        let result = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(result.matched, 1);
        assert_eq!(result.affected, 1);
        assert_eq!(result.outcome, RunOutcome::Success);

        assert_eq!(fx.tiers.get_artifact(&idle.id).unwrap().tier, Tier::Archive);
        assert_eq!(fx.tiers.get_artifact(&used.id).unwrap().tier, Tier::Hot);

        let history = fx.tiers.list_transitions(&idle.id).unwrap();
        assert_eq!(history[0].reason, "policy:archive-unused");
    }

    #[tokio::test]
    async fn test_second_evaluation_makes_no_changes() {
        let fx = fixture();
        artifact(&fx, "a.tar").await;
        artifact(&fx, "b.tar").await;
        let p = policy(&fx, "to-cool", PolicyAction::TransitionTo(Tier::Cool));

        let first = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(first.affected, 2);

        let second = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(second.affected, 0);
        assert_eq!(second.skipped, 2);
        assert_eq!(second.run_key, first.run_key);

        let log = fx.engine.execution_log(&p.id, 10).unwrap();
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_partial_failure_is_logged() {
        let fx = fixture();
        artifact(&fx, "present.tar").await;
        // No object behind this record, so the storage rejects it.
        fx.tiers
            .register_artifact(
                "job-1",
                None,
                &ProducedArtifact {
                    location: "missing.tar".to_string(),
                    size_bytes: 1,
                },
            )
            .unwrap();
        let p = policy(&fx, "to-cool", PolicyAction::TransitionTo(Tier::Cool));

        let result = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(result.affected, 1);
        assert_eq!(result.failed, 1);
        assert_eq!(result.outcome, RunOutcome::Partial);

        let log = fx.engine.execution_log(&p.id, 1).unwrap();
        assert_eq!(log[0].outcome, RunOutcome::Partial);
        assert!(log[0].error.is_some());

        // The failed artifact is retried by the next evaluation.
        let retry = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(retry.affected, 0);
        assert_eq!(retry.failed, 1);
        assert_eq!(retry.outcome, RunOutcome::Failure);
    }

    #[tokio::test]
    async fn test_cleanup_policy_deletes() {
        let fx = fixture();
        let a = artifact(&fx, "a.tar").await;
        let p = policy(&fx, "cleanup", PolicyAction::Delete);

        let result = fx.engine.evaluate(&p.id).await.unwrap();
        assert_eq!(result.affected, 1);
        assert!(matches!(
            fx.tiers.get_artifact(&a.id),
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_evaluate_all_active_runs_independently() {
        let fx = fixture();
        artifact(&fx, "a.tar").await;
        policy(&fx, "to-cool", PolicyAction::TransitionTo(Tier::Cool));
        let inactive = fx
            .engine
            .create_policy(NewPolicy {
                name: "disabled".to_string(),
                active: false,
                predicate: PolicyPredicate::default(),
                action: PolicyAction::Delete,
            })
            .unwrap();

        let results = fx.engine.evaluate_all_active().await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert!(fx.engine.execution_log(&inactive.id, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_evaluations_of_one_policy_are_serialized() {
        let fx = fixture();
        for i in 0..5 {
            artifact(&fx, &format!("a{}.tar", i)).await;
        }
        let p = policy(&fx, "to-cool", PolicyAction::TransitionTo(Tier::Cool));

        let (a, b) = tokio::join!(fx.engine.evaluate(&p.id), fx.engine.evaluate(&p.id));
        let total = a.unwrap().affected + b.unwrap().affected;
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_unknown_policy() {
        let fx = fixture();
        assert!(matches!(
            fx.engine.evaluate("missing").await,
            Err(PolicyError::NotFound(_))
        ));
        assert!(fx.engine.running.lock().unwrap().is_empty());
    }

    #[test]
    fn test_run_key_is_window_start() {
        let fx = fixture();
        let t = Utc.with_ymd_and_hms(2026, 3, 4, 15, 30, 0).unwrap();
        assert_eq!(fx.engine.run_key(t), "2026-03-04T00:00:00.000000Z");
    }
}
