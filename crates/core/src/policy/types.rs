//! Policy types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::{DatasetArtifact, Tier};

/// Archival policies move artifacts between tiers; cleanup policies delete them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    Archival,
    Cleanup,
}

/// What a policy does to matching artifacts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "tier", rename_all = "snake_case")]
pub enum PolicyAction {
    TransitionTo(Tier),
    Delete,
}

impl PolicyAction {
    pub fn kind(&self) -> PolicyKind {
        match self {
            PolicyAction::TransitionTo(_) => PolicyKind::Archival,
            PolicyAction::Delete => PolicyKind::Cleanup,
        }
    }
}

/// Trigger predicate. Every set condition must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyPredicate {
    /// Artifact age in days, at least.
    #[serde(default)]
    pub min_age_days: Option<u32>,
    /// Access count, at most.
    #[serde(default)]
    pub max_access_count: Option<u64>,
    /// Days since last access (or creation), at least.
    #[serde(default)]
    pub min_idle_days: Option<u32>,
    /// Only artifacts currently in one of these tiers. Empty means any.
    #[serde(default)]
    pub source_tiers: Vec<Tier>,
}

impl PolicyPredicate {
    pub fn matches(&self, artifact: &DatasetArtifact, now: DateTime<Utc>) -> bool {
        if let Some(days) = self.min_age_days {
            if now - artifact.created_at < chrono::Duration::days(days as i64) {
                return false;
            }
        }
        if let Some(max) = self.max_access_count {
            if artifact.access_count > max {
                return false;
            }
        }
        if let Some(days) = self.min_idle_days {
            if now - artifact.last_activity() < chrono::Duration::days(days as i64) {
                return false;
            }
        }
        self.source_tiers.is_empty() || self.source_tiers.contains(&artifact.tier)
    }
}

/// A declarative archival or cleanup rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    pub id: String,
    /// Unique.
    pub name: String,
    pub active: bool,
    pub predicate: PolicyPredicate,
    pub action: PolicyAction,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Policy {
    pub fn kind(&self) -> PolicyKind {
        self.action.kind()
    }
}

/// A policy to be created.
#[derive(Debug, Clone)]
pub struct NewPolicy {
    pub name: String,
    pub active: bool,
    pub predicate: PolicyPredicate,
    pub action: PolicyAction,
}

/// Outcome of one evaluation run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Some artifacts were acted on and others errored.
    Partial,
    Failure,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "success" => Some(RunOutcome::Success),
            "partial" => Some(RunOutcome::Partial),
            "failure" => Some(RunOutcome::Failure),
            _ => None,
        }
    }

    /// `failed` errors against `affected` successes.
    pub fn from_counts(affected: u64, failed: u64) -> Self {
        match (affected, failed) {
            (_, 0) => RunOutcome::Success,
            (0, _) => RunOutcome::Failure,
            _ => RunOutcome::Partial,
        }
    }
}

/// An execution log entry to append.
#[derive(Debug, Clone)]
pub struct NewExecutionLog {
    pub policy_id: String,
    pub run_key: String,
    pub artifacts_matched: u64,
    pub artifacts_affected: u64,
    pub artifacts_failed: u64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

/// Append-only record of one policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyExecutionLog {
    pub id: i64,
    pub policy_id: String,
    /// Start of the run window this evaluation belongs to.
    pub run_key: String,
    pub run_at: DateTime<Utc>,
    pub artifacts_matched: u64,
    pub artifacts_affected: u64,
    pub artifacts_failed: u64,
    pub outcome: RunOutcome,
    pub error: Option<String>,
}

/// Result returned by `evaluate`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ExecutionResult {
    pub policy_id: String,
    pub run_key: String,
    /// Artifacts matching the predicate.
    pub matched: u64,
    /// Artifacts transitioned or deleted by this evaluation.
    pub affected: u64,
    /// Matches left alone: already handled in this run or already at target.
    pub skipped: u64,
    pub failed: u64,
    pub outcome: RunOutcome,
    pub log_id: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RehydrationState;

    fn artifact(age_days: i64, access_count: u64, tier: Tier) -> DatasetArtifact {
        let created = Utc::now() - chrono::Duration::days(age_days);
        DatasetArtifact {
            id: "a".to_string(),
            job_id: "job".to_string(),
            chunk_id: None,
            location: "a.tar".to_string(),
            tier,
            size_bytes: 1,
            access_count,
            rehydration_state: RehydrationState::Absent,
            rehydration_priority: None,
            rehydration_eta: None,
            created_at: created,
            last_accessed_at: None,
            tier_changed_at: created,
        }
    }

    #[test]
    fn test_predicate_age_and_access() {
        let predicate = PolicyPredicate {
            min_age_days: Some(30),
            max_access_count: Some(2),
            ..Default::default()
        };
        let now = Utc::now();
        assert!(predicate.matches(&artifact(31, 0, Tier::Hot), now));
        assert!(!predicate.matches(&artifact(10, 0, Tier::Hot), now));
        assert!(!predicate.matches(&artifact(31, 5, Tier::Hot), now));
    }

    #[test]
    fn test_predicate_idle_uses_last_access() {
        let predicate = PolicyPredicate {
            min_idle_days: Some(7),
            ..Default::default()
        };
        let now = Utc::now();
        let mut a = artifact(30, 1, Tier::Hot);
        assert!(predicate.matches(&a, now));
        a.last_accessed_at = Some(now - chrono::Duration::days(1));
        assert!(!predicate.matches(&a, now));
    }

    #[test]
    fn test_predicate_source_tiers() {
        let predicate = PolicyPredicate {
            source_tiers: vec![Tier::Cool],
            ..Default::default()
        };
        let now = Utc::now();
        assert!(predicate.matches(&artifact(0, 0, Tier::Cool), now));
        assert!(!predicate.matches(&artifact(0, 0, Tier::Hot), now));
    }

    #[test]
    fn test_outcome_from_counts() {
        assert_eq!(RunOutcome::from_counts(0, 0), RunOutcome::Success);
        assert_eq!(RunOutcome::from_counts(3, 0), RunOutcome::Success);
        assert_eq!(RunOutcome::from_counts(3, 1), RunOutcome::Partial);
        assert_eq!(RunOutcome::from_counts(0, 2), RunOutcome::Failure);
    }

    #[test]
    fn test_action_serialization() {
        let json = serde_json::to_string(&PolicyAction::TransitionTo(Tier::Archive)).unwrap();
        assert_eq!(json, r#"{"type":"transition_to","tier":"archive"}"#);
        let json = serde_json::to_string(&PolicyAction::Delete).unwrap();
        assert_eq!(json, r#"{"type":"delete"}"#);
        assert_eq!(PolicyAction::Delete.kind(), PolicyKind::Cleanup);
    }
}
