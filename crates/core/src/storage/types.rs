//! Artifact and tier types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Storage accessibility/cost class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Immediate access.
    Hot,
    /// Infrequent access, still online.
    Cool,
    /// Offline; must be rehydrated before it can be read.
    Archive,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Hot, Tier::Cool, Tier::Archive];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Cool => "cool",
            Tier::Archive => "archive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Tier::ALL.into_iter().find(|t| t.as_str() == value)
    }

    /// Whether objects in this tier can be read directly.
    pub fn is_accessible(&self) -> bool {
        !matches!(self, Tier::Archive)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority of a rehydration request.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RehydrationPriority {
    /// Up to ~15 hours.
    #[default]
    Standard,
    /// Under ~1 hour.
    Expedited,
}

impl RehydrationPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            RehydrationPriority::Standard => "standard",
            RehydrationPriority::Expedited => "expedited",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "standard" => Some(RehydrationPriority::Standard),
            "expedited" => Some(RehydrationPriority::Expedited),
            _ => None,
        }
    }
}

/// Progress of moving an archived artifact back to an accessible tier.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RehydrationState {
    #[default]
    Absent,
    InProgress,
    /// Rehydration finished and the artifact is in an accessible tier.
    Ready,
}

impl RehydrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RehydrationState::Absent => "absent",
            RehydrationState::InProgress => "in_progress",
            RehydrationState::Ready => "ready",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "absent" => Some(RehydrationState::Absent),
            "in_progress" => Some(RehydrationState::InProgress),
            "ready" => Some(RehydrationState::Ready),
            _ => None,
        }
    }
}

/// A persisted output of a chunk, tracked across storage tiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetArtifact {
    pub id: String,
    pub job_id: String,
    pub chunk_id: Option<String>,
    /// Object storage location.
    pub location: String,
    pub tier: Tier,
    pub size_bytes: u64,
    /// Number of successful `open_artifact` calls.
    pub access_count: u64,
    pub rehydration_state: RehydrationState,
    pub rehydration_priority: Option<RehydrationPriority>,
    pub rehydration_eta: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub tier_changed_at: DateTime<Utc>,
}

impl DatasetArtifact {
    /// Last access, or creation time if never accessed.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_accessed_at.unwrap_or(self.created_at)
    }
}

/// Artifact to be registered.
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub job_id: String,
    pub chunk_id: Option<String>,
    pub location: String,
    pub size_bytes: u64,
}

/// A tier change applied to the artifact record.
#[derive(Debug, Clone)]
pub struct TierChange {
    /// Tier the record must still be in.
    pub from: Tier,
    pub to: Tier,
    /// Rehydration state recorded together with the new tier.
    pub rehydration: RehydrationState,
    /// Who caused the change (`manual`, `rehydration`, `policy:<name>`).
    pub reason: String,
}

/// Audit record of a tier change or deletion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierTransitionRecord {
    pub id: i64,
    pub artifact_id: String,
    pub from_tier: Tier,
    /// `None` when the artifact was deleted.
    pub to_tier: Option<Tier>,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// Properties reported by the object storage service.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectProperties {
    pub tier: Tier,
    pub size_bytes: u64,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Result of requesting a rehydration.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RehydrationHandle {
    pub artifact_id: String,
    /// Object storage reference for the pending operation.
    pub handle: Option<String>,
    pub priority: RehydrationPriority,
    pub state: RehydrationState,
    pub eta: Option<DateTime<Utc>>,
}

/// Result of a `set_tier` call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    Applied(DatasetArtifact),
    /// The artifact was already in the target tier; nothing was done.
    AlreadyAtTarget(DatasetArtifact),
}

impl TransitionOutcome {
    pub fn artifact(&self) -> &DatasetArtifact {
        match self {
            TransitionOutcome::Applied(a) | TransitionOutcome::AlreadyAtTarget(a) => a,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_strings() {
        for tier in Tier::ALL {
            assert_eq!(Tier::parse(tier.as_str()), Some(tier));
        }
        assert!(Tier::Cool.is_accessible());
        assert!(!Tier::Archive.is_accessible());
    }

    #[test]
    fn test_rehydration_state_serialization() {
        let json = serde_json::to_string(&RehydrationState::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        assert_eq!(
            RehydrationState::parse("in_progress"),
            Some(RehydrationState::InProgress)
        );
    }
}
