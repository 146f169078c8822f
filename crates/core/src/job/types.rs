//! Core job and chunk data types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle status of a dataset build job.
///
/// `created -> running -> {completed, completed_with_errors, failed, cancelled}`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job recorded and partitioned, not yet started.
    Created,
    /// Chunks are being admitted and executed.
    Running,
    /// Every chunk completed.
    Completed,
    /// Some chunks failed terminally, within the configured tolerance.
    CompletedWithErrors,
    /// Every chunk failed, or the failed fraction exceeded the tolerance.
    Failed,
    /// Cancellation was requested and every chunk has stopped.
    Cancelled,
}

impl JobStatus {
    /// Returns the status as a stable string (used in the store).
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::CompletedWithErrors => "completed_with_errors",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parses a status string written by [`JobStatus::as_str`].
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(JobStatus::Created),
            "running" => Some(JobStatus::Running),
            "completed" => Some(JobStatus::Completed),
            "completed_with_errors" => Some(JobStatus::CompletedWithErrors),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true once the job can no longer change without an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed
                | JobStatus::CompletedWithErrors
                | JobStatus::Failed
                | JobStatus::Cancelled
        )
    }

    /// Returns true if `retry_job` may be applied from this status.
    pub fn can_retry(&self) -> bool {
        matches!(
            self,
            JobStatus::CompletedWithErrors | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Chunk status
// ============================================================================

/// Lifecycle status of a single chunk.
///
/// `pending -> admitted -> running -> {completed, failed}`, with failures that
/// still have retry budget going through `retrying -> admitted` again.
/// `completed`, `failed` and `cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChunkStatus {
    Pending,
    Admitted,
    Running,
    /// Failed with retry budget left; waiting for its backoff to elapse.
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl ChunkStatus {
    pub const ALL: [ChunkStatus; 7] = [
        ChunkStatus::Pending,
        ChunkStatus::Admitted,
        ChunkStatus::Running,
        ChunkStatus::Retrying,
        ChunkStatus::Completed,
        ChunkStatus::Failed,
        ChunkStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkStatus::Pending => "pending",
            ChunkStatus::Admitted => "admitted",
            ChunkStatus::Running => "running",
            ChunkStatus::Retrying => "retrying",
            ChunkStatus::Completed => "completed",
            ChunkStatus::Failed => "failed",
            ChunkStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        ChunkStatus::ALL.into_iter().find(|s| s.as_str() == value)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ChunkStatus::Completed | ChunkStatus::Failed | ChunkStatus::Cancelled
        )
    }

    /// Chunks in these states hold an admission slot and a scratch reservation.
    pub fn is_active(&self) -> bool {
        matches!(self, ChunkStatus::Admitted | ChunkStatus::Running)
    }

    /// Chunks in these states are waiting for admission.
    pub fn awaits_admission(&self) -> bool {
        matches!(self, ChunkStatus::Pending | ChunkStatus::Retrying)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: ChunkStatus) -> bool {
        use ChunkStatus::*;
        match (self, next) {
            (Pending, Admitted) | (Pending, Cancelled) => true,
            (Retrying, Admitted) | (Retrying, Cancelled) => true,
            // A worker may report its outcome before its start event is processed.
            (Admitted, Running | Completed | Retrying | Failed | Cancelled) => true,
            (Running, Completed | Retrying | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ChunkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Counters
// ============================================================================

/// Result counters reported for a single chunk.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkCounters {
    /// Items fetched by the download stage.
    pub items_downloaded: u64,
    /// Items that passed validation and were persisted.
    pub items_completed: u64,
    /// Items that failed download or validation.
    pub items_failed: u64,
}

impl ChunkCounters {
    /// Items that reached a final per-item outcome.
    pub fn processed(&self) -> u64 {
        self.items_completed + self.items_failed
    }
}

/// Aggregate counters for a job, always derived from its current chunk set.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounters {
    pub items_downloaded: u64,
    pub items_completed: u64,
    pub items_failed: u64,
    /// `items_completed + items_failed`.
    pub total_items_processed: u64,
}

impl JobCounters {
    /// Sums chunk counters into job counters.
    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a Chunk>) -> Self {
        let mut counters = JobCounters::default();
        for chunk in chunks {
            counters.items_downloaded += chunk.counters.items_downloaded;
            counters.items_completed += chunk.counters.items_completed;
            counters.items_failed += chunk.counters.items_failed;
        }
        counters.total_items_processed = counters.items_completed + counters.items_failed;
        counters
    }
}

// ============================================================================
// Records
// ============================================================================

/// A dataset build job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: String,
    /// Opaque reference to the submitting user or tenant.
    pub owner: String,
    pub requested_items: u64,
    pub chunk_size: u64,
    /// Chunks of the current execution attempt, ordered by ordinal.
    pub chunk_ids: Vec<String>,
    pub counters: JobCounters,
    pub status: JobStatus,
    /// Execution attempt; incremented by `retry_job`.
    pub attempt: u32,
    /// Set by `cancel_job`; workers check it between stages.
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// A bounded unit of crawl work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub job_id: String,
    /// Position within the job, stable across retries of the job.
    pub ordinal: u32,
    /// Job execution attempt that created this chunk.
    pub job_attempt: u32,
    pub item_count: u64,
    pub status: ChunkStatus,
    /// Number of failed executions that were followed by a retry.
    pub retry_count: u32,
    /// Identifies the current dispatch; stamped on every admission.
    pub dispatch_id: Option<String>,
    /// Broker task reference for the current dispatch.
    pub task_handle: Option<String>,
    /// Scratch bytes held while active; zero otherwise.
    pub reserved_bytes: u64,
    pub counters: ChunkCounters,
    pub last_error: Option<String>,
    /// Earliest time a retrying chunk may be admitted again.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Splits a requested item count into chunk item counts of at most `chunk_size`.
///
/// `partition_items(1200, 500)` yields `[500, 500, 200]`.
pub fn partition_items(requested_items: u64, chunk_size: u64) -> Vec<u64> {
    if requested_items == 0 || chunk_size == 0 {
        return Vec::new();
    }
    let full = requested_items / chunk_size;
    let remainder = requested_items % chunk_size;
    let mut sizes = vec![chunk_size; full as usize];
    if remainder > 0 {
        sizes.push(remainder);
    }
    sizes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_uneven() {
        assert_eq!(partition_items(1200, 500), vec![500, 500, 200]);
    }

    #[test]
    fn test_partition_even_and_small() {
        assert_eq!(partition_items(1000, 500), vec![500, 500]);
        assert_eq!(partition_items(7, 500), vec![7]);
        assert!(partition_items(0, 500).is_empty());
        assert!(partition_items(10, 0).is_empty());
    }

    #[test]
    fn test_chunk_status_round_trip_strings() {
        for status in ChunkStatus::ALL {
            assert_eq!(ChunkStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ChunkStatus::parse("bogus"), None);
    }

    #[test]
    fn test_chunk_transitions() {
        use ChunkStatus::*;
        assert!(Pending.can_transition_to(Admitted));
        assert!(Retrying.can_transition_to(Admitted));
        assert!(Running.can_transition_to(Retrying));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for next in ChunkStatus::ALL {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_job_status_flags() {
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::CompletedWithErrors.is_terminal());
        assert!(JobStatus::Failed.can_retry());
        assert!(!JobStatus::Completed.can_retry());
        assert_eq!(
            JobStatus::parse("completed_with_errors"),
            Some(JobStatus::CompletedWithErrors)
        );
    }

    #[test]
    fn test_job_status_serialization() {
        let json = serde_json::to_string(&JobStatus::CompletedWithErrors).unwrap();
        assert_eq!(json, "\"completed_with_errors\"");
    }
}
