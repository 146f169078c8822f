//! Job-level verdict derived from chunk statuses.

use serde::{Deserialize, Serialize};

use crate::job::{Chunk, ChunkStatus, JobStatus};

/// `[aggregation]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Fraction of unsuccessful chunks a job may have and still end as
    /// `completed_with_errors`. Unset: any completed chunk is enough.
    #[serde(default)]
    pub max_failed_fraction: Option<f64>,

    /// Largest item count a single job may request.
    #[serde(default = "default_max_requested_items")]
    pub max_requested_items: u64,

    /// Largest number of chunks a single job may be partitioned into.
    #[serde(default = "default_max_chunks_per_job")]
    pub max_chunks_per_job: u64,
}

fn default_max_requested_items() -> u64 {
    1_000_000_000
}

fn default_max_chunks_per_job() -> u64 {
    100_000
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_failed_fraction: None,
            max_requested_items: default_max_requested_items(),
            max_chunks_per_job: default_max_chunks_per_job(),
        }
    }
}

/// Chunk counts per outcome for one job attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkTally {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Chunks not yet terminal.
    pub unfinished: u64,
}

impl ChunkTally {
    pub fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut tally = ChunkTally {
            total: chunks.len() as u64,
            ..Default::default()
        };
        for chunk in chunks {
            match chunk.status {
                ChunkStatus::Completed => tally.completed += 1,
                ChunkStatus::Failed => tally.failed += 1,
                ChunkStatus::Cancelled => tally.cancelled += 1,
                _ => tally.unfinished += 1,
            }
        }
        tally
    }

    pub fn all_terminal(&self) -> bool {
        self.unfinished == 0
    }

    /// Share of chunks that did not complete.
    pub fn failed_fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.total - self.completed) as f64 / self.total as f64
    }
}

/// Returns the job's terminal status, or `None` while any chunk is still
/// unfinished.
pub fn derive_verdict(
    chunks: &[Chunk],
    cancel_requested: bool,
    config: &AggregationConfig,
) -> Option<JobStatus> {
    let tally = ChunkTally::from_chunks(chunks);
    if tally.total == 0 || !tally.all_terminal() {
        return None;
    }

    if cancel_requested {
        return Some(JobStatus::Cancelled);
    }
    if tally.completed == tally.total {
        return Some(JobStatus::Completed);
    }
    if tally.completed == 0 {
        return Some(JobStatus::Failed);
    }

    match config.max_failed_fraction {
        None => Some(JobStatus::CompletedWithErrors),
        Some(max) if tally.failed_fraction() < max => Some(JobStatus::CompletedWithErrors),
        Some(_) => Some(JobStatus::Failed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn chunk(status: ChunkStatus) -> Chunk {
        let now = Utc::now();
        Chunk {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: "job".to_string(),
            ordinal: 0,
            job_attempt: 1,
            item_count: 10,
            status,
            retry_count: 0,
            dispatch_id: None,
            task_handle: None,
            reserved_bytes: 0,
            counters: Default::default(),
            last_error: None,
            next_attempt_at: None,
            heartbeat_at: None,
            created_at: now,
            started_at: None,
            ended_at: None,
            updated_at: now,
        }
    }

    fn chunks(statuses: &[ChunkStatus]) -> Vec<Chunk> {
        statuses.iter().map(|s| chunk(*s)).collect()
    }

    use ChunkStatus::*;

    #[test]
    fn test_unfinished_job_has_no_verdict() {
        let config = AggregationConfig::default();
        assert_eq!(derive_verdict(&chunks(&[Completed, Running]), false, &config), None);
        assert_eq!(derive_verdict(&chunks(&[Completed, Retrying]), false, &config), None);
        assert_eq!(derive_verdict(&chunks(&[Pending]), true, &config), None);
    }

    #[test]
    fn test_all_completed() {
        let config = AggregationConfig::default();
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Completed, Completed]), false, &config),
            Some(JobStatus::Completed)
        );
    }

    #[test]
    fn test_all_failed() {
        let config = AggregationConfig::default();
        assert_eq!(
            derive_verdict(&chunks(&[Failed, Failed]), false, &config),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn test_any_success_counts_by_default() {
        let config = AggregationConfig::default();
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Failed, Failed, Failed]), false, &config),
            Some(JobStatus::CompletedWithErrors)
        );
    }

    #[test]
    fn test_tolerance_threshold() {
        let config = AggregationConfig {
            max_failed_fraction: Some(0.5),
            ..Default::default()
        };
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Completed, Completed, Failed]), false, &config),
            Some(JobStatus::CompletedWithErrors)
        );
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Failed]), false, &config),
            Some(JobStatus::Failed)
        );
    }

    #[test]
    fn test_cancellation_wins_once_everything_stopped() {
        let config = AggregationConfig::default();
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Cancelled, Cancelled]), true, &config),
            Some(JobStatus::Cancelled)
        );
        assert_eq!(
            derive_verdict(&chunks(&[Completed, Completed]), true, &config),
            Some(JobStatus::Cancelled)
        );
    }

    #[test]
    fn test_tally() {
        let tally = ChunkTally::from_chunks(&chunks(&[Completed, Failed, Cancelled, Admitted]));
        assert_eq!(tally.total, 4);
        assert_eq!(tally.unfinished, 1);
        assert!(!tally.all_terminal());
        assert_eq!(tally.failed_fraction(), 0.75);
    }
}
