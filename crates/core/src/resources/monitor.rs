//! Resource monitor backed by the authoritative job store.
//!
//! Readings come from the orchestrator's own bookkeeping: the number of
//! chunks in an active status and the scratch bytes they reserved. Host
//! metrics are never sampled.

use std::sync::Arc;

use serde::Serialize;
use tracing::warn;

use crate::job::JobStore;

/// A reading that may be unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Measurement {
    Known(u64),
    /// The store could not be queried. Never treated as zero.
    Unknown,
}

impl Measurement {
    pub fn known(self) -> Option<u64> {
        match self {
            Measurement::Known(value) => Some(value),
            Measurement::Unknown => None,
        }
    }

    /// Gauge value, `-1` when unknown.
    pub fn as_gauge(self) -> i64 {
        match self {
            Measurement::Known(value) => i64::try_from(value).unwrap_or(i64::MAX),
            Measurement::Unknown => -1,
        }
    }
}

/// Point-in-time view of both readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceSnapshot {
    pub active_chunks: Measurement,
    pub scratch_usage_bytes: Measurement,
}

/// Read-only view over resource usage.
#[derive(Clone)]
pub struct ResourceMonitor {
    store: Arc<dyn JobStore>,
}

impl ResourceMonitor {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Number of chunks currently admitted or running.
    pub fn current_active_chunks(&self) -> Measurement {
        match self.store.count_active_chunks() {
            Ok(count) => Measurement::Known(count),
            Err(e) => {
                warn!(error = %e, "Active chunk count unavailable");
                Measurement::Unknown
            }
        }
    }

    /// Scratch bytes reserved by active chunks.
    pub fn current_scratch_usage_bytes(&self) -> Measurement {
        match self.store.scratch_usage_bytes() {
            Ok(bytes) => Measurement::Known(bytes),
            Err(e) => {
                warn!(error = %e, "Scratch usage unavailable");
                Measurement::Unknown
            }
        }
    }

    pub fn snapshot(&self) -> ResourceSnapshot {
        ResourceSnapshot {
            active_chunks: self.current_active_chunks(),
            scratch_usage_bytes: self.current_scratch_usage_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{AdmissionLimits, JobStatus, NewJob, SqliteJobStore};
    use crate::testing::UnavailableJobStore;

    #[test]
    fn test_readings_follow_store() {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let monitor = ResourceMonitor::new(store.clone());
        assert_eq!(monitor.current_active_chunks(), Measurement::Known(0));

        let job = store
            .create_job(NewJob {
                owner: "owner".to_string(),
                requested_items: 10,
                chunk_size: 10,
                chunk_item_counts: vec![10],
            })
            .unwrap();
        store.set_job_status(&job.id, JobStatus::Running).unwrap();
        store
            .try_admit(
                &job.chunk_ids[0],
                &AdmissionLimits {
                    max_concurrent_chunks: 1,
                    max_scratch_bytes: 4096,
                    required_bytes: 2048,
                },
                "d1",
            )
            .unwrap();

        let snapshot = monitor.snapshot();
        assert_eq!(snapshot.active_chunks, Measurement::Known(1));
        assert_eq!(snapshot.scratch_usage_bytes, Measurement::Known(2048));
    }

    #[test]
    fn test_unreachable_store_reports_unknown() {
        let monitor = ResourceMonitor::new(Arc::new(UnavailableJobStore));
        assert_eq!(monitor.current_active_chunks(), Measurement::Unknown);
        assert_eq!(monitor.current_scratch_usage_bytes(), Measurement::Unknown);
        assert_eq!(monitor.current_active_chunks().as_gauge(), -1);
    }
}
