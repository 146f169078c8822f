//! Admission controller.
//!
//! `can_admit` is an advisory read used for reporting; the binding decision
//! is `try_admit`, which delegates to one conditional update in the store so
//! that concurrent orchestrator instances never overshoot the ceilings.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::{Measurement, ResourceBudget, ResourceMonitor};
use crate::job::{AdmissionLimits, AdmissionOutcome, Chunk, ChunkStatus, JobStore};
use crate::metrics;

/// Why a chunk was not admitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DenyReason {
    ConcurrencyCeiling { active: u64, limit: u64 },
    ScratchBudget { used: u64, required: u64, limit: u64 },
    /// Resource readings were unavailable; admission fails closed.
    ResourcesUnknown,
    /// The chunk is no longer waiting for admission.
    NotEligible { status: ChunkStatus },
}

impl DenyReason {
    /// Short label used as a metric dimension.
    pub fn label(&self) -> &'static str {
        match self {
            DenyReason::ConcurrencyCeiling { .. } => "concurrency",
            DenyReason::ScratchBudget { .. } => "scratch",
            DenyReason::ResourcesUnknown => "unknown",
            DenyReason::NotEligible { .. } => "not_eligible",
        }
    }

    /// Ceiling denials may clear once another chunk finishes.
    pub fn is_capacity(&self) -> bool {
        !matches!(self, DenyReason::NotEligible { .. })
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DenyReason::ConcurrencyCeiling { active, limit } => {
                write!(f, "{} of {} chunk slots in use", active, limit)
            }
            DenyReason::ScratchBudget {
                used,
                required,
                limit,
            } => write!(
                f,
                "scratch budget exhausted ({} used + {} required > {})",
                used, required, limit
            ),
            DenyReason::ResourcesUnknown => write!(f, "resource usage unknown"),
            DenyReason::NotEligible { status } => write!(f, "chunk is {}", status),
        }
    }
}

/// Result of an admission attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionDecision {
    Admitted(Chunk),
    Denied(DenyReason),
}

/// Decides whether a chunk may begin under the resource budget.
#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn JobStore>,
    monitor: ResourceMonitor,
    budget: ResourceBudget,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn JobStore>, budget: ResourceBudget) -> Self {
        Self {
            monitor: ResourceMonitor::new(Arc::clone(&store)),
            store,
            budget,
        }
    }

    pub fn budget(&self) -> &ResourceBudget {
        &self.budget
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn required_bytes(&self, chunk: &Chunk) -> u64 {
        self.budget.required_bytes(chunk.item_count)
    }

    /// Checks the ceilings against current readings without admitting.
    pub fn check(&self, chunk: &Chunk) -> Result<(), DenyReason> {
        if !chunk.status.awaits_admission() {
            return Err(DenyReason::NotEligible {
                status: chunk.status,
            });
        }

        let (Measurement::Known(active), Measurement::Known(used)) = (
            self.monitor.current_active_chunks(),
            self.monitor.current_scratch_usage_bytes(),
        ) else {
            return Err(DenyReason::ResourcesUnknown);
        };

        if active >= self.budget.max_concurrent_chunks {
            return Err(DenyReason::ConcurrencyCeiling {
                active,
                limit: self.budget.max_concurrent_chunks,
            });
        }

        let required = self.required_bytes(chunk);
        if used.saturating_add(required) > self.budget.max_scratch_bytes {
            return Err(DenyReason::ScratchBudget {
                used,
                required,
                limit: self.budget.max_scratch_bytes,
            });
        }

        Ok(())
    }

    /// Advisory: would the chunk be admitted right now?
    pub fn can_admit(&self, chunk: &Chunk) -> bool {
        self.check(chunk).is_ok()
    }

    /// Atomically admits the chunk (`pending`/`retrying` -> `admitted`) if
    /// both ceilings still hold, stamping a fresh dispatch id.
    pub fn try_admit(&self, chunk: &Chunk) -> AdmissionDecision {
        let required = self.required_bytes(chunk);
        let limits = AdmissionLimits {
            max_concurrent_chunks: self.budget.max_concurrent_chunks,
            max_scratch_bytes: self.budget.max_scratch_bytes,
            required_bytes: required,
        };
        let dispatch_id = uuid::Uuid::new_v4().to_string();

        let decision = match self.store.try_admit(&chunk.id, &limits, &dispatch_id) {
            Ok(AdmissionOutcome::Admitted(admitted)) => {
                info!(
                    chunk_id = %admitted.id,
                    job_id = %admitted.job_id,
                    dispatch_id = %dispatch_id,
                    reserved_bytes = required,
                    "Chunk admitted"
                );
                metrics::CHUNKS_ADMITTED.inc();
                return AdmissionDecision::Admitted(admitted);
            }
            Ok(AdmissionOutcome::ConcurrencyCeiling { active }) => DenyReason::ConcurrencyCeiling {
                active,
                limit: limits.max_concurrent_chunks,
            },
            Ok(AdmissionOutcome::ScratchBudget { used }) => DenyReason::ScratchBudget {
                used,
                required,
                limit: limits.max_scratch_bytes,
            },
            Ok(AdmissionOutcome::NotEligible { status }) => DenyReason::NotEligible { status },
            Err(e) => {
                warn!(chunk_id = %chunk.id, error = %e, "Admission store call failed, denying");
                DenyReason::ResourcesUnknown
            }
        };

        debug!(chunk_id = %chunk.id, reason = %decision, "Chunk admission denied");
        metrics::ADMISSION_DENIALS
            .with_label_values(&[decision.label()])
            .inc();
        AdmissionDecision::Denied(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobStatus, NewJob, SqliteJobStore};
    use crate::testing::UnavailableJobStore;

    fn budget(max_concurrent: u64, max_scratch: u64) -> ResourceBudget {
        ResourceBudget {
            max_concurrent_chunks: max_concurrent,
            max_scratch_bytes: max_scratch,
            estimated_bytes_per_item: 10,
            chunk_item_count: 10,
        }
    }

    fn setup(chunks: Vec<u64>) -> (Arc<SqliteJobStore>, Vec<Chunk>) {
        let store = Arc::new(SqliteJobStore::in_memory().unwrap());
        let job = store
            .create_job(NewJob {
                owner: "owner".to_string(),
                requested_items: chunks.iter().sum(),
                chunk_size: 10,
                chunk_item_counts: chunks,
            })
            .unwrap();
        store.set_job_status(&job.id, JobStatus::Running).unwrap();
        let chunks = store.list_chunks(&job.id).unwrap();
        (store, chunks)
    }

    #[test]
    fn test_admits_within_budget() {
        let (store, chunks) = setup(vec![10]);
        let controller = AdmissionController::new(store.clone(), budget(2, 1000));

        assert!(controller.can_admit(&chunks[0]));
        match controller.try_admit(&chunks[0]) {
            AdmissionDecision::Admitted(chunk) => {
                assert_eq!(chunk.status, ChunkStatus::Admitted);
                assert_eq!(chunk.reserved_bytes, 100);
                assert!(chunk.dispatch_id.is_some());
            }
            other => panic!("expected admission, got {:?}", other),
        }
    }

    #[test]
    fn test_denies_at_concurrency_ceiling() {
        let (store, chunks) = setup(vec![10, 10]);
        let controller = AdmissionController::new(store, budget(1, 1000));

        assert!(matches!(
            controller.try_admit(&chunks[0]),
            AdmissionDecision::Admitted(_)
        ));
        assert!(!controller.can_admit(&chunks[1]));
        assert_eq!(
            controller.try_admit(&chunks[1]),
            AdmissionDecision::Denied(DenyReason::ConcurrencyCeiling {
                active: 1,
                limit: 1
            })
        );
    }

    #[test]
    fn test_denies_when_scratch_exceeded() {
        let (store, chunks) = setup(vec![10, 10]);
        let controller = AdmissionController::new(store, budget(5, 150));

        controller.try_admit(&chunks[0]);
        assert_eq!(
            controller.check(&chunks[1]),
            Err(DenyReason::ScratchBudget {
                used: 100,
                required: 100,
                limit: 150
            })
        );
        assert!(matches!(
            controller.try_admit(&chunks[1]),
            AdmissionDecision::Denied(DenyReason::ScratchBudget { .. })
        ));
    }

    #[test]
    fn test_scratch_boundary_is_inclusive() {
        let (store, chunks) = setup(vec![10, 10]);
        let controller = AdmissionController::new(store, budget(5, 200));

        controller.try_admit(&chunks[0]);
        assert!(matches!(
            controller.try_admit(&chunks[1]),
            AdmissionDecision::Admitted(_)
        ));
    }

    #[test]
    fn test_fails_closed_when_store_unavailable() {
        let (_, chunks) = setup(vec![10]);
        let controller = AdmissionController::new(Arc::new(UnavailableJobStore), budget(5, 1000));

        assert!(!controller.can_admit(&chunks[0]));
        assert_eq!(
            controller.try_admit(&chunks[0]),
            AdmissionDecision::Denied(DenyReason::ResourcesUnknown)
        );
    }

    #[test]
    fn test_terminal_chunk_not_eligible() {
        let (store, chunks) = setup(vec![10]);
        let controller = AdmissionController::new(store.clone(), budget(5, 1000));
        let admitted = match controller.try_admit(&chunks[0]) {
            AdmissionDecision::Admitted(c) => c,
            other => panic!("expected admission, got {:?}", other),
        };

        assert_eq!(
            controller.try_admit(&chunks[0]),
            AdmissionDecision::Denied(DenyReason::NotEligible {
                status: ChunkStatus::Admitted
            })
        );
        assert_eq!(
            controller.check(&admitted),
            Err(DenyReason::NotEligible {
                status: ChunkStatus::Admitted
            })
        );
    }

    #[test]
    fn test_deny_reason_labels() {
        assert_eq!(DenyReason::ResourcesUnknown.label(), "unknown");
        assert!(DenyReason::ResourcesUnknown.is_capacity());
        assert!(!DenyReason::NotEligible {
            status: ChunkStatus::Completed
        }
        .is_capacity());
    }
}
