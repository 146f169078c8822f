//! Testing utilities and mock implementations for E2E tests.
//!
//! Mocks for every seam the orchestrator talks through, so whole job
//! lifecycles can be driven without workers or a real object store.
//!
//! # Example
//!
//! ```rust,ignore
//! use crawlforge_core::testing::{fixtures, TestHarness};
//!
//! let harness = TestHarness::new(fixtures::budget(2, 1 << 20));
//! let job = harness.orchestrator.create_job(fixtures::job_request(1000, 500))?;
//! harness.orchestrator.start_job(&job.id)?;
//! harness.orchestrator.admit_pending().await?;
//!
//! for task in harness.broker.take_enqueued().await {
//!     harness.complete(&task, fixtures::counters(500, 0)).await;
//! }
//! ```

mod flaky_store;
mod harness;
mod mock_broker;
mod mock_object_storage;
mod mock_pipeline;
mod unavailable_store;

pub use flaky_store::{FlakyArtifactStore, FlakyJobStore};
pub use harness::{HarnessOptions, TestHarness};
pub use mock_broker::MockTaskBroker;
pub use mock_object_storage::{MockObjectStorage, RecordedRehydration};
pub use mock_pipeline::MockItemPipeline;
pub use unavailable_store::UnavailableJobStore;

/// Test fixtures and helper functions.
pub mod fixtures {
    use crate::aggregator::CreateJobRequest;
    use crate::job::ChunkCounters;
    use crate::policy::{NewPolicy, PolicyAction, PolicyPredicate};
    use crate::resources::ResourceBudget;
    use crate::storage::Tier;

    /// A budget with 1 KiB per item and 100-item chunks.
    pub fn budget(max_concurrent_chunks: u64, max_scratch_bytes: u64) -> ResourceBudget {
        ResourceBudget {
            max_concurrent_chunks,
            max_scratch_bytes,
            estimated_bytes_per_item: 1024,
            chunk_item_count: 100,
        }
    }

    pub fn job_request(requested_items: u64, chunk_size: u64) -> CreateJobRequest {
        CreateJobRequest {
            owner: "tenant-a".to_string(),
            requested_items,
            chunk_size: Some(chunk_size),
        }
    }

    /// Counters for a chunk where every downloaded item was processed.
    pub fn counters(completed: u64, failed: u64) -> ChunkCounters {
        ChunkCounters {
            items_downloaded: completed + failed,
            items_completed: completed,
            items_failed: failed,
        }
    }

    /// An active policy moving artifacts older than `min_age_days` to `tier`.
    pub fn archival_policy(name: &str, min_age_days: u32, tier: Tier) -> NewPolicy {
        NewPolicy {
            name: name.to_string(),
            active: true,
            predicate: PolicyPredicate {
                min_age_days: Some(min_age_days),
                ..Default::default()
            },
            action: PolicyAction::TransitionTo(tier),
        }
    }

    /// An active policy deleting artifacts idle for `min_idle_days`.
    pub fn cleanup_policy(name: &str, min_idle_days: u32) -> NewPolicy {
        NewPolicy {
            name: name.to_string(),
            active: true,
            predicate: PolicyPredicate {
                min_idle_days: Some(min_idle_days),
                ..Default::default()
            },
            action: PolicyAction::Delete,
        }
    }
}
