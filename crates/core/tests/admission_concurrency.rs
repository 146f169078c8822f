//! Admission across orchestrator instances sharing one store file.
//!
//! Each instance has its own connection and controller; only the store's
//! conditional update keeps the ceilings.

use std::sync::Arc;

use tempfile::TempDir;

use crawlforge_core::{
    job::{JobStatus, NewJob},
    resources::{AdmissionController, AdmissionDecision},
    testing::fixtures,
    JobStore, ResourceBudget, SqliteJobStore,
};

const INSTANCES: usize = 4;

struct Shared {
    stores: Vec<Arc<SqliteJobStore>>,
    job_id: String,
    _temp_dir: TempDir,
}

fn shared_store(chunks: usize) -> Shared {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("shared.db");

    let stores: Vec<Arc<SqliteJobStore>> = (0..INSTANCES)
        .map(|_| Arc::new(SqliteJobStore::new(&db_path).expect("Failed to open store")))
        .collect();

    let job = stores[0]
        .create_job(NewJob {
            owner: "tenant-a".to_string(),
            requested_items: chunks as u64 * 100,
            chunk_size: 100,
            chunk_item_counts: vec![100; chunks],
        })
        .unwrap();
    stores[0].set_job_status(&job.id, JobStatus::Running).unwrap();

    Shared {
        stores,
        job_id: job.id,
        _temp_dir: temp_dir,
    }
}

/// Every instance tries to admit every chunk at the same time.
fn race(shared: &Shared, budget: ResourceBudget) -> usize {
    let chunks = shared.stores[0].list_chunks(&shared.job_id).unwrap();
    std::thread::scope(|scope| {
        let handles: Vec<_> = shared
            .stores
            .iter()
            .map(|store| {
                let controller = AdmissionController::new(store.clone(), budget);
                let chunks = chunks.clone();
                scope.spawn(move || {
                    chunks
                        .iter()
                        .filter(|chunk| {
                            matches!(controller.try_admit(chunk), AdmissionDecision::Admitted(_))
                        })
                        .count()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).sum()
    })
}

#[test]
fn test_concurrency_ceiling_holds_across_instances() {
    let shared = shared_store(12);
    let admitted = race(&shared, fixtures::budget(3, 1 << 30));

    assert_eq!(admitted, 3);
    assert_eq!(shared.stores[1].count_active_chunks().unwrap(), 3);
}

#[test]
fn test_scratch_budget_holds_across_instances() {
    let shared = shared_store(12);
    // 100 items x 1 KiB per chunk; room for five.
    let admitted = race(&shared, fixtures::budget(100, 5 * 100 * 1024));

    assert_eq!(admitted, 5);
    assert_eq!(
        shared.stores[2].scratch_usage_bytes().unwrap(),
        5 * 100 * 1024
    );
}

#[test]
fn test_each_chunk_admitted_once() {
    let shared = shared_store(6);
    let admitted = race(&shared, fixtures::budget(100, 1 << 30));

    assert_eq!(admitted, 6);
    let chunks = shared.stores[3].list_chunks(&shared.job_id).unwrap();
    assert!(chunks.iter().all(|c| c.dispatch_id.is_some()));
}
