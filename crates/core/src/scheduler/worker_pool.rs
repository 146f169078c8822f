//! Local worker pool broker.
//!
//! Runs N independent worker tasks fed by a shared queue. Queued tasks can
//! be revoked; running tasks stop cooperatively through the job's
//! cancellation flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerError, ChunkTask, TaskBroker, WorkerEvent};
use crate::processor::ChunkRunner;

struct QueuedTask {
    handle: String,
    task: ChunkTask,
}

/// Tracks statistics for the pool.
#[derive(Default)]
struct PoolStats {
    active: AtomicU64,
    total_processed: AtomicU64,
    total_revoked: AtomicU64,
}

/// Current state of the worker pool.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStatus {
    pub pool_size: usize,
    pub active_tasks: u64,
    pub queued_tasks: usize,
    pub total_processed: u64,
    pub total_revoked: u64,
}

struct PoolState {
    queue: Mutex<VecDeque<QueuedTask>>,
    notify: Notify,
    stats: PoolStats,
}

impl PoolState {
    fn pop(&self) -> Option<QueuedTask> {
        self.queue.lock().ok()?.pop_front()
    }
}

/// Broker executing chunks on in-process worker tasks.
pub struct WorkerPoolBroker {
    state: Arc<PoolState>,
    pool_size: usize,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPoolBroker {
    /// Starts `pool_size` workers that run tasks with `runner` and report on
    /// `events`.
    pub fn start(
        pool_size: usize,
        runner: Arc<ChunkRunner>,
        events: mpsc::Sender<WorkerEvent>,
    ) -> Self {
        let state = Arc::new(PoolState {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            stats: PoolStats::default(),
        });
        let (shutdown_tx, _) = watch::channel(false);

        let workers = (0..pool_size.max(1))
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    Arc::clone(&state),
                    Arc::clone(&runner),
                    events.clone(),
                    shutdown_tx.subscribe(),
                ))
            })
            .collect();

        info!(pool_size, "Worker pool started");

        Self {
            state,
            pool_size: pool_size.max(1),
            shutdown_tx,
            workers: Mutex::new(workers),
        }
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            pool_size: self.pool_size,
            active_tasks: self.state.stats.active.load(Ordering::Relaxed),
            queued_tasks: self.state.queue.lock().map(|q| q.len()).unwrap_or(0),
            total_processed: self.state.stats.total_processed.load(Ordering::Relaxed),
            total_revoked: self.state.stats.total_revoked.load(Ordering::Relaxed),
        }
    }

    /// Stops the workers after their current task and waits for them.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(_) => return,
        };
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

#[async_trait]
impl TaskBroker for WorkerPoolBroker {
    fn name(&self) -> &str {
        "local_pool"
    }

    async fn enqueue(&self, task: ChunkTask) -> Result<String, BrokerError> {
        if *self.shutdown_tx.borrow() {
            return Err(BrokerError::Closed);
        }
        let handle = format!("local-{}", uuid::Uuid::new_v4());
        {
            let mut queue = self
                .state
                .queue
                .lock()
                .map_err(|_| BrokerError::Internal("queue lock poisoned".to_string()))?;
            queue.push_back(QueuedTask {
                handle: handle.clone(),
                task,
            });
        }
        self.state.notify.notify_one();
        Ok(handle)
    }

    async fn revoke(&self, task_handle: &str) -> Result<bool, BrokerError> {
        let mut queue = self
            .state
            .queue
            .lock()
            .map_err(|_| BrokerError::Internal("queue lock poisoned".to_string()))?;
        let before = queue.len();
        queue.retain(|queued| queued.handle != task_handle);
        let revoked = queue.len() < before;
        if revoked {
            self.state.stats.total_revoked.fetch_add(1, Ordering::Relaxed);
            debug!(task_handle, "Revoked queued task");
        }
        Ok(revoked)
    }
}

async fn worker_loop(
    worker_id: usize,
    state: Arc<PoolState>,
    runner: Arc<ChunkRunner>,
    events: mpsc::Sender<WorkerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Worker started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        match state.pop() {
            Some(queued) => {
                state.stats.active.fetch_add(1, Ordering::Relaxed);
                debug!(worker_id, task_handle = %queued.handle, chunk_id = %queued.task.chunk_id, "Worker picked up task");
                runner.run(&queued.task, &events).await;
                state.stats.active.fetch_sub(1, Ordering::Relaxed);
                state.stats.total_processed.fetch_add(1, Ordering::Relaxed);
            }
            None => {
                tokio::select! {
                    _ = state.notify.notified() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}
