//! Mock task broker for testing.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::scheduler::{BrokerError, ChunkTask, TaskBroker};

/// Mock implementation of the TaskBroker trait.
///
/// Tasks are only recorded, never run. Tests drive chunks forward by feeding
/// worker events to the orchestrator themselves.
///
/// # Example
///
/// ```rust,ignore
/// use crawlforge_core::testing::MockTaskBroker;
///
/// let broker = MockTaskBroker::new();
/// // ... admit chunks ...
/// let tasks = broker.enqueued().await;
/// assert_eq!(tasks.len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct MockTaskBroker {
    next_handle: AtomicU64,
    /// (handle, task) in submission order.
    tasks: Arc<RwLock<Vec<(String, ChunkTask)>>>,
    started: Arc<RwLock<HashSet<String>>>,
    revoked: Arc<RwLock<Vec<String>>>,
    /// If set, the next enqueue fails with this error.
    next_error: Arc<RwLock<Option<BrokerError>>>,
}

impl MockTaskBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tasks currently queued (not revoked), in submission order.
    pub async fn enqueued(&self) -> Vec<ChunkTask> {
        let revoked = self.revoked.read().await;
        self.tasks
            .read()
            .await
            .iter()
            .filter(|(handle, _)| !revoked.contains(handle))
            .map(|(_, task)| task.clone())
            .collect()
    }

    /// Removes and returns every queued task.
    pub async fn take_enqueued(&self) -> Vec<ChunkTask> {
        let tasks = self.enqueued().await;
        self.tasks.write().await.clear();
        tasks
    }

    /// Handles revoked so far.
    pub async fn revoked(&self) -> Vec<String> {
        self.revoked.read().await.clone()
    }

    /// Marks the task for this chunk as picked up by a worker; it can no
    /// longer be revoked.
    pub async fn mark_started(&self, chunk_id: &str) {
        let tasks = self.tasks.read().await;
        let mut started = self.started.write().await;
        for (handle, task) in tasks.iter() {
            if task.chunk_id == chunk_id {
                started.insert(handle.clone());
            }
        }
    }

    /// Configure the next enqueue to fail with the given error.
    pub async fn set_next_error(&self, error: BrokerError) {
        *self.next_error.write().await = Some(error);
    }
}

#[async_trait]
impl TaskBroker for MockTaskBroker {
    fn name(&self) -> &str {
        "mock"
    }

    async fn enqueue(&self, task: ChunkTask) -> Result<String, BrokerError> {
        if let Some(err) = self.next_error.write().await.take() {
            return Err(err);
        }
        let handle = format!("mock-task-{}", self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.tasks.write().await.push((handle.clone(), task));
        Ok(handle)
    }

    async fn revoke(&self, task_handle: &str) -> Result<bool, BrokerError> {
        if self.started.read().await.contains(task_handle) {
            return Ok(false);
        }
        let known = self
            .tasks
            .read()
            .await
            .iter()
            .any(|(handle, _)| handle == task_handle);
        let mut revoked = self.revoked.write().await;
        if !known || revoked.iter().any(|h| h == task_handle) {
            return Ok(false);
        }
        revoked.push(task_handle.to_string());
        Ok(true)
    }
}
