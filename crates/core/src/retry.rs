//! Backoff for store writes that hit an unreachable store.

use std::time::Duration;

use tracing::warn;

use crate::job::JobStoreError;

/// How store writes are retried while the store reports `Unavailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreRetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for StoreRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl StoreRetryPolicy {
    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Runs `op`, retrying with exponential backoff while it fails with
    /// `Unavailable`. Other errors are returned immediately.
    pub async fn run<T, F>(&self, operation: &str, mut op: F) -> Result<T, JobStoreError>
    where
        F: FnMut() -> Result<T, JobStoreError>,
    {
        let mut delay = self.initial_delay;
        let mut attempt = 1;
        loop {
            match op() {
                Err(JobStoreError::Unavailable(msg)) if attempt < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        error = %msg,
                        "Store unavailable, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
