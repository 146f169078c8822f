//! Configuration for chunk execution and retries.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry configuration for failed or timed-out chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries allowed before a chunk fails terminally.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    5_000 // 5 seconds
}

fn default_max_delay() -> u64 {
    300_000 // 5 minutes
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Backoff before the retry that follows `retry_count` earlier retries.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(retry_count as i32);
        let delay_ms = (self.initial_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(delay_ms as u64)
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay_ms(mut self, delay_ms: u64) -> Self {
        self.initial_delay_ms = delay_ms;
        self
    }
}

/// Worker-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers in the local pool.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How often a running chunk reports a heartbeat (milliseconds).
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,

    /// Base URL of the HTTP stage service. When unset the local pipeline
    /// cannot run chunk stages.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Per-stage request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_pool_size() -> usize {
    4
}

fn default_heartbeat_interval() -> u64 {
    5_000 // 5 seconds
}

fn default_request_timeout() -> u64 {
    600 // 10 minutes
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            pool_size: default_pool_size(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            endpoint: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}
