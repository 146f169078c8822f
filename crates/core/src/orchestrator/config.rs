//! Orchestrator configuration.

use serde::{Deserialize, Serialize};

/// `[orchestrator]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Enable/disable the background loops.
    /// When disabled, admission and event handling must be driven manually.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Delay between admission sweeps while chunks are being admitted (milliseconds).
    #[serde(default = "default_admission_interval")]
    pub admission_interval_ms: u64,

    /// Ceiling for the sweep delay after consecutive fully-denied sweeps (milliseconds).
    #[serde(default = "default_max_admission_backoff")]
    pub max_admission_backoff_ms: u64,

    /// Candidates considered per sweep.
    #[serde(default = "default_admission_batch_size")]
    pub admission_batch_size: i64,

    /// How often active chunks are checked for lost heartbeats (milliseconds).
    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_ms: u64,

    /// An active chunk without a heartbeat for this long is failed.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// How often pending rehydrations are polled (milliseconds).
    #[serde(default = "default_rehydration_poll_interval")]
    pub rehydration_poll_interval_ms: u64,

    /// Capacity of the worker event channel.
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,
}

fn default_true() -> bool {
    true
}

fn default_admission_interval() -> u64 {
    1000
}

fn default_max_admission_backoff() -> u64 {
    30_000
}

fn default_admission_batch_size() -> i64 {
    32
}

fn default_watchdog_interval() -> u64 {
    5000
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_rehydration_poll_interval() -> u64 {
    60_000
}

fn default_event_buffer_size() -> usize {
    1024
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admission_interval_ms: default_admission_interval(),
            max_admission_backoff_ms: default_max_admission_backoff(),
            admission_batch_size: default_admission_batch_size(),
            watchdog_interval_ms: default_watchdog_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            rehydration_poll_interval_ms: default_rehydration_poll_interval(),
            event_buffer_size: default_event_buffer_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OrchestratorConfig::default();
        assert!(config.enabled);
        assert_eq!(config.admission_interval_ms, 1000);
        assert_eq!(config.max_admission_backoff_ms, 30_000);
        assert_eq!(config.heartbeat_timeout_secs, 60);
    }

    #[test]
    fn test_deserialize_minimal() {
        let toml = r#"
            enabled = false
            heartbeat_timeout_secs = 120
        "#;
        let config: OrchestratorConfig = toml::from_str(toml).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.heartbeat_timeout_secs, 120);
        assert_eq!(config.admission_batch_size, 32);
    }
}
