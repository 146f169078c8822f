//! Configuration for the policy engine.

use serde::{Deserialize, Serialize};

/// `[policy]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyEngineConfig {
    /// Whether the orchestrator evaluates policies on a schedule.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often active policies are evaluated.
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,

    /// Length of a policy run. Evaluations inside the same window belong to
    /// the same run and never act twice on an artifact.
    #[serde(default = "default_run_window")]
    pub run_window_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_evaluation_interval() -> u64 {
    3600
}

fn default_run_window() -> u64 {
    86_400
}

impl Default for PolicyEngineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_secs: default_evaluation_interval(),
            run_window_secs: default_run_window(),
        }
    }
}
