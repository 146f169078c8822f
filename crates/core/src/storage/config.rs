//! Configuration for artifact storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::types::RehydrationPriority;

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory of the filesystem object storage.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Expected time for a standard-priority rehydration.
    #[serde(default = "default_standard_eta")]
    pub standard_rehydration_eta_secs: u64,

    /// Expected time for an expedited rehydration.
    #[serde(default = "default_expedited_eta")]
    pub expedited_rehydration_eta_secs: u64,
}

fn default_root() -> PathBuf {
    PathBuf::from("data/artifacts")
}

fn default_standard_eta() -> u64 {
    15 * 60 * 60
}

fn default_expedited_eta() -> u64 {
    60 * 60
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            standard_rehydration_eta_secs: default_standard_eta(),
            expedited_rehydration_eta_secs: default_expedited_eta(),
        }
    }
}

impl StorageConfig {
    /// Sets the object storage root.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Expected rehydration time for the given priority.
    pub fn rehydration_eta(&self, priority: RehydrationPriority) -> Duration {
        match priority {
            RehydrationPriority::Standard => Duration::from_secs(self.standard_rehydration_eta_secs),
            RehydrationPriority::Expedited => {
                Duration::from_secs(self.expedited_rehydration_eta_secs)
            }
        }
    }
}
