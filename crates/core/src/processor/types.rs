//! Types exchanged between the chunk pipeline stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A pipeline stage inside a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Download,
    Validate,
    Persist,
}

impl Stage {
    pub const ORDER: [Stage; 3] = [Stage::Download, Stage::Validate, Stage::Persist];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Download => "download",
            Stage::Validate => "validate",
            Stage::Persist => "persist",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported by a stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} stage failed: {message}")]
    Failed { stage: Stage, message: String },

    #[error("{stage} stage timed out")]
    Timeout { stage: Stage },

    #[error("stage service unavailable: {0}")]
    Unavailable(String),
}

/// Output of the download stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadOutcome {
    pub items_downloaded: u64,
    pub items_failed: u64,
    /// Scratch location holding the downloaded items.
    #[serde(default)]
    pub scratch_ref: Option<String>,
}

/// Output of the validate stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub items_valid: u64,
    pub items_invalid: u64,
    #[serde(default)]
    pub scratch_ref: Option<String>,
}

/// An artifact written by the persist stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducedArtifact {
    /// Object storage location.
    pub location: String,
    pub size_bytes: u64,
}

/// Output of the persist stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistOutcome {
    pub items_persisted: u64,
    #[serde(default)]
    pub artifacts: Vec<ProducedArtifact>,
}
