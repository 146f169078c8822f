//! Chunk processor.
//!
//! Two halves:
//! - worker side: [`ChunkRunner`] drives an [`ItemPipeline`] through
//!   download -> validate -> persist, emitting heartbeats and one terminal
//!   event per dispatch
//! - orchestration side: [`ChunkProcessor`] applies those events (and
//!   watchdog timeouts) to the chunk state machine, including retries

mod config;
mod http_pipeline;
mod pipeline;
mod runner;
mod shell;
mod types;

pub use config::{RetryConfig, WorkerConfig};
pub use http_pipeline::HttpItemPipeline;
pub use pipeline::ItemPipeline;
pub use runner::{ChunkRunner, RunResult};
pub use shell::{ChunkEventOutcome, ChunkProcessor, FailureCause};
pub use types::{
    DownloadOutcome, PersistOutcome, ProducedArtifact, Stage, StageError, ValidationOutcome,
};
