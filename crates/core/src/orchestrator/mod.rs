//! Dataset orchestrator.
//!
//! Turns job requests into chunks and drives them to a job-level verdict:
//! - **Admission**: sweeps pending chunks through the admission controller
//! - **Execution**: admitted chunks go to the task broker; worker events come
//!   back through a channel and are applied by the chunk processor
//! - **Storage**: produced artifacts are registered with the tier manager;
//!   rehydrations are polled and policies evaluated on a schedule

mod config;
mod runner;
mod types;

pub use config::OrchestratorConfig;
pub use runner::{DatasetOrchestrator, OrchestratorParts};
pub use types::{OrchestratorError, OrchestratorStatus, SweepReport};
