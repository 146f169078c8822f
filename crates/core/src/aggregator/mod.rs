//! Job aggregation: job lifecycle, counters and verdicts.

mod aggregator;
mod verdict;

pub use aggregator::{
    ChunkSummary, CreateJobRequest, JobAggregator, JobError, JobProgress, JobUpdateCallback,
};
pub use verdict::{derive_verdict, AggregationConfig, ChunkTally};
