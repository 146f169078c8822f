//! Chunk scheduler and task brokers.

mod broker;
mod dispatch;
mod worker_pool;

pub use broker::{BrokerError, ChunkTask, TaskBroker, WorkerEvent};
pub use dispatch::{ChunkScheduler, SubmitOutcome};
pub use worker_pool::{PoolStatus, WorkerPoolBroker};
