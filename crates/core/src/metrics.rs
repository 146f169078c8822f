//! Prometheus metrics for core components.
//!
//! This module provides metrics for:
//! - Admission control (admissions, denials by reason)
//! - Chunk execution (outcomes, retries, timeouts, duration)
//! - Job verdicts
//! - Storage tiers, rehydration and policy runs

use once_cell::sync::Lazy;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts};

// =============================================================================
// Admission Metrics
// =============================================================================

/// Chunks admitted into execution.
pub static CHUNKS_ADMITTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "crawlforge_chunks_admitted_total",
        "Total chunks admitted into execution",
    )
    .unwrap()
});

/// Admission denials by reason.
pub static ADMISSION_DENIALS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlforge_admission_denials_total",
            "Total admission denials",
        ),
        &["reason"], // "concurrency", "scratch", "unknown", "not_eligible"
    )
    .unwrap()
});

// =============================================================================
// Chunk Execution Metrics
// =============================================================================

/// Chunk execution outcomes.
pub static CHUNK_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("crawlforge_chunk_outcomes_total", "Total chunk outcomes"),
        &["result"], // "completed", "failed", "retrying", "cancelled"
    )
    .unwrap()
});

/// Chunk retries scheduled, by cause.
pub static CHUNK_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("crawlforge_chunk_retries_total", "Total chunk retries"),
        &["cause"], // "execution", "timeout", "enqueue"
    )
    .unwrap()
});

/// Chunks failed by the heartbeat watchdog.
pub static CHUNK_TIMEOUTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "crawlforge_chunk_timeouts_total",
        "Total chunks that missed their heartbeat window",
    )
    .unwrap()
});

/// Chunk execution duration in seconds.
pub static CHUNK_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "crawlforge_chunk_duration_seconds",
            "Duration of chunk execution",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
        &["result"],
    )
    .unwrap()
});

// =============================================================================
// Job Metrics
// =============================================================================

/// Job verdicts by final status.
pub static JOB_VERDICTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("crawlforge_job_verdicts_total", "Total terminal job verdicts"),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Storage Metrics
// =============================================================================

/// Tier transitions by target tier and result.
pub static TIER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlforge_tier_transitions_total",
            "Total artifact tier transitions",
        ),
        &["target", "result"],
    )
    .unwrap()
});

/// Rehydrations requested by priority.
pub static REHYDRATIONS_REQUESTED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "crawlforge_rehydrations_requested_total",
            "Total rehydration requests",
        ),
        &["priority"],
    )
    .unwrap()
});

/// Rehydrations that reached the ready state.
pub static REHYDRATIONS_COMPLETED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "crawlforge_rehydrations_completed_total",
        "Total rehydrations completed",
    )
    .unwrap()
});

// =============================================================================
// Policy Metrics
// =============================================================================

/// Policy runs by outcome.
pub static POLICY_RUNS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("crawlforge_policy_runs_total", "Total policy evaluation runs"),
        &["outcome"], // "success", "partial", "failure"
    )
    .unwrap()
});

/// Returns all core metrics for registration.
pub fn all_metrics() -> Vec<Box<dyn prometheus::core::Collector>> {
    vec![
        Box::new(CHUNKS_ADMITTED.clone()),
        Box::new(ADMISSION_DENIALS.clone()),
        Box::new(CHUNK_OUTCOMES.clone()),
        Box::new(CHUNK_RETRIES.clone()),
        Box::new(CHUNK_TIMEOUTS.clone()),
        Box::new(CHUNK_DURATION.clone()),
        Box::new(JOB_VERDICTS.clone()),
        Box::new(TIER_TRANSITIONS.clone()),
        Box::new(REHYDRATIONS_REQUESTED.clone()),
        Box::new(REHYDRATIONS_COMPLETED.clone()),
        Box::new(POLICY_RUNS.clone()),
    ]
}
