//! Prometheus metrics for observability.
//!
//! This module provides metrics for monitoring the crawlforge daemon:
//! - HTTP request metrics (latency, counts, in flight)
//! - Orchestrator and worker pool status (collected at scrape time)
//! - Every core metric (admission, chunk outcomes, tiers, policies)

use once_cell::sync::Lazy;
use prometheus::{
    self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::state::AppState;

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// HTTP Request Metrics
// =============================================================================

/// HTTP request duration in seconds.
pub static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "crawlforge_http_request_duration_seconds",
            "HTTP request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests total count.
pub static HTTP_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("crawlforge_http_requests_total", "Total HTTP requests"),
        &["method", "path", "status"],
    )
    .unwrap()
});

/// HTTP requests currently in flight.
pub static HTTP_REQUESTS_IN_FLIGHT: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_http_requests_in_flight",
        "Number of HTTP requests currently being processed",
    )
    .unwrap()
});

// =============================================================================
// Orchestrator Metrics
// =============================================================================

/// Whether the orchestrator loops are running (1 = yes, 0 = no).
pub static ORCHESTRATOR_RUNNING: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_orchestrator_running",
        "Whether the orchestrator is running",
    )
    .unwrap()
});

/// Chunks admitted or running. `-1` when the store cannot be read.
pub static ACTIVE_CHUNKS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_active_chunks",
        "Chunks currently admitted or running (-1 when unknown)",
    )
    .unwrap()
});

/// Scratch bytes reserved by active chunks. `-1` when unknown.
pub static SCRATCH_USAGE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_scratch_usage_bytes",
        "Scratch bytes reserved by active chunks (-1 when unknown)",
    )
    .unwrap()
});

/// Jobs by current status.
pub static JOBS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("crawlforge_jobs_by_status", "Current job count by status"),
        &["status"],
    )
    .unwrap()
});

/// Chunks by current status.
pub static CHUNKS_BY_STATUS: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("crawlforge_chunks_by_status", "Current chunk count by status"),
        &["status"],
    )
    .unwrap()
});

// =============================================================================
// Worker Pool Metrics
// =============================================================================

pub static WORKER_POOL_ACTIVE: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_worker_pool_active",
        "Tasks currently executing in the local worker pool",
    )
    .unwrap()
});

pub static WORKER_POOL_QUEUED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new(
        "crawlforge_worker_pool_queued",
        "Tasks waiting in the local worker pool queue",
    )
    .unwrap()
});

// =============================================================================
// Registration
// =============================================================================

fn register_metrics(registry: &Registry) {
    // HTTP
    registry
        .register(Box::new(HTTP_REQUEST_DURATION.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .unwrap();
    registry
        .register(Box::new(HTTP_REQUESTS_IN_FLIGHT.clone()))
        .unwrap();

    // Orchestrator
    registry
        .register(Box::new(ORCHESTRATOR_RUNNING.clone()))
        .unwrap();
    registry.register(Box::new(ACTIVE_CHUNKS.clone())).unwrap();
    registry
        .register(Box::new(SCRATCH_USAGE_BYTES.clone()))
        .unwrap();
    registry.register(Box::new(JOBS_BY_STATUS.clone())).unwrap();
    registry
        .register(Box::new(CHUNKS_BY_STATUS.clone()))
        .unwrap();

    // Worker pool
    registry
        .register(Box::new(WORKER_POOL_ACTIVE.clone()))
        .unwrap();
    registry
        .register(Box::new(WORKER_POOL_QUEUED.clone()))
        .unwrap();

    // Core metrics (admission, chunks, jobs, tiers, policies)
    for metric in crawlforge_core::metrics::all_metrics() {
        registry.register(metric).unwrap();
    }
}

/// Encode all metrics as Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Collect dynamic metrics from current application state.
///
/// Called before encoding so gauges reflect the store at scrape time.
pub fn collect_dynamic_metrics(state: &AppState) {
    match state.orchestrator() {
        Some(orchestrator) => {
            let status = orchestrator.status();
            ORCHESTRATOR_RUNNING.set(i64::from(status.running));
            ACTIVE_CHUNKS.set(status.resources.active_chunks.as_gauge());
            SCRATCH_USAGE_BYTES.set(status.resources.scratch_usage_bytes.as_gauge());
            // Unreadable counts keep their last scraped values.
            for (job_status, count) in status.jobs_by_status.iter().flatten() {
                JOBS_BY_STATUS
                    .with_label_values(&[job_status.as_str()])
                    .set(*count as i64);
            }
            for (chunk_status, count) in status.chunks_by_status.iter().flatten() {
                CHUNKS_BY_STATUS
                    .with_label_values(&[chunk_status.as_str()])
                    .set(*count as i64);
            }
        }
        None => {
            ORCHESTRATOR_RUNNING.set(0);
            ACTIVE_CHUNKS.set(-1);
            SCRATCH_USAGE_BYTES.set(-1);
        }
    }

    if let Some(pool) = state.pool_status() {
        WORKER_POOL_ACTIVE.set(pool.active_tasks as i64);
        WORKER_POOL_QUEUED.set(pool.queued_tasks as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_metrics_returns_prometheus_format() {
        HTTP_REQUESTS_TOTAL
            .with_label_values(&["GET", "/test", "200"])
            .inc();

        let output = encode_metrics();
        assert!(output.contains("crawlforge_http_requests_total"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_registry_contains_core_metrics() {
        crawlforge_core::metrics::CHUNKS_ADMITTED.inc_by(0);
        crawlforge_core::metrics::ADMISSION_DENIALS
            .with_label_values(&["concurrency"])
            .inc_by(0);

        let output = encode_metrics();
        assert!(output.contains("crawlforge_chunks_admitted_total"));
        assert!(output.contains("crawlforge_admission_denials_total"));
    }

    #[test]
    fn test_unknown_readings_without_orchestrator() {
        let state = AppState::new(crawlforge_core::Config::default(), None, None);
        collect_dynamic_metrics(&state);

        assert_eq!(ORCHESTRATOR_RUNNING.get(), 0);
        assert_eq!(ACTIVE_CHUNKS.get(), -1);
        assert_eq!(SCRATCH_USAGE_BYTES.get(), -1);
    }
}
