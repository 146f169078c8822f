//! Dataset orchestrator implementation.
//!
//! Drives jobs through admission, execution and aggregation:
//! - Admission: periodic sweep over pending chunks, backing off while every
//!   candidate is denied and woken as soon as a slot is released
//! - Events: worker callbacks applied to the chunk state machine; events
//!   that hit an unavailable store are kept and redelivered
//! - Watchdog: active chunks without a heartbeat are failed and revoked
//! - Storage: pending rehydrations polled, policies evaluated on schedule

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Notify};
use tracing::{debug, error, info, warn};

use crate::aggregator::{
    AggregationConfig, CreateJobRequest, JobAggregator, JobProgress, JobUpdateCallback,
};
use crate::job::{
    Chunk, ChunkStatus, ChunkUpdate, Job, JobFilter, JobStatus, JobStore, JobStoreError,
};
use crate::policy::{ExecutionResult, PolicyEngine};
use crate::processor::{ChunkEventOutcome, ChunkProcessor, ProducedArtifact, RetryConfig};
use crate::resources::{AdmissionController, AdmissionDecision, DenyReason, ResourceBudget};
use crate::retry::StoreRetryPolicy;
use crate::scheduler::{ChunkScheduler, SubmitOutcome, TaskBroker, WorkerEvent};
use crate::storage::{
    DatasetArtifact, RehydrationHandle, RehydrationPriority, StorageTierManager,
};

use super::config::OrchestratorConfig;
use super::types::{OrchestratorError, OrchestratorStatus, SweepReport};

/// Delay before events held back by an unavailable store are redelivered.
const REDELIVERY_INTERVAL: Duration = Duration::from_secs(1);

/// Running jobs re-derived per watchdog tick.
const RECONCILE_BATCH: i64 = 500;

/// Collaborators the orchestrator is built from.
pub struct OrchestratorParts {
    pub store: Arc<dyn JobStore>,
    pub broker: Arc<dyn TaskBroker>,
    pub tiers: Arc<StorageTierManager>,
    pub policies: Arc<PolicyEngine>,
    pub budget: ResourceBudget,
    pub retry: RetryConfig,
    pub aggregation: AggregationConfig,
}

/// The dataset orchestrator.
pub struct DatasetOrchestrator {
    config: OrchestratorConfig,
    store: Arc<dyn JobStore>,
    aggregator: JobAggregator,
    admission: AdmissionController,
    scheduler: ChunkScheduler,
    processor: ChunkProcessor,
    tiers: Arc<StorageTierManager>,
    policies: Arc<PolicyEngine>,

    // Runtime state
    running: AtomicBool,
    wake: Notify,
    shutdown_tx: broadcast::Sender<()>,
}

impl DatasetOrchestrator {
    pub fn new(config: OrchestratorConfig, parts: OrchestratorParts) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            aggregator: JobAggregator::new(
                Arc::clone(&parts.store),
                parts.aggregation,
                parts.budget.chunk_item_count,
            ),
            admission: AdmissionController::new(Arc::clone(&parts.store), parts.budget),
            scheduler: ChunkScheduler::new(Arc::clone(&parts.store), parts.broker),
            processor: ChunkProcessor::new(Arc::clone(&parts.store), parts.retry),
            store: parts.store,
            tiers: parts.tiers,
            policies: parts.policies,
            config,
            running: AtomicBool::new(false),
            wake: Notify::new(),
            shutdown_tx,
        }
    }

    /// Set callback for job status updates.
    pub fn with_update_callback(mut self, callback: JobUpdateCallback) -> Self {
        self.aggregator = self.aggregator.with_update_callback(callback);
        self
    }

    /// Overrides how store writes are retried while the store is unavailable.
    pub fn with_store_retry(mut self, policy: StoreRetryPolicy) -> Self {
        self.processor = self.processor.with_store_retry(policy);
        self.scheduler = self.scheduler.with_store_retry(policy);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn budget(&self) -> &ResourceBudget {
        self.admission.budget()
    }

    pub fn storage(&self) -> &Arc<StorageTierManager> {
        &self.tiers
    }

    pub fn policies(&self) -> &Arc<PolicyEngine> {
        &self.policies
    }

    // =========================================================================
    // Job operations
    // =========================================================================

    /// Records a job and partitions it into pending chunks.
    pub fn create_job(&self, request: CreateJobRequest) -> Result<Job, OrchestratorError> {
        Ok(self.aggregator.create_job(request)?)
    }

    /// Makes the job's chunks eligible for admission.
    pub fn start_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let job = self.aggregator.start_job(job_id)?;
        self.wake.notify_one();
        Ok(job)
    }

    /// Requests cooperative cancellation of a job.
    ///
    /// Chunks that have not started are cancelled immediately (queued broker
    /// tasks are revoked). Running chunks stop at their next stage boundary.
    /// Returns the number of chunks cancelled before they ran.
    pub async fn cancel_job(&self, job_id: &str) -> Result<u64, OrchestratorError> {
        self.aggregator.request_cancel(job_id)?;

        let mut revoked = 0u64;
        for chunk in self.store.list_chunks(job_id)? {
            let update = if chunk.status.awaits_admission() {
                ChunkUpdate::to(ChunkStatus::Cancelled)
            } else if chunk.status == ChunkStatus::Admitted {
                let Some(dispatch_id) = chunk.dispatch_id.clone() else {
                    continue;
                };
                if !self.scheduler.revoke(&chunk).await {
                    continue;
                }
                ChunkUpdate::to(ChunkStatus::Cancelled).for_dispatch(dispatch_id)
            } else {
                continue;
            };

            match self.store.transition_chunk(&chunk.id, update) {
                Ok(_) => {
                    revoked += 1;
                    crate::metrics::CHUNK_OUTCOMES
                        .with_label_values(&["cancelled"])
                        .inc();
                }
                // Moved on since it was listed; the worker sees the flag.
                Err(JobStoreError::Conflict(_)) | Err(JobStoreError::InvalidTransition { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }

        info!(job_id, revoked, "Job cancellation requested");
        self.wake.notify_one();
        self.aggregator.refresh(job_id)?;
        Ok(revoked)
    }

    /// Starts a new execution attempt re-creating only chunks that did not
    /// complete.
    pub fn retry_job(&self, job_id: &str) -> Result<Job, OrchestratorError> {
        let job = self.aggregator.retry_job(job_id)?;
        self.wake.notify_one();
        Ok(job)
    }

    pub fn get_job_progress(&self, job_id: &str) -> Result<JobProgress, OrchestratorError> {
        Ok(self.aggregator.progress(job_id)?)
    }

    /// Terminal chunk failures of the job's current attempt.
    pub fn get_job_failures(&self, job_id: &str) -> Result<Vec<OrchestratorError>, OrchestratorError> {
        if self.store.get_job(job_id)?.is_none() {
            return Err(OrchestratorError::JobNotFound(job_id.to_string()));
        }
        Ok(self
            .store
            .list_chunks(job_id)?
            .iter()
            .filter_map(OrchestratorError::for_failed_chunk)
            .collect())
    }

    /// Evaluates a policy now.
    pub async fn trigger_policy_execution(
        &self,
        policy_id: &str,
    ) -> Result<ExecutionResult, OrchestratorError> {
        Ok(self.policies.evaluate(policy_id).await?)
    }

    /// Grants access to an artifact; archived or rehydrating artifacts fail
    /// with `ArtifactNotYetAccessible`.
    pub fn open_artifact(&self, artifact_id: &str) -> Result<DatasetArtifact, OrchestratorError> {
        Ok(self.tiers.open_artifact(artifact_id)?)
    }

    pub async fn request_rehydration(
        &self,
        artifact_id: &str,
        priority: RehydrationPriority,
    ) -> Result<RehydrationHandle, OrchestratorError> {
        Ok(self.tiers.request_rehydration(artifact_id, priority).await?)
    }

    // =========================================================================
    // Admission, events and watchdog
    // =========================================================================

    /// Admits a single chunk and submits it to the broker.
    pub async fn admit_chunk(&self, chunk_id: &str) -> Result<SubmitOutcome, OrchestratorError> {
        let chunk = self
            .store
            .get_chunk(chunk_id)?
            .ok_or_else(|| OrchestratorError::NotFound(chunk_id.to_string()))?;
        match self.admission.try_admit(&chunk) {
            AdmissionDecision::Admitted(admitted) => Ok(self.scheduler.submit(&admitted).await),
            AdmissionDecision::Denied(reason) => Err(OrchestratorError::AdmissionDenied(reason)),
        }
    }

    /// Runs one admission sweep over chunks waiting for admission.
    pub async fn admit_pending(&self) -> Result<SweepReport, OrchestratorError> {
        let candidates = self
            .store
            .list_admission_candidates(Utc::now(), self.config.admission_batch_size)?;

        let mut report = SweepReport {
            candidates: candidates.len(),
            ..Default::default()
        };

        for chunk in candidates {
            match self.admit_chunk(&chunk.id).await {
                Ok(SubmitOutcome::Submitted { .. }) => report.admitted += 1,
                Ok(SubmitOutcome::Requeued { .. }) => report.requeued += 1,
                Err(OrchestratorError::AdmissionDenied(reason)) => match reason {
                    DenyReason::NotEligible { .. } => {}
                    // A smaller chunk may still fit the scratch budget.
                    DenyReason::ScratchBudget { .. } => report.denied += 1,
                    DenyReason::ConcurrencyCeiling { .. } | DenyReason::ResourcesUnknown => {
                        report.denied += 1;
                        break;
                    }
                },
                // Raced with cancellation or retry.
                Err(OrchestratorError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if report.candidates > 0 {
            debug!(
                candidates = report.candidates,
                admitted = report.admitted,
                requeued = report.requeued,
                denied = report.denied,
                "Admission sweep finished"
            );
        }
        Ok(report)
    }

    /// Applies one worker event, then registers artifacts and updates the
    /// job once the chunk is terminal.
    ///
    /// A terminal event already applied to its chunk is settled again: a
    /// redelivered event finishes the artifact and job updates that failed
    /// the first time.
    pub async fn process_event(
        &self,
        event: WorkerEvent,
    ) -> Result<ChunkEventOutcome, OrchestratorError> {
        let outcome = self.processor.handle_event(event.clone()).await?;
        if outcome == ChunkEventOutcome::Ignored {
            self.settle_applied_event(&event)?;
        } else {
            self.after_chunk_change(&outcome)?;
        }
        Ok(outcome)
    }

    /// Fails active chunks whose heartbeat is older than the timeout.
    /// Returns the number of chunks reclaimed.
    pub async fn check_timeouts(&self) -> Result<usize, OrchestratorError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.heartbeat_timeout_secs as i64);
        let stale = self.store.list_stale_chunks(cutoff)?;

        let mut reclaimed = 0;
        for chunk in stale {
            self.scheduler.revoke(&chunk).await;
            let outcome = self.processor.handle_timeout(&chunk).await?;
            if outcome.releases_slot() {
                reclaimed += 1;
            }
            self.after_chunk_change(&outcome)?;
        }
        Ok(reclaimed)
    }

    /// Re-derives every running job from its chunks. Returns the number of
    /// jobs that reached a terminal status.
    pub fn reconcile_running_jobs(&self) -> Result<usize, OrchestratorError> {
        let running = self.store.list_jobs(
            &JobFilter::new()
                .with_status(JobStatus::Running)
                .with_limit(RECONCILE_BATCH),
        )?;

        let mut settled = 0;
        for job in running {
            if let Some(status) = self.aggregator.refresh(&job.id)? {
                info!(job_id = %job.id, status = %status, "Job settled by reconciliation");
                settled += 1;
            }
        }
        Ok(settled)
    }

    fn after_chunk_change(&self, outcome: &ChunkEventOutcome) -> Result<(), OrchestratorError> {
        if outcome.releases_slot() {
            self.wake.notify_one();
        }
        let ChunkEventOutcome::Terminal { chunk, artifacts } = outcome else {
            return Ok(());
        };

        if let Some(failure) = OrchestratorError::for_failed_chunk(chunk) {
            warn!(job_id = %chunk.job_id, error = %failure, "Chunk failed terminally");
        }
        self.finish_terminal_chunk(chunk, artifacts)
    }

    fn settle_applied_event(&self, event: &WorkerEvent) -> Result<(), OrchestratorError> {
        let artifacts: &[ProducedArtifact] = match event {
            WorkerEvent::Completed { artifacts, .. } => artifacts,
            WorkerEvent::Failed { .. } | WorkerEvent::Cancelled { .. } => &[],
            WorkerEvent::Started { .. } | WorkerEvent::Heartbeat { .. } => return Ok(()),
        };
        let Some(chunk) = self.store.get_chunk(event.chunk_id())? else {
            return Ok(());
        };
        if !chunk.status.is_terminal() || chunk.dispatch_id.as_deref() != Some(event.dispatch_id())
        {
            return Ok(());
        }

        debug!(
            chunk_id = %chunk.id,
            kind = event.kind(),
            "Settling terminal event already applied to its chunk"
        );
        // Output of a dispatch that ended otherwise is never registered.
        let artifacts: &[ProducedArtifact] = if chunk.status == ChunkStatus::Completed {
            artifacts
        } else {
            &[]
        };
        self.finish_terminal_chunk(&chunk, artifacts)
    }

    /// Registers the chunk's artifacts, then refreshes its job. Registration
    /// is idempotent per location, so this may run more than once.
    fn finish_terminal_chunk(
        &self,
        chunk: &Chunk,
        artifacts: &[ProducedArtifact],
    ) -> Result<(), OrchestratorError> {
        for artifact in artifacts {
            self.tiers
                .register_artifact(&chunk.job_id, Some(&chunk.id), artifact)
                .inspect_err(|e| {
                    error!(
                        chunk_id = %chunk.id,
                        location = %artifact.location,
                        error = %e,
                        "Failed to register artifact"
                    )
                })?;
        }

        self.aggregator.refresh(&chunk.job_id)?;
        Ok(())
    }

    /// Get current orchestrator status.
    ///
    /// Counts that cannot be read are reported as `None`, never as zero.
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            running: self.running.load(Ordering::Relaxed),
            broker: self.scheduler.broker_name().to_string(),
            budget: *self.admission.budget(),
            resources: self.admission.monitor().snapshot(),
            jobs_by_status: self.count_jobs_by_status(),
            chunks_by_status: self.count_chunks_by_status(),
        }
    }

    fn count_jobs_by_status(&self) -> Option<BTreeMap<String, u64>> {
        let mut counts = BTreeMap::new();
        for status in [
            JobStatus::Created,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::CompletedWithErrors,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            match self.store.count_jobs(&JobFilter::new().with_status(status)) {
                Ok(count) => {
                    counts.insert(status.as_str().to_string(), count as u64);
                }
                Err(e) => {
                    warn!(error = %e, "Failed to count jobs");
                    return None;
                }
            }
        }
        Some(counts)
    }

    fn count_chunks_by_status(&self) -> Option<BTreeMap<String, u64>> {
        match self.store.count_chunks_by_status() {
            Ok(counts) => Some(
                counts
                    .into_iter()
                    .map(|(status, count)| (status.as_str().to_string(), count))
                    .collect(),
            ),
            Err(e) => {
                warn!(error = %e, "Failed to count chunks");
                None
            }
        }
    }

    // =========================================================================
    // Background loops
    // =========================================================================

    /// Start the orchestrator (spawns background tasks). Worker events are
    /// read from `events`.
    pub fn start(self: &Arc<Self>, events: mpsc::Receiver<WorkerEvent>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already running");
            return;
        }

        info!(broker = self.scheduler.broker_name(), "Starting dataset orchestrator");

        self.spawn_event_loop(events);
        self.spawn_admission_loop();
        self.spawn_watchdog_loop();
        self.spawn_rehydration_loop();
        if self.policies.config().enabled {
            self.spawn_policy_loop();
        }

        info!("Dataset orchestrator started");
    }

    /// Stop the orchestrator gracefully.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Orchestrator not running");
            return;
        }

        info!("Stopping dataset orchestrator");
        let _ = self.shutdown_tx.send(());

        // Give loops a moment to finish current work
        tokio::time::sleep(Duration::from_millis(200)).await;

        info!("Dataset orchestrator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn spawn_admission_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let base = Duration::from_millis(self.config.admission_interval_ms.max(1));
        let ceiling = Duration::from_millis(self.config.max_admission_backoff_ms).max(base);

        tokio::spawn(async move {
            info!("Admission loop started");
            let mut delay = base;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Admission loop received shutdown signal");
                        break;
                    }
                    _ = this.wake.notified() => {
                        delay = base;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if !this.running.load(Ordering::Relaxed) {
                    break;
                }

                delay = match this.admit_pending().await {
                    Ok(report) if report.fully_denied() => (delay * 2).min(ceiling),
                    Ok(_) => base,
                    Err(e) => {
                        warn!(error = %e, "Admission sweep failed");
                        (delay * 2).min(ceiling)
                    }
                };
            }
            info!("Admission loop stopped");
        });
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<WorkerEvent>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            info!("Event loop started");
            let mut held: VecDeque<WorkerEvent> = VecDeque::new();
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Event loop received shutdown signal");
                        break;
                    }
                    received = events.recv() => {
                        let Some(event) = received else {
                            info!("Worker event channel closed");
                            break;
                        };
                        // Keep per-chunk ordering behind held events.
                        if held.is_empty() {
                            if let Some(event) = this.deliver(event).await {
                                held.push_back(event);
                            }
                        } else {
                            held.push_back(event);
                        }
                    }
                    _ = tokio::time::sleep(REDELIVERY_INTERVAL), if !held.is_empty() => {
                        while let Some(event) = held.pop_front() {
                            if let Some(event) = this.deliver(event).await {
                                held.push_front(event);
                                break;
                            }
                        }
                    }
                }
            }
            if !held.is_empty() {
                warn!(held = held.len(), "Event loop stopped with undelivered events");
            }
            info!("Event loop stopped");
        });
    }

    /// Applies an event; hands it back if the store was unavailable.
    async fn deliver(&self, event: WorkerEvent) -> Option<WorkerEvent> {
        match self.process_event(event.clone()).await {
            Ok(_) => None,
            Err(OrchestratorError::StoreUnavailable(e)) => {
                warn!(
                    chunk_id = event.chunk_id(),
                    kind = event.kind(),
                    error = %e,
                    "Store unavailable, holding event for redelivery"
                );
                Some(event)
            }
            Err(e) => {
                warn!(
                    chunk_id = event.chunk_id(),
                    kind = event.kind(),
                    error = %e,
                    "Failed to process worker event"
                );
                None
            }
        }
    }

    fn spawn_watchdog_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.watchdog_interval_ms.max(1));

        tokio::spawn(async move {
            info!("Watchdog loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Watchdog loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        match this.check_timeouts().await {
                            Ok(0) => {}
                            Ok(reclaimed) => info!(reclaimed, "Reclaimed chunks with lost heartbeats"),
                            Err(e) => warn!(error = %e, "Watchdog check failed"),
                        }
                        if let Err(e) = this.reconcile_running_jobs() {
                            warn!(error = %e, "Job reconciliation failed");
                        }
                    }
                }
            }
            info!("Watchdog loop stopped");
        });
    }

    fn spawn_rehydration_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.config.rehydration_poll_interval_ms.max(1));

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        match this.tiers.poll_all_rehydrations().await {
                            Ok(0) => {}
                            Ok(ready) => info!(ready, "Rehydrations completed"),
                            Err(e) => warn!(error = %e, "Rehydration poll failed"),
                        }
                    }
                }
            }
            debug!("Rehydration loop stopped");
        });
    }

    fn spawn_policy_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.policies.config().evaluation_interval_secs.max(1));

        tokio::spawn(async move {
            info!("Policy loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {
                        if !this.running.load(Ordering::Relaxed) {
                            break;
                        }
                        match this.policies.evaluate_all_active().await {
                            Ok(results) => {
                                for (policy_id, result) in results {
                                    if let Err(e) = result {
                                        warn!(policy_id = %policy_id, error = %e, "Policy evaluation failed");
                                    }
                                }
                            }
                            Err(e) => warn!(error = %e, "Failed to list active policies"),
                        }
                    }
                }
            }
            info!("Policy loop stopped");
        });
    }
}
