//! Background job service.
//!
//! Owns the job lifecycle end to end: validated submission, capacity-bounded
//! dispatch off a polling loop, handler execution with panic and timeout
//! isolation, retry scheduling with backoff, cancellation, manual retry,
//! queries, aggregate stats, and periodic cleanup of old terminal records.
//!
//! The service is constructed with its collaborators (store, event bus,
//! config) injected, so embedders can run several isolated instances and
//! tests never share state.

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use metrics::{counter, gauge};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::watch;

use super::job::{Job, JobContext, JobHandler, JobId, JobKind, JobOptions, JobPriority};
use super::store::{JobFilter, JobStore, StatusCounts};
use crate::bus::{BusEvent, EventBus, JobEvent};
use crate::config::JobServiceConfig;
use crate::{ForemanError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Aggregate Views
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse queue health classification derived from configured thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy,
    Warning,
    Critical,
}

/// Aggregate job statistics for dashboards.
#[derive(Debug, Clone)]
pub struct JobStats {
    pub counts: StatusCounts,
    /// Jobs waiting to run (`queued` plus `retry`)
    pub queue_depth: u64,
    /// failed / (completed + failed); zero when nothing has finished
    pub error_rate: f64,
    pub health: QueueHealth,
}

/// Per-kind queue summary.
#[derive(Debug, Clone)]
pub struct QueueSnapshot {
    pub kind: JobKind,
    pub name: &'static str,
    pub priority: JobPriority,
    pub max_concurrency: usize,
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service Handle
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a started service's background loop.
///
/// Dropping the handle does not stop the loop; call [`shutdown`](Self::shutdown)
/// for a graceful stop. In-flight jobs run to completion; only polling stops.
pub struct ServiceHandle {
    shutdown: watch::Sender<bool>,
}

impl ServiceHandle {
    /// Signal the dispatch and cleanup loop to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Asynchronous job queue with retry, priority dispatch, and cleanup.
pub struct BackgroundJobService {
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
    config: JobServiceConfig,
    handlers: RwLock<HashMap<JobKind, Arc<dyn JobHandler>>>,
    /// Jobs currently executing; doubles as the concurrency gauge and the
    /// live copy handlers report progress against
    active: Arc<DashMap<JobId, Job>>,
    shutdown: watch::Sender<bool>,
}

impl BackgroundJobService {
    pub fn new(store: Arc<dyn JobStore>, bus: Arc<EventBus>, config: JobServiceConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            bus,
            config,
            handlers: RwLock::new(HashMap::new()),
            active: Arc::new(DashMap::new()),
            shutdown,
        }
    }

    /// Register the handler for a job kind.
    ///
    /// Registering a second handler for the same kind replaces the first and
    /// logs a warning; submissions after the call run the new handler.
    pub fn register_handler(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        let previous = self.handlers.write().insert(kind, handler);
        if previous.is_some() {
            tracing::warn!(kind = %kind, "Replacing previously registered job handler");
        } else {
            tracing::info!(kind = %kind, "Registered job handler");
        }
    }

    /// Submit a job for asynchronous execution.
    ///
    /// Validates that a handler is registered for `kind` and that attribution
    /// fields are present, persists the record, and returns its ID without
    /// waiting for execution.
    pub async fn queue_job(
        &self,
        kind: JobKind,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId> {
        if !self.handlers.read().contains_key(&kind) {
            return Err(ForemanError::unknown_job_kind(kind.as_str()));
        }
        if options.source_module.trim().is_empty() {
            return Err(ForemanError::missing_field("source_module"));
        }
        if options.created_by.trim().is_empty() {
            return Err(ForemanError::missing_field("created_by"));
        }

        let job = Job::new(kind, name, payload, options);
        let id = job.id;
        self.store.store_job(&job).await?;

        counter!("foreman_jobs_queued_total", "kind" => kind.as_str()).increment(1);
        tracing::info!(
            job_id = %id,
            kind = %kind,
            priority = ?job.priority,
            source_module = %job.source_module,
            "Job queued"
        );

        self.bus.emit(BusEvent::JobQueued(Self::job_event(&job)));
        Ok(id)
    }

    /// Start the dispatch and cleanup loop.
    pub fn start(self: &Arc<Self>) -> ServiceHandle {
        let service = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let poll_interval = self.config.poll_interval;
        let cleanup_interval = self.config.cleanup_interval;

        tokio::spawn(async move {
            let mut poll = tokio::time::interval(poll_interval);
            poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut cleanup = tokio::time::interval(cleanup_interval);
            cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; consume it so the
            // sweep only runs after a full cleanup_interval.
            cleanup.tick().await;

            tracing::info!(
                poll_interval = ?poll_interval,
                max_concurrent = service.config.max_concurrent_jobs,
                "Background job service started"
            );

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            tracing::info!("Background job service shutting down");
                            break;
                        }
                    }
                    _ = poll.tick() => {
                        if let Err(e) = service.dispatch_once().await {
                            e.log();
                        }
                    }
                    _ = cleanup.tick() => {
                        service.run_cleanup().await;
                    }
                }
            }
        });

        ServiceHandle {
            shutdown: self.shutdown.clone(),
        }
    }

    /// Run one dispatch round: claim eligible jobs up to spare capacity and
    /// spawn their handlers. Returns the number of jobs dispatched.
    ///
    /// Exposed so embedders and tests can drive dispatch deterministically
    /// instead of waiting for the polling loop.
    pub async fn dispatch_once(self: &Arc<Self>) -> Result<usize> {
        let capacity = self
            .config
            .max_concurrent_jobs
            .saturating_sub(self.active.len());
        if capacity == 0 {
            return Ok(0);
        }

        let eligible = self.store.eligible(Utc::now(), capacity).await?;
        let mut dispatched = 0;

        for candidate in eligible {
            // The claim is the authority: a job cancelled (or picked up by a
            // sibling worker) between the poll and this point comes back None
            // and is skipped.
            let claimed = match self.store.claim_for_processing(candidate.id).await? {
                Some(job) => job,
                None => continue,
            };

            self.active.insert(claimed.id, claimed.clone());
            gauge!("foreman_jobs_active").set(self.active.len() as f64);
            self.bus.emit(BusEvent::JobStarted(Self::job_event(&claimed)));

            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.run_job(claimed).await;
            });
            dispatched += 1;
        }

        Ok(dispatched)
    }

    /// Execute one claimed job and apply the outcome.
    async fn run_job(self: Arc<Self>, job: Job) {
        let handler = self.handlers.read().get(&job.kind).cloned();
        let outcome = match handler {
            Some(handler) => {
                let ctx = JobContext::new(&job, Arc::clone(&self.active), Arc::clone(&self.store));
                let execution = async {
                    match job.timeout {
                        Some(timeout) => match tokio::time::timeout(timeout, handler.execute(&ctx)).await {
                            Ok(result) => result,
                            Err(_) => Err(super::job::HandlerError::retryable(format!(
                                "execution exceeded timeout of {:?}",
                                timeout
                            ))),
                        },
                        None => handler.execute(&ctx).await,
                    }
                };

                match AssertUnwindSafe(execution).catch_unwind().await {
                    Ok(result) => result,
                    Err(panic) => {
                        let detail = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "handler panicked".to_string());
                        Err(super::job::HandlerError::fatal(format!(
                            "handler panicked: {}",
                            detail
                        )))
                    }
                }
            }
            // A handler existed at enqueue time; the registry only grows.
            None => Err(super::job::HandlerError::fatal(format!(
                "no handler registered for kind: {}",
                job.kind
            ))),
        };

        // Pick up the freshest copy: the handler may have written progress
        // and log entries to the active map during execution.
        let mut job = self
            .active
            .get(&job.id)
            .map(|entry| entry.clone())
            .unwrap_or(job);

        match outcome {
            Ok(result) => {
                job.mark_completed(result);
                counter!("foreman_jobs_completed_total", "kind" => job.kind.as_str()).increment(1);
                tracing::info!(job_id = %job.id, kind = %job.kind, "Job completed");
                if let Err(e) = self.store.update_job(&job).await {
                    e.log();
                }
                self.bus.emit(BusEvent::JobCompleted(Self::job_event(&job)));
            }
            Err(error) if error.retryable && job.retries_remaining() => {
                let attempt = job.retry_count + 1;
                let delay = self.config.backoff.delay_for_attempt(attempt);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                job.mark_retry(error.message.clone(), next_retry_at);
                counter!("foreman_jobs_retried_total", "kind" => job.kind.as_str()).increment(1);
                tracing::warn!(
                    job_id = %job.id,
                    kind = %job.kind,
                    retry_count = job.retry_count,
                    next_retry_at = %next_retry_at,
                    error = %error,
                    "Job failed, scheduling retry"
                );
                if let Err(e) = self.store.update_job(&job).await {
                    e.log();
                }
            }
            Err(error) => {
                job.mark_failed(error.message.clone());
                counter!("foreman_jobs_failed_total", "kind" => job.kind.as_str()).increment(1);
                tracing::error!(
                    job_id = %job.id,
                    kind = %job.kind,
                    retry_count = job.retry_count,
                    error = %error,
                    "Job failed permanently"
                );
                if let Err(e) = self.store.update_job(&job).await {
                    e.log();
                }
                self.bus.emit(BusEvent::JobFailed(Self::job_event(&job)));
            }
        }

        self.active.remove(&job.id);
        gauge!("foreman_jobs_active").set(self.active.len() as f64);
    }

    /// Purge terminal jobs past the retention window.
    async fn run_cleanup(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention)
                .unwrap_or_else(|_| chrono::Duration::days(7));
        match self.store.purge_terminal_before(cutoff).await {
            Ok(purged) if purged > 0 => {
                counter!("foreman_jobs_purged_total").increment(purged as u64);
                tracing::info!(purged, "Purged old terminal jobs");
            }
            Ok(_) => {}
            Err(e) => e.log(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Fetch a job by ID. Running jobs come from the live copy, so progress
    /// and log entries reported mid-execution are visible.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        if let Some(entry) = self.active.get(&id) {
            return Ok(Some(entry.clone()));
        }
        self.store.load_job(id).await
    }

    /// Query jobs with filtering and pagination. Returns the page and the
    /// total number of matches.
    pub async fn query_jobs(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize)> {
        self.store.query(filter).await
    }

    /// Aggregate statistics, optionally scoped to one tenant.
    pub async fn get_job_stats(&self, company_id: Option<&str>) -> Result<JobStats> {
        let counts = self.store.status_counts(company_id).await?;
        let queue_depth = counts.queued + counts.retry;
        let finished = counts.completed + counts.failed;
        let error_rate = if finished == 0 {
            0.0
        } else {
            counts.failed as f64 / finished as f64
        };

        let health = if queue_depth >= self.config.queue_depth_critical
            || error_rate >= self.config.error_rate_critical
        {
            QueueHealth::Critical
        } else if queue_depth >= self.config.queue_depth_warning
            || error_rate >= self.config.error_rate_warning
        {
            QueueHealth::Warning
        } else {
            QueueHealth::Healthy
        };

        Ok(JobStats {
            counts,
            queue_depth,
            error_rate,
            health,
        })
    }

    /// Per-kind queue summaries for dashboards.
    pub async fn get_queues(&self) -> Result<Vec<QueueSnapshot>> {
        let by_kind = self.store.counts_by_kind().await?;
        Ok(by_kind
            .into_iter()
            .map(|(kind, counts)| QueueSnapshot {
                kind,
                name: kind.display_name(),
                priority: kind.default_priority(),
                max_concurrency: self.config.max_concurrent_jobs,
                queued: counts.queued + counts.retry,
                processing: counts.processing,
                completed: counts.completed,
                failed: counts.failed,
            })
            .collect())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation and Manual Retry
    // ─────────────────────────────────────────────────────────────────────────

    /// Cancel a pending job.
    ///
    /// Returns `true` if the job was cancelled and `false` if it had already
    /// started or finished. Cancellation never interrupts a running handler.
    pub async fn cancel_job(&self, id: JobId) -> Result<bool> {
        match self.store.cancel_if_pending(id).await? {
            Some(job) => {
                counter!("foreman_jobs_cancelled_total", "kind" => job.kind.as_str()).increment(1);
                tracing::info!(job_id = %id, kind = %job.kind, "Job cancelled");
                self.bus.emit(BusEvent::JobCancelled(Self::job_event(&job)));
                Ok(true)
            }
            None => match self.store.load_job(id).await? {
                Some(job) => {
                    tracing::debug!(job_id = %id, status = %job.status, "Cancellation refused");
                    Ok(false)
                }
                None => Err(ForemanError::not_found("job", id.to_string())),
            },
        }
    }

    /// Re-queue a failed job for another attempt.
    ///
    /// Returns `true` if the job was re-queued and `false` if it was not in
    /// the `failed` state.
    pub async fn retry_job(&self, id: JobId) -> Result<bool> {
        match self.store.reset_failed(id).await? {
            Some(job) => {
                counter!("foreman_jobs_requeued_total", "kind" => job.kind.as_str()).increment(1);
                tracing::info!(job_id = %id, kind = %job.kind, "Failed job re-queued");
                self.bus.emit(BusEvent::JobQueued(Self::job_event(&job)));
                Ok(true)
            }
            None => match self.store.load_job(id).await? {
                Some(_) => Ok(false),
                None => Err(ForemanError::not_found("job", id.to_string())),
            },
        }
    }

    /// Number of jobs currently executing.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    fn job_event(job: &Job) -> JobEvent {
        JobEvent {
            job_id: job.id,
            kind: job.kind,
            source_module: job.source_module.clone(),
            company_id: job.company_id.clone(),
            error: job.error.clone(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
