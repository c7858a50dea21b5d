//! Job definitions: records, status state machine, options, and the
//! handler trait.
//!
//! - **Job**: the durable record of a unit of asynchronous work
//! - **JobStatus**: enumeration of possible job states
//! - **JobHandler**: the interface feature modules implement per job kind
//! - **JobContext**: execution context with progress reporting and job-scoped
//!   logging
//! - **BackoffStrategy**: retry delay calculation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::store::JobStore;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub uuid::Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Kind
// ═══════════════════════════════════════════════════════════════════════════════

/// The closed set of supported job kinds.
///
/// Each kind maps to exactly one registered handler; submissions for a kind
/// with no handler are rejected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Payroll calculation run for a pay period
    PayrollRun,
    /// Report generation (compliance, headcount, custom)
    ReportGeneration,
    /// Synchronization with an external system (benefits, time clock)
    DataSync,
    /// Batched outbound email (digests, reminders, announcements)
    EmailBatch,
    /// Account/equipment provisioning for a new hire
    OnboardingProvision,
    /// Scan for expiring certifications and documents
    ComplianceScan,
    /// Training assignment due-date reminders
    TrainingReminder,
}

impl JobKind {
    /// All supported kinds, for aggregate views.
    pub const ALL: [JobKind; 7] = [
        Self::PayrollRun,
        Self::ReportGeneration,
        Self::DataSync,
        Self::EmailBatch,
        Self::OnboardingProvision,
        Self::ComplianceScan,
        Self::TrainingReminder,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PayrollRun => "payroll_run",
            Self::ReportGeneration => "report_generation",
            Self::DataSync => "data_sync",
            Self::EmailBatch => "email_batch",
            Self::OnboardingProvision => "onboarding_provision",
            Self::ComplianceScan => "compliance_scan",
            Self::TrainingReminder => "training_reminder",
        }
    }

    /// Human label for queue aggregate views.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PayrollRun => "Payroll runs",
            Self::ReportGeneration => "Report generation",
            Self::DataSync => "Data synchronization",
            Self::EmailBatch => "Email batches",
            Self::OnboardingProvision => "Onboarding provisioning",
            Self::ComplianceScan => "Compliance scans",
            Self::TrainingReminder => "Training reminders",
        }
    }

    /// Priority class a kind defaults to when the submitter does not set one.
    pub fn default_priority(&self) -> JobPriority {
        match self {
            Self::PayrollRun => JobPriority::Critical,
            Self::OnboardingProvision => JobPriority::High,
            Self::DataSync | Self::ComplianceScan => JobPriority::Normal,
            Self::ReportGeneration | Self::EmailBatch | Self::TrainingReminder => JobPriority::Low,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for dispatch (possibly deferred by a submission delay)
    Queued,
    /// Currently executing under the concurrency cap
    Processing,
    /// Failed with retries remaining; eligible again once `next_retry_at`
    /// elapses
    Retry,
    /// Handler resolved successfully
    Completed,
    /// Retries exhausted; terminal unless manually retried
    Failed,
    /// Cancelled before dispatch
    Cancelled,
}

impl JobStatus {
    /// Check if no further automatic transition occurs from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if a cancellation request can take effect.
    pub fn can_cancel(&self) -> bool {
        matches!(self, Self::Queued | Self::Retry)
    }

    /// Check if the job can be manually re-queued.
    pub fn can_retry(&self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queued => write!(f, "queued"),
            Self::Processing => write!(f, "processing"),
            Self::Retry => write!(f, "retry"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Priority
// ═══════════════════════════════════════════════════════════════════════════════

/// Priority level for jobs.
///
/// Used as a dispatch tiebreaker: when more jobs are eligible than capacity
/// allows in a tick, higher priority goes first, then older `created_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low = 0,
    Normal = 1,
    High = 2,
    Critical = 3,
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::Normal
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed { delay_secs: u64 },
    /// Exponential increase (base * multiplier^(attempt-1)), capped
    Exponential {
        base_secs: u64,
        multiplier: f64,
        max_delay_secs: u64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        // Doubling from two minutes: attempts wait 2, 4, 8, ... minutes.
        Self::Exponential {
            base_secs: 120,
            multiplier: 2.0,
            max_delay_secs: 86400,
        }
    }
}

impl BackoffStrategy {
    /// Calculate the delay before a given retry attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Exponential {
                base_secs,
                multiplier,
                max_delay_secs,
            } => {
                let exponent = attempt.saturating_sub(1);
                let delay = (*base_secs as f64) * multiplier.powi(exponent as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
        };

        Duration::from_secs(secs)
    }

    /// Create a fixed backoff strategy.
    pub fn fixed(delay_secs: u64) -> Self {
        Self::Fixed { delay_secs }
    }

    /// A zero-delay strategy, useful in tests.
    pub fn none() -> Self {
        Self::Fixed { delay_secs: 0 }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Submission options for [`queue_job`](super::BackgroundJobService::queue_job).
///
/// `source_module` and `created_by` are required for attribution; everything
/// else has sensible defaults.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Which feature module submitted the job
    pub source_module: String,
    /// User (or system principal) the submission is attributed to
    pub created_by: String,
    /// Tenant scope, if any
    pub company_id: Option<String>,
    /// Dispatch tiebreaker; defaults to the kind's priority class
    pub priority: Option<JobPriority>,
    /// Delay before the job becomes eligible to run
    pub delay: Option<Duration>,
    /// Maximum automatic retry attempts after the first failure
    pub retry_attempts: u32,
    /// Per-attempt execution timeout
    pub timeout: Option<Duration>,
    /// Free-form description shown in dashboards
    pub description: Option<String>,
}

impl JobOptions {
    pub fn new(source_module: impl Into<String>, created_by: impl Into<String>) -> Self {
        Self {
            source_module: source_module.into(),
            created_by: created_by.into(),
            company_id: None,
            priority: None,
            delay: None,
            retry_attempts: 3,
            timeout: None,
            description: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_company(mut self, company_id: impl Into<String>) -> Self {
        self.company_id = Some(company_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Progress and Logs
// ═══════════════════════════════════════════════════════════════════════════════

/// Advisory progress reported by a running handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    /// Percentage (0-100), derived from current/total
    pub percent: u8,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl JobProgress {
    pub fn new(current: u64, total: u64, message: Option<String>) -> Self {
        let percent = if total == 0 {
            0
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        Self {
            current,
            total,
            percent,
            message,
            updated_at: Utc::now(),
        }
    }
}

/// Severity of a job log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobLogLevel {
    Info,
    Warn,
    Error,
}

/// A timestamped structured entry in a job's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub at: DateTime<Utc>,
    pub level: JobLogLevel,
    pub message: String,
}

impl JobLogEntry {
    pub fn new(level: JobLogLevel, message: impl Into<String>) -> Self {
        Self {
            at: Utc::now(),
            level,
            message: message.into(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// A unit of asynchronous, possibly retryable work.
///
/// Created by `queue_job`; mutated exclusively by the job processor (status,
/// timestamps, retry bookkeeping) and by the handler it invokes (progress,
/// result, logs). `completed_at` is set if and only if the status is
/// terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    /// Human label for the submission
    pub name: String,
    pub status: JobStatus,
    pub priority: JobPriority,
    /// Opaque payload interpreted only by the handler registered for `kind`
    pub payload: serde_json::Value,

    pub source_module: String,
    pub created_by: String,
    pub company_id: Option<String>,
    pub description: Option<String>,

    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be dispatched (created_at + submission delay)
    pub eligible_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub retry_count: u32,
    pub retry_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,

    pub progress: Option<JobProgress>,
    /// Opaque success payload returned by the handler
    pub result: Option<serde_json::Value>,
    /// Last failure reason, verbatim
    pub error: Option<String>,
    pub logs: Vec<JobLogEntry>,
}

impl Job {
    /// Create a new queued job from a submission.
    pub fn new(
        kind: JobKind,
        name: impl Into<String>,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Self {
        let now = Utc::now();
        let eligible_at = match options.delay {
            Some(delay) => {
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
            }
            None => now,
        };

        Self {
            id: JobId::new(),
            kind,
            name: name.into(),
            status: JobStatus::Queued,
            priority: options.priority.unwrap_or_else(|| kind.default_priority()),
            payload,
            source_module: options.source_module,
            created_by: options.created_by,
            company_id: options.company_id,
            description: options.description,
            created_at: now,
            eligible_at,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            retry_attempts: options.retry_attempts,
            next_retry_at: None,
            timeout: options.timeout,
            progress: None,
            result: None,
            error: None,
            logs: Vec::new(),
        }
    }

    /// Check if the job may be dispatched at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Queued => self.eligible_at <= now,
            JobStatus::Retry => self.next_retry_at.map(|at| at <= now).unwrap_or(true),
            _ => false,
        }
    }

    /// Check if automatic retries remain.
    pub fn retries_remaining(&self) -> bool {
        self.retry_count < self.retry_attempts
    }

    /// Mark as picked up for execution.
    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
    }

    /// Mark as completed with the handler's result.
    pub fn mark_completed(&mut self, result: serde_json::Value) {
        self.status = JobStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.result = Some(result);
        self.error = None;
        self.next_retry_at = None;
    }

    /// Mark as awaiting retry. Increments `retry_count` and records when the
    /// job becomes eligible again.
    pub fn mark_retry(&mut self, error: impl Into<String>, next_retry_at: DateTime<Utc>) {
        self.status = JobStatus::Retry;
        self.retry_count += 1;
        self.error = Some(error.into());
        self.next_retry_at = Some(next_retry_at);
    }

    /// Mark as failed with no further automatic retry.
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.into());
        self.next_retry_at = None;
    }

    /// Mark as cancelled.
    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.next_retry_at = None;
    }

    /// Reset a failed job for a manual retry: back to the queue, immediately
    /// eligible, with the failure bookkeeping cleared.
    pub fn reset_for_manual_retry(&mut self) {
        self.status = JobStatus::Queued;
        self.retry_count += 1;
        self.error = None;
        self.next_retry_at = None;
        self.completed_at = None;
        self.eligible_at = Utc::now();
    }

    /// Append a log entry.
    pub fn append_log(&mut self, level: JobLogLevel, message: impl Into<String>) {
        self.logs.push(JobLogEntry::new(level, message));
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Error returned by a job handler.
///
/// Retryable failures re-enter the queue under the backoff policy while
/// attempts remain; fatal failures go straight to `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerError {
    pub message: String,
    pub retryable: bool,
}

impl HandlerError {
    /// A transient failure that should be retried.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// A permanent failure that should not be retried.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<crate::ForemanError> for HandlerError {
    fn from(error: crate::ForemanError) -> Self {
        Self {
            message: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

/// Result type for handler execution.
pub type JobResult = std::result::Result<serde_json::Value, HandlerError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to handlers during execution.
///
/// Gives handlers access to the payload and lets them report progress and
/// append job-scoped log entries without touching the service internals.
pub struct JobContext {
    job_id: JobId,
    kind: JobKind,
    /// Execution attempt (1-indexed; retries increment it)
    attempt: u32,
    payload: serde_json::Value,
    active: Arc<DashMap<JobId, Job>>,
    store: Arc<dyn JobStore>,
}

impl JobContext {
    pub(crate) fn new(job: &Job, active: Arc<DashMap<JobId, Job>>, store: Arc<dyn JobStore>) -> Self {
        Self {
            job_id: job.id,
            kind: job.kind,
            attempt: job.retry_count + 1,
            payload: job.payload.clone(),
            active,
            store,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Deserialize the payload into a typed structure.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> std::result::Result<T, HandlerError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| HandlerError::fatal(format!("invalid payload: {}", e)))
    }

    /// Report progress. Advisory only; persisted best-effort.
    pub async fn report_progress(&self, current: u64, total: u64, message: Option<String>) {
        let progress = JobProgress::new(current, total, message);

        let snapshot = if let Some(mut entry) = self.active.get_mut(&self.job_id) {
            entry.progress = Some(progress);
            Some(entry.clone())
        } else {
            None
        };

        if let Some(job) = snapshot {
            if let Err(e) = self.store.update_job(&job).await {
                tracing::warn!(job_id = %self.job_id, error = %e, "Failed to persist job progress");
            }
        }
    }

    /// Log an informational message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, kind = %self.kind, attempt = self.attempt, message);
        self.append(JobLogLevel::Info, message);
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, kind = %self.kind, attempt = self.attempt, message);
        self.append(JobLogLevel::Warn, message);
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(job_id = %self.job_id, kind = %self.kind, attempt = self.attempt, message);
        self.append(JobLogLevel::Error, message);
    }

    fn append(&self, level: JobLogLevel, message: &str) {
        if let Some(mut entry) = self.active.get_mut(&self.job_id) {
            entry.append_log(level, message);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// The interface feature modules implement to process a job kind.
///
/// # Errors
///
/// Return [`HandlerError::retryable`] for transient failures that should
/// re-enter the queue under the backoff policy, and [`HandlerError::fatal`]
/// for permanent failures.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::new(
            JobKind::ReportGeneration,
            "Quarterly headcount",
            serde_json::json!({"quarter": "Q3"}),
            JobOptions::new("reports", "user-1"),
        )
    }

    #[test]
    fn test_job_status_classification() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Retry.is_terminal());

        assert!(JobStatus::Queued.can_cancel());
        assert!(JobStatus::Retry.can_cancel());
        assert!(!JobStatus::Processing.can_cancel());
        assert!(!JobStatus::Completed.can_cancel());

        assert!(JobStatus::Failed.can_retry());
        assert!(!JobStatus::Cancelled.can_retry());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::Critical > JobPriority::High);
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
    }

    #[test]
    fn test_default_backoff_doubles_from_two_minutes() {
        let backoff = BackoffStrategy::default();
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(120));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_secs(240));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_secs(480));
        // Capped at the configured maximum
        assert_eq!(backoff.delay_for_attempt(30), Duration::from_secs(86400));
    }

    #[test]
    fn test_fixed_backoff() {
        let backoff = BackoffStrategy::fixed(10);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.retry_attempts, 3);
        // ReportGeneration defaults to the Low priority class
        assert_eq!(job.priority, JobPriority::Low);
        assert!(job.is_eligible(Utc::now()));
        assert!(job.completed_at.is_none());
    }

    #[test]
    fn test_delay_defers_eligibility() {
        let job = Job::new(
            JobKind::DataSync,
            "Nightly benefits sync",
            serde_json::Value::Null,
            JobOptions::new("benefits", "system").with_delay(Duration::from_secs(3600)),
        );
        assert!(!job.is_eligible(Utc::now()));
        assert!(job.is_eligible(Utc::now() + chrono::Duration::hours(2)));
    }

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = sample_job();

        job.mark_processing();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        job.mark_retry("transient", Utc::now() + chrono::Duration::minutes(2));
        assert_eq!(job.status, JobStatus::Retry);
        assert_eq!(job.retry_count, 1);
        assert!(job.next_retry_at.is_some());
        assert!(!job.is_eligible(Utc::now()));

        job.mark_failed("gave up");
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.completed_at.is_some());
        assert_eq!(job.error.as_deref(), Some("gave up"));

        job.reset_for_manual_retry();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.retry_count, 2);
        assert!(job.error.is_none());
        assert!(job.completed_at.is_none());
        assert!(job.is_eligible(Utc::now()));
    }

    #[test]
    fn test_mark_completed_sets_terminal_bookkeeping() {
        let mut job = sample_job();
        job.mark_processing();
        job.mark_completed(serde_json::json!({"rows": 42}));
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
        assert!(job.error.is_none());
        assert_eq!(job.result, Some(serde_json::json!({"rows": 42})));
    }

    #[test]
    fn test_progress_percent() {
        let progress = JobProgress::new(3, 12, None);
        assert_eq!(progress.percent, 25);

        let done = JobProgress::new(12, 12, Some("done".to_string()));
        assert_eq!(done.percent, 100);

        let empty = JobProgress::new(0, 0, None);
        assert_eq!(empty.percent, 0);
    }

    #[test]
    fn test_handler_error_retryability() {
        assert!(HandlerError::retryable("timeout").retryable);
        assert!(!HandlerError::fatal("bad payload").retryable);

        let from_storage: HandlerError = crate::ForemanError::storage("io").into();
        assert!(from_storage.retryable);

        let from_validation: HandlerError = crate::ForemanError::validation("nope").into();
        assert!(!from_validation.retryable);
    }
}
