//! Job persistence.
//!
//! [`JobStore`] is the seam between the job service and its storage; the
//! in-memory backend backs tests and single-process deployments, and a
//! database-backed implementation can slot in without touching the service.
//!
//! The status-changing operations (`claim_for_processing`, `cancel_if_pending`,
//! `reset_failed`) are compare-and-set: they apply the transition only if the
//! job is still in an expected state, so two workers (or a worker racing a
//! cancellation) can never both win.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::job::{Job, JobId, JobKind, JobStatus};
use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════════
// Query Types
// ═══════════════════════════════════════════════════════════════════════════════

/// Filter for job queries. All criteria are conjunctive; `None` means
/// unconstrained.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub company_id: Option<String>,
    pub source_module: Option<String>,
    /// Page size; `None` returns everything after `offset`
    pub limit: Option<usize>,
    pub offset: usize,
}

impl JobFilter {
    fn matches(&self, job: &Job) -> bool {
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if job.kind != kind {
                return false;
            }
        }
        if let Some(company_id) = &self.company_id {
            if job.company_id.as_deref() != Some(company_id.as_str()) {
                return false;
            }
        }
        if let Some(source_module) = &self.source_module {
            if &job.source_module != source_module {
                return false;
            }
        }
        true
    }
}

/// Per-status job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub queued: u64,
    pub processing: u64,
    pub retry: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

impl StatusCounts {
    fn record(&mut self, status: JobStatus) {
        match status {
            JobStatus::Queued => self.queued += 1,
            JobStatus::Processing => self.processing += 1,
            JobStatus::Retry => self.retry += 1,
            JobStatus::Completed => self.completed += 1,
            JobStatus::Failed => self.failed += 1,
            JobStatus::Cancelled => self.cancelled += 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage backend for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a newly submitted job.
    async fn store_job(&self, job: &Job) -> Result<()>;

    /// Overwrite an existing job record.
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Load a job by ID.
    async fn load_job(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically move a pending job (`queued` or `retry`) to `processing`
    /// and return the claimed record. Returns `None` if the job is missing or
    /// no longer pending, in which case the caller must not run it.
    async fn claim_for_processing(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically cancel a job if it is still pending (`queued` or `retry`).
    /// Returns the cancelled record, or `None` if the job is missing or has
    /// already progressed.
    async fn cancel_if_pending(&self, id: JobId) -> Result<Option<Job>>;

    /// Atomically re-queue a `failed` job for a manual retry. Returns the
    /// reset record, or `None` if the job is missing or not failed.
    async fn reset_failed(&self, id: JobId) -> Result<Option<Job>>;

    /// Query jobs, newest first. Returns the page and the total number of
    /// matches before pagination.
    async fn query(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize)>;

    /// Jobs eligible for dispatch at `now`, ordered by priority (highest
    /// first) then submission time (oldest first), capped at `limit`.
    async fn eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>>;

    /// Delete terminal jobs whose `completed_at` precedes `cutoff`. Returns
    /// the number removed.
    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Per-status counts, optionally scoped to one tenant.
    async fn status_counts(&self, company_id: Option<&str>) -> Result<StatusCounts>;

    /// Per-status counts broken down by job kind.
    async fn counts_by_kind(&self) -> Result<Vec<(JobKind, StatusCounts)>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// In-memory job store.
///
/// CAS semantics come from mutating under the shard lock of the entry; each
/// transition checks the current status before applying it.
#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn transition<F>(&self, id: JobId, guard: impl Fn(JobStatus) -> bool, apply: F) -> Option<Job>
    where
        F: FnOnce(&mut Job),
    {
        let mut entry = self.jobs.get_mut(&id)?;
        if !guard(entry.status) {
            return None;
        }
        apply(&mut entry);
        Some(entry.clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn store_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.jobs.get(&id).map(|entry| entry.clone()))
    }

    async fn claim_for_processing(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.transition(
            id,
            |status| matches!(status, JobStatus::Queued | JobStatus::Retry),
            |job| job.mark_processing(),
        ))
    }

    async fn cancel_if_pending(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.transition(id, |status| status.can_cancel(), |job| job.mark_cancelled()))
    }

    async fn reset_failed(&self, id: JobId) -> Result<Option<Job>> {
        Ok(self.transition(
            id,
            |status| status.can_retry(),
            |job| job.reset_for_manual_retry(),
        ))
    }

    async fn query(&self, filter: &JobFilter) -> Result<(Vec<Job>, usize)> {
        let mut matches: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.clone())
            .collect();

        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let total = matches.len();

        let page: Vec<Job> = matches
            .into_iter()
            .skip(filter.offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();

        Ok((page, total))
    }

    async fn eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>> {
        let mut candidates: Vec<Job> = self
            .jobs
            .iter()
            .filter(|entry| entry.is_eligible(now))
            .map(|entry| entry.clone())
            .collect();

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        candidates.truncate(limit);

        Ok(candidates)
    }

    async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| {
            !(job.status.is_terminal() && job.completed_at.map(|at| at < cutoff).unwrap_or(false))
        });
        Ok(before - self.jobs.len())
    }

    async fn status_counts(&self, company_id: Option<&str>) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for entry in self.jobs.iter() {
            if let Some(company) = company_id {
                if entry.company_id.as_deref() != Some(company) {
                    continue;
                }
            }
            counts.record(entry.status);
        }
        Ok(counts)
    }

    async fn counts_by_kind(&self) -> Result<Vec<(JobKind, StatusCounts)>> {
        let mut by_kind: Vec<(JobKind, StatusCounts)> = JobKind::ALL
            .iter()
            .map(|kind| (*kind, StatusCounts::default()))
            .collect();

        for entry in self.jobs.iter() {
            if let Some((_, counts)) = by_kind.iter_mut().find(|(kind, _)| *kind == entry.kind) {
                counts.record(entry.status);
            }
        }

        Ok(by_kind)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{JobOptions, JobPriority};

    fn job(kind: JobKind, company: Option<&str>) -> Job {
        let mut options = JobOptions::new("test", "tester");
        if let Some(company) = company {
            options = options.with_company(company);
        }
        Job::new(kind, "test job", serde_json::Value::Null, options)
    }

    #[tokio::test]
    async fn test_store_and_load() {
        let store = InMemoryJobStore::new();
        let j = job(JobKind::DataSync, None);
        store.store_job(&j).await.unwrap();

        let loaded = store.load_job(j.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, j.id);
        assert_eq!(loaded.status, JobStatus::Queued);

        assert!(store.load_job(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = InMemoryJobStore::new();
        let j = job(JobKind::DataSync, None);
        store.store_job(&j).await.unwrap();

        let claimed = store.claim_for_processing(j.id).await.unwrap();
        assert_eq!(claimed.unwrap().status, JobStatus::Processing);

        // Second claim loses: the job is no longer pending.
        assert!(store.claim_for_processing(j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_races_with_claim() {
        let store = InMemoryJobStore::new();
        let j = job(JobKind::DataSync, None);
        store.store_job(&j).await.unwrap();

        let cancelled = store.cancel_if_pending(j.id).await.unwrap();
        assert_eq!(cancelled.unwrap().status, JobStatus::Cancelled);

        // The worker that polled this job before the cancellation must lose
        // its claim.
        assert!(store.claim_for_processing(j.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_reset_failed_only_applies_to_failed() {
        let store = InMemoryJobStore::new();
        let mut j = job(JobKind::DataSync, None);
        store.store_job(&j).await.unwrap();

        assert!(store.reset_failed(j.id).await.unwrap().is_none());

        j.mark_processing();
        j.mark_failed("boom");
        store.update_job(&j).await.unwrap();

        let reset = store.reset_failed(j.id).await.unwrap().unwrap();
        assert_eq!(reset.status, JobStatus::Queued);
        assert_eq!(reset.retry_count, 1);
        assert!(reset.error.is_none());
    }

    #[tokio::test]
    async fn test_query_filters_and_paginates() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            let company = if i % 2 == 0 { Some("acme") } else { Some("globex") };
            store.store_job(&job(JobKind::DataSync, company)).await.unwrap();
        }
        store
            .store_job(&job(JobKind::ReportGeneration, Some("acme")))
            .await
            .unwrap();

        let (all, total) = store.query(&JobFilter::default()).await.unwrap();
        assert_eq!(total, 6);
        assert_eq!(all.len(), 6);

        let (acme, acme_total) = store
            .query(&JobFilter {
                company_id: Some("acme".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(acme_total, 4);
        assert!(acme.iter().all(|j| j.company_id.as_deref() == Some("acme")));

        let (page, page_total) = store
            .query(&JobFilter {
                limit: Some(2),
                offset: 4,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page_total, 6);
        assert_eq!(page.len(), 2);
    }

    #[tokio::test]
    async fn test_eligible_orders_by_priority_then_age() {
        let store = InMemoryJobStore::new();

        let low = Job::new(
            JobKind::EmailBatch,
            "low",
            serde_json::Value::Null,
            JobOptions::new("test", "tester").with_priority(JobPriority::Low),
        );
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let critical = Job::new(
            JobKind::PayrollRun,
            "critical",
            serde_json::Value::Null,
            JobOptions::new("test", "tester").with_priority(JobPriority::Critical),
        );
        store.store_job(&low).await.unwrap();
        store.store_job(&critical).await.unwrap();

        let eligible = store.eligible(Utc::now(), 10).await.unwrap();
        assert_eq!(eligible[0].id, critical.id);
        assert_eq!(eligible[1].id, low.id);

        let capped = store.eligible(Utc::now(), 1).await.unwrap();
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].id, critical.id);
    }

    #[tokio::test]
    async fn test_eligible_skips_delayed_and_terminal() {
        let store = InMemoryJobStore::new();

        let delayed = Job::new(
            JobKind::DataSync,
            "delayed",
            serde_json::Value::Null,
            JobOptions::new("test", "tester").with_delay(std::time::Duration::from_secs(3600)),
        );
        let mut done = job(JobKind::DataSync, None);
        done.mark_processing();
        done.mark_completed(serde_json::Value::Null);

        store.store_job(&delayed).await.unwrap();
        store.store_job(&done).await.unwrap();

        assert!(store.eligible(Utc::now(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_purge_removes_only_old_terminal_jobs() {
        let store = InMemoryJobStore::new();

        let mut old_done = job(JobKind::DataSync, None);
        old_done.mark_processing();
        old_done.mark_completed(serde_json::Value::Null);
        old_done.completed_at = Some(Utc::now() - chrono::Duration::days(10));

        let mut fresh_done = job(JobKind::DataSync, None);
        fresh_done.mark_processing();
        fresh_done.mark_completed(serde_json::Value::Null);

        let pending = job(JobKind::DataSync, None);

        store.store_job(&old_done).await.unwrap();
        store.store_job(&fresh_done).await.unwrap();
        store.store_job(&pending).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let purged = store.purge_terminal_before(cutoff).await.unwrap();
        assert_eq!(purged, 1);
        assert!(store.load_job(old_done.id).await.unwrap().is_none());
        assert!(store.load_job(fresh_done.id).await.unwrap().is_some());
        assert!(store.load_job(pending.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_status_counts_scoped_by_company() {
        let store = InMemoryJobStore::new();
        store.store_job(&job(JobKind::DataSync, Some("acme"))).await.unwrap();
        store.store_job(&job(JobKind::DataSync, Some("acme"))).await.unwrap();
        store.store_job(&job(JobKind::DataSync, Some("globex"))).await.unwrap();

        let all = store.status_counts(None).await.unwrap();
        assert_eq!(all.queued, 3);

        let acme = store.status_counts(Some("acme")).await.unwrap();
        assert_eq!(acme.queued, 2);
    }
}
