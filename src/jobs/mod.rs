//! Asynchronous background job processing.
//!
//! Feature modules submit work through
//! [`BackgroundJobService::queue_job`] and get a [`JobId`] back immediately;
//! a polling dispatch loop claims eligible jobs under a concurrency cap,
//! runs the handler registered for each kind, and applies retry with backoff
//! on transient failures.

pub mod builtin;
pub mod job;
pub mod service;
pub mod store;

pub use builtin::{EmailBatchHandler, EmailBatchPayload};
pub use job::{
    BackoffStrategy, HandlerError, Job, JobContext, JobHandler, JobId, JobKind, JobLogEntry,
    JobLogLevel, JobOptions, JobPriority, JobProgress, JobResult, JobStatus,
};
pub use service::{BackgroundJobService, JobStats, QueueHealth, QueueSnapshot, ServiceHandle};
pub use store::{InMemoryJobStore, JobFilter, JobStore, StatusCounts};
