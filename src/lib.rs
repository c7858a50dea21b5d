//! # Foreman
//!
//! Background job queue and notification dispatch core for workforce-management
//! services.
//!
//! ## Architecture
//!
//! - **Jobs**: submission, capacity-bounded dispatch, retry with exponential
//!   backoff, cancellation, and cleanup of old terminal records
//! - **Notifications**: multi-channel message composition and delivery with
//!   per-recipient preferences, templates, and delivery-status tracking
//! - **EventBus**: synchronous in-process pub/sub decoupling the services from
//!   their consumers (dashboards, providers, each other)
//! - **Telemetry**: structured logging with contact-info redaction
//!
//! Feature modules (payroll runs, report generation, data sync, onboarding)
//! enqueue work through [`jobs::BackgroundJobService::queue_job`] and alert
//! users through [`notify::NotificationService::publish`]; neither call blocks
//! on the work itself.

pub mod bus;
pub mod config;
pub mod error;
pub mod jobs;
pub mod notify;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorSeverity, ForemanError, Result};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::bus::{BusEvent, DeliveryEvent, EventBus, EventKind, JobEvent, SubscriberId};
    pub use crate::config::{Config, JobServiceConfig, NotificationConfig};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorSeverity, ForemanError, Result};
    pub use crate::jobs::{
        BackgroundJobService, BackoffStrategy, HandlerError, Job, JobContext, JobFilter,
        JobHandler, JobId, JobKind, JobOptions, JobPriority, JobResult, JobStats, JobStatus,
        JobStore, InMemoryJobStore, QueueHealth, QueueSnapshot, ServiceHandle,
    };
    pub use crate::notify::{
        Channel, ChannelTransport, DeliveryStats, DeliveryStatus, NotificationDraft,
        NotificationId, NotificationKind, NotificationMessage, NotificationService,
        NotificationTemplate, Recipient, RecipientResolver, SendOptions, TemplateRegistry,
    };
}
