//! Built-in job handlers.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use super::job::{HandlerError, JobContext, JobHandler, JobResult};
use crate::notify::{Channel, NotificationService, SendOptions};

/// Payload for [`EmailBatchHandler`] jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailBatchPayload {
    pub user_ids: Vec<String>,
    pub title: String,
    pub body: String,
    /// Template to render from; the job metadata supplies placeholder values
    #[serde(default)]
    pub template_id: Option<String>,
}

/// Sends a batched email notification through the notification service.
///
/// Bridges the two subsystems: feature modules enqueue an `email_batch` job
/// instead of blocking on delivery, and the handler publishes one message to
/// all resolved recipients.
pub struct EmailBatchHandler {
    notifications: Arc<NotificationService>,
}

impl EmailBatchHandler {
    pub fn new(notifications: Arc<NotificationService>) -> Self {
        Self { notifications }
    }
}

#[async_trait]
impl JobHandler for EmailBatchHandler {
    async fn execute(&self, ctx: &JobContext) -> JobResult {
        let payload: EmailBatchPayload = ctx.payload_as()?;
        if payload.user_ids.is_empty() {
            return Err(HandlerError::fatal("email batch has no recipients"));
        }

        let total = payload.user_ids.len() as u64;
        ctx.report_progress(0, total, Some("resolving recipients".to_string()))
            .await;

        let mut options = SendOptions::new("jobs")
            .with_channels(vec![Channel::InApp, Channel::Email]);
        if let Some(template_id) = payload.template_id {
            options = options.with_template(template_id);
        }

        let message_id = self
            .notifications
            .send_to_users(&payload.user_ids, payload.title, payload.body, options)
            .await
            .map_err(|e| HandlerError {
                message: e.to_string(),
                retryable: e.is_retryable(),
            })?;

        ctx.report_progress(total, total, Some("batch submitted".to_string()))
            .await;
        ctx.log_info(&format!("email batch published as message {}", message_id));

        Ok(serde_json::json!({
            "message_id": message_id.to_string(),
            "recipients": total,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::config::{JobServiceConfig, NotificationConfig};
    use crate::jobs::service::BackgroundJobService;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::{JobKind, JobOptions, JobStatus};
    use crate::notify::{InMemoryDirectory, Recipient};

    #[tokio::test]
    async fn test_email_batch_publishes_to_resolved_users() {
        let bus = Arc::new(EventBus::new());
        let directory = Arc::new(InMemoryDirectory::new());
        directory.insert(Recipient::new("u1", "One"));
        directory.insert(Recipient::new("u2", "Two"));

        let notifications = Arc::new(NotificationService::new(
            bus.clone(),
            directory,
            NotificationConfig::default(),
        ));
        let service = Arc::new(BackgroundJobService::new(
            Arc::new(InMemoryJobStore::new()),
            bus,
            JobServiceConfig::default(),
        ));
        service.register_handler(
            JobKind::EmailBatch,
            Arc::new(EmailBatchHandler::new(notifications.clone())),
        );

        let id = service
            .queue_job(
                JobKind::EmailBatch,
                "weekly digest",
                serde_json::json!({
                    "user_ids": ["u1", "u2"],
                    "title": "Weekly digest",
                    "body": "Your week at a glance",
                }),
                JobOptions::new("digest", "system"),
            )
            .await
            .unwrap();

        service.dispatch_once().await.unwrap();

        for _ in 0..100 {
            let job = service.get_job(id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                assert_eq!(job.status, JobStatus::Completed);
                let result = job.result.unwrap();
                assert_eq!(result["recipients"], 2);
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("job never completed");
    }

    #[tokio::test]
    async fn test_email_batch_rejects_malformed_payload() {
        let bus = Arc::new(EventBus::new());
        let notifications = Arc::new(NotificationService::new(
            bus,
            Arc::new(InMemoryDirectory::new()),
            NotificationConfig::default(),
        ));
        let handler = EmailBatchHandler::new(notifications);

        let store: Arc<dyn crate::jobs::JobStore> = Arc::new(InMemoryJobStore::new());
        let job = crate::jobs::Job::new(
            JobKind::EmailBatch,
            "bad",
            serde_json::json!({"nope": true}),
            JobOptions::new("digest", "system"),
        );
        let ctx = JobContext::new(&job, Arc::new(dashmap::DashMap::new()), store);

        let err = handler.execute(&ctx).await.unwrap_err();
        assert!(!err.retryable);
    }
}
