//! Notification service.
//!
//! Composes messages (directly or from templates), delivers them across
//! channels honoring per-recipient preferences, tracks per-pair delivery
//! outcomes, and supports scheduled delivery and retry of failed messages.
//!
//! In-app delivery is synchronous: by the time [`publish`] returns, every
//! accepting recipient's `notification_delivered` event has been emitted on
//! the bus. External channels (email, SMS) are handed to transports on a
//! background task.
//!
//! [`publish`]: NotificationService::publish

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::message::{
    AttemptOutcome, Channel, DeliveryAttempt, DeliveryStatus, NotificationDraft, NotificationId,
    NotificationKind, NotificationMessage, Recipient,
};
use super::template::TemplateRegistry;
use super::transport::{ChannelTransport, RecipientResolver};
use crate::bus::{BusEvent, DeliveryEvent, EventBus, EventKind, SubscriberId};
use crate::config::NotificationConfig;
use crate::error::ErrorCode;
use crate::telemetry::redact;
use crate::{ForemanError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Options and Stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Options for [`NotificationService::send_to_users`].
#[derive(Debug, Clone)]
pub struct SendOptions {
    pub kind: NotificationKind,
    pub channels: Vec<Channel>,
    pub source_module: String,
    pub template_id: Option<String>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SendOptions {
    pub fn new(source_module: impl Into<String>) -> Self {
        Self {
            kind: NotificationKind::Info,
            channels: vec![Channel::InApp],
            source_module: source_module.into(),
            template_id: None,
            scheduled_at: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: NotificationKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_template(mut self, template_id: impl Into<String>) -> Self {
        self.template_id = Some(template_id.into());
        self
    }

    pub fn with_scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Aggregate delivery statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    /// Queued, sending, or awaiting retry
    pub pending: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Service
// ═══════════════════════════════════════════════════════════════════════════════

/// Multi-channel notification dispatch with delivery tracking.
pub struct NotificationService {
    bus: Arc<EventBus>,
    config: NotificationConfig,
    resolver: Arc<dyn RecipientResolver>,
    templates: TemplateRegistry,
    transports: RwLock<HashMap<Channel, Arc<dyn ChannelTransport>>>,
    messages: DashMap<NotificationId, NotificationMessage>,
}

impl NotificationService {
    pub fn new(
        bus: Arc<EventBus>,
        resolver: Arc<dyn RecipientResolver>,
        config: NotificationConfig,
    ) -> Self {
        Self {
            bus,
            config,
            resolver,
            templates: TemplateRegistry::new(),
            transports: RwLock::new(HashMap::new()),
            messages: DashMap::new(),
        }
    }

    /// Register the transport for an external channel, replacing any previous
    /// one.
    pub fn register_transport(&self, transport: Arc<dyn ChannelTransport>) {
        let channel = transport.channel();
        self.transports.write().insert(channel, transport);
        tracing::info!(channel = %channel, "Registered notification transport");
    }

    /// The template registry.
    pub fn templates(&self) -> &TemplateRegistry {
        &self.templates
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Publication
    // ─────────────────────────────────────────────────────────────────────────

    /// Publish a notification.
    ///
    /// Validates the draft, renders its template if one is set, delivers
    /// in-app pairs synchronously, and hands external pairs to a background
    /// task. Scheduled drafts are stored and delivered by
    /// [`process_due`](Self::process_due).
    pub async fn publish(self: &Arc<Self>, draft: NotificationDraft) -> Result<NotificationId> {
        if draft.channels.is_empty() {
            return Err(ForemanError::new(
                ErrorCode::NoChannels,
                "Notification has no delivery channels",
            ));
        }
        if draft.recipients.is_empty() {
            return Err(ForemanError::new(
                ErrorCode::NoRecipients,
                "Notification has no recipients",
            ));
        }

        let (title, body) = match &draft.template_id {
            Some(template_id) => {
                let template = self
                    .templates
                    .get(template_id)
                    .ok_or_else(|| ForemanError::template_not_found(template_id.clone()))?;
                if !template.active {
                    return Err(ForemanError::new(
                        ErrorCode::TemplateInactive,
                        format!("Notification template is inactive: {}", template_id),
                    )
                    .with_context("template_id", template_id.as_str()));
                }
                template.render(&Self::template_vars(&draft.metadata))
            }
            None => (draft.title.clone(), draft.body.clone()),
        };

        let message = NotificationMessage::from_draft(draft, title, body);
        let id = message.id;
        counter!("foreman_notifications_published_total").increment(1);

        if let Some(at) = message.scheduled_at {
            if at > Utc::now() {
                tracing::info!(message_id = %id, scheduled_at = %at, "Notification scheduled");
                self.messages.insert(id, message);
                return Ok(id);
            }
        }

        self.deliver_now(message);
        Ok(id)
    }

    /// Resolve user IDs through the directory and publish to them.
    ///
    /// Unknown user IDs are skipped with a warning and recorded in the
    /// message's metadata under `skipped_user_ids`; the operation fails only
    /// if no recipient resolves.
    pub async fn send_to_users(
        self: &Arc<Self>,
        user_ids: &[String],
        title: impl Into<String>,
        body: impl Into<String>,
        options: SendOptions,
    ) -> Result<NotificationId> {
        let mut recipients = Vec::new();
        let mut skipped = Vec::new();

        for user_id in user_ids {
            match self.resolver.resolve(user_id).await? {
                Some(recipient) => recipients.push(recipient),
                None => {
                    tracing::warn!(user_id = %user_id, "Recipient could not be resolved, skipping");
                    skipped.push(user_id.clone());
                }
            }
        }

        if recipients.is_empty() {
            return Err(ForemanError::new(
                ErrorCode::NoRecipients,
                "No recipients could be resolved",
            ));
        }

        let mut draft = NotificationDraft::new(title, body, options.source_module)
            .with_kind(options.kind)
            .with_channels(options.channels)
            .with_recipients(recipients);
        draft.template_id = options.template_id;
        draft.scheduled_at = options.scheduled_at;
        draft.metadata = options.metadata;
        if !skipped.is_empty() {
            draft
                .metadata
                .insert("skipped_user_ids".to_string(), serde_json::json!(skipped));
        }

        self.publish(draft).await
    }

    /// Deliver an immediate message: in-app synchronously, external spawned.
    fn deliver_now(self: &Arc<Self>, mut message: NotificationMessage) {
        let id = message.id;
        let mut events = Vec::new();

        for (recipient, channel) in message.pending_pairs() {
            if channel != Channel::InApp {
                continue;
            }
            if recipient.accepts_channel(Channel::InApp) {
                message.record_attempt(DeliveryAttempt::new(
                    &recipient.user_id,
                    channel,
                    AttemptOutcome::Sent,
                    None,
                ));
                events.push(self.delivery_event(&message, &recipient, channel));
                counter!("foreman_notifications_delivered_total", "channel" => "in_app")
                    .increment(1);
            } else {
                message.record_attempt(DeliveryAttempt::new(
                    &recipient.user_id,
                    channel,
                    AttemptOutcome::Skipped,
                    Some("channel not accepted".to_string()),
                ));
            }
        }

        let has_external = message
            .pending_pairs()
            .iter()
            .any(|(_, channel)| channel.is_external());
        message.status = if has_external {
            DeliveryStatus::Sending
        } else if message.has_failures() {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Delivered
        };

        self.messages.insert(id, message);
        for event in events {
            self.bus.emit(BusEvent::NotificationDelivered(event));
        }

        if has_external {
            let service = Arc::clone(self);
            tokio::spawn(async move {
                service.deliver_pending_external(id).await;
            });
        }
    }

    /// Run every pending external pair of a message through its transport and
    /// finalize the message status.
    async fn deliver_pending_external(&self, id: NotificationId) {
        let snapshot = match self.messages.get(&id) {
            Some(entry) => entry.clone(),
            None => return,
        };
        let pairs: Vec<(Recipient, Channel)> = snapshot
            .pending_pairs()
            .into_iter()
            .filter(|(_, channel)| channel.is_external())
            .collect();

        let mut attempts = Vec::new();
        let mut events = Vec::new();

        for (recipient, channel) in pairs {
            if !recipient.accepts_channel(channel) {
                attempts.push(DeliveryAttempt::new(
                    &recipient.user_id,
                    channel,
                    AttemptOutcome::Skipped,
                    Some("channel not accepted".to_string()),
                ));
                continue;
            }
            let contact = match recipient.contact_for(channel) {
                Some(contact) => contact.to_string(),
                None => {
                    attempts.push(DeliveryAttempt::new(
                        &recipient.user_id,
                        channel,
                        AttemptOutcome::Skipped,
                        Some("no contact address".to_string()),
                    ));
                    continue;
                }
            };

            let transport = self.transports.read().get(&channel).cloned();
            match transport {
                None => {
                    tracing::error!(channel = %channel, "No transport registered for channel");
                    attempts.push(DeliveryAttempt::new(
                        &recipient.user_id,
                        channel,
                        AttemptOutcome::Failed,
                        Some("no transport registered".to_string()),
                    ));
                }
                Some(transport) => match transport.send(&snapshot, &recipient).await {
                    Ok(()) => {
                        counter!("foreman_notifications_delivered_total", "channel" => channel.as_str())
                            .increment(1);
                        attempts.push(DeliveryAttempt::new(
                            &recipient.user_id,
                            channel,
                            AttemptOutcome::Sent,
                            None,
                        ));
                        events.push(self.delivery_event(&snapshot, &recipient, channel));
                    }
                    Err(e) => {
                        counter!("foreman_notifications_failed_total", "channel" => channel.as_str())
                            .increment(1);
                        tracing::warn!(
                            message_id = %id,
                            channel = %channel,
                            user_id = %recipient.user_id,
                            contact = %redact(&contact),
                            error = %e,
                            "Notification delivery failed"
                        );
                        attempts.push(DeliveryAttempt::new(
                            &recipient.user_id,
                            channel,
                            AttemptOutcome::Failed,
                            Some(e.to_string()),
                        ));
                    }
                },
            }
        }

        if let Some(mut entry) = self.messages.get_mut(&id) {
            for attempt in attempts {
                entry.record_attempt(attempt);
            }
            entry.status = if entry.has_failures() {
                DeliveryStatus::Failed
            } else {
                DeliveryStatus::Delivered
            };
        }

        for event in events {
            self.bus.emit(BusEvent::NotificationDelivered(event));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Scheduling and Retry
    // ─────────────────────────────────────────────────────────────────────────

    /// Deliver scheduled messages whose time has come. Returns the number
    /// moved into delivery.
    pub async fn process_due(self: &Arc<Self>) -> usize {
        let now = Utc::now();
        let due: Vec<NotificationId> = self
            .messages
            .iter()
            .filter(|entry| {
                entry.status == DeliveryStatus::Queued
                    && entry.scheduled_at.map(|at| at <= now).unwrap_or(true)
            })
            .map(|entry| entry.id)
            .collect();

        let count = due.len();
        for id in due {
            if let Some((_, message)) = self.messages.remove(&id) {
                tracing::info!(message_id = %id, "Delivering scheduled notification");
                self.deliver_now(message);
            }
        }
        count
    }

    /// Re-attempt delivery of failed messages that have retry passes left.
    ///
    /// Already-sent and skipped pairs keep their ledger entries, so a retry
    /// only re-attempts the pairs that actually failed. Returns the number of
    /// messages retried.
    pub async fn retry_failed_notifications(self: &Arc<Self>) -> usize {
        let candidates: Vec<NotificationId> = self
            .messages
            .iter()
            .filter(|entry| {
                entry.status == DeliveryStatus::Failed
                    && entry.retry_count < self.config.max_delivery_attempts
            })
            .map(|entry| entry.id)
            .collect();

        let mut retried = 0;
        for id in candidates {
            let prepared = {
                match self.messages.get_mut(&id) {
                    Some(mut entry) if entry.status == DeliveryStatus::Failed => {
                        entry.retry_count += 1;
                        entry.clear_failed_attempts();
                        entry.status = DeliveryStatus::Retry;
                        true
                    }
                    _ => false,
                }
            };
            if !prepared {
                continue;
            }

            tracing::info!(message_id = %id, "Retrying failed notification");
            counter!("foreman_notifications_retried_total").increment(1);
            self.deliver_pending_external(id).await;
            retried += 1;
        }
        retried
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Subscriptions and Queries
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to a bus event kind. Convenience passthrough so consumers do
    /// not need a bus handle of their own.
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriberId
    where
        F: Fn(&BusEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.on(kind, listener)
    }

    /// Remove a subscription created by [`subscribe`](Self::subscribe).
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriberId) -> bool {
        self.bus.off(kind, id)
    }

    /// Fetch a tracked message by ID.
    pub fn get_message(&self, id: NotificationId) -> Option<NotificationMessage> {
        self.messages.get(&id).map(|entry| entry.clone())
    }

    /// Aggregate delivery statistics, optionally restricted to messages
    /// created at or after `since`.
    pub fn delivery_stats(&self, since: Option<DateTime<Utc>>) -> DeliveryStats {
        let mut stats = DeliveryStats::default();
        for entry in self.messages.iter() {
            if let Some(since) = since {
                if entry.created_at < since {
                    continue;
                }
            }
            match entry.status {
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::Failed => stats.failed += 1,
                DeliveryStatus::Queued | DeliveryStatus::Sending | DeliveryStatus::Retry => {
                    stats.pending += 1
                }
            }
        }
        stats
    }

    fn delivery_event(
        &self,
        message: &NotificationMessage,
        recipient: &Recipient,
        channel: Channel,
    ) -> DeliveryEvent {
        DeliveryEvent {
            message_id: message.id,
            kind: message.kind,
            title: message.title.clone(),
            body: message.body.clone(),
            recipient_user_id: recipient.user_id.clone(),
            channel,
            source_module: message.source_module.clone(),
        }
    }

    fn template_vars(metadata: &HashMap<String, serde_json::Value>) -> HashMap<String, String> {
        metadata
            .iter()
            .map(|(key, value)| {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), rendered)
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
