//! Notification message model.
//!
//! A [`NotificationDraft`] is what a caller hands to
//! [`publish`](super::NotificationService::publish); a
//! [`NotificationMessage`] is the tracked record the service keeps, with a
//! delivery status and a per-recipient-per-channel attempt ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════════════
// Identity and Enumerations
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NotificationId(pub uuid::Uuid);

impl NotificationId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for NotificationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Semantic flavor of a notification, used for display styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Info,
    Success,
    Warning,
    Error,
}

impl Default for NotificationKind {
    fn default() -> Self {
        Self::Info
    }
}

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Synchronous in-process delivery to the recipient's feed
    InApp,
    Email,
    Sms,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InApp => "in_app",
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }

    /// Whether delivery goes through an external provider.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::InApp)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a notification message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Scheduled for the future, not yet processed
    Queued,
    /// External deliveries in flight
    Sending,
    /// Every recipient/channel pair resolved without failure
    Delivered,
    /// At least one pair failed
    Failed,
    /// Failed and re-queued for another delivery pass
    Retry,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recipients
// ═══════════════════════════════════════════════════════════════════════════════

/// A resolved recipient with contact details and channel preferences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipient {
    pub user_id: String,
    pub display_name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Channels this user accepts; empty means in-app only
    pub preferred_channels: Vec<Channel>,
}

impl Recipient {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            email: None,
            phone: None,
            preferred_channels: vec![Channel::InApp],
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = Some(phone.into());
        self
    }

    pub fn with_channels(mut self, channels: Vec<Channel>) -> Self {
        self.preferred_channels = channels;
        self
    }

    /// Whether this user accepts delivery on a channel.
    pub fn accepts_channel(&self, channel: Channel) -> bool {
        self.preferred_channels.contains(&channel)
    }

    /// Contact address for an external channel, if the user has one.
    pub fn contact_for(&self, channel: Channel) -> Option<&str> {
        match channel {
            Channel::Email => self.email.as_deref(),
            Channel::Sms => self.phone.as_deref(),
            Channel::InApp => Some(self.user_id.as_str()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Delivery Attempts
// ═══════════════════════════════════════════════════════════════════════════════

/// Outcome of one recipient/channel delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    /// Handed to the channel successfully
    Sent,
    /// Not attempted: the recipient does not accept this channel or has no
    /// contact address for it
    Skipped,
    /// The channel transport reported an error
    Failed,
}

/// Ledger entry for one recipient/channel pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub user_id: String,
    pub channel: Channel,
    pub outcome: AttemptOutcome,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl DeliveryAttempt {
    pub fn new(
        user_id: impl Into<String>,
        channel: Channel,
        outcome: AttemptOutcome,
        detail: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            channel,
            outcome,
            detail,
            at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Draft and Message
// ═══════════════════════════════════════════════════════════════════════════════

/// A notification as submitted by a caller, before tracking state is attached.
#[derive(Debug, Clone)]
pub struct NotificationDraft {
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    /// Template to render `title`/`body` from; when set, `metadata` supplies
    /// the placeholder values
    pub template_id: Option<String>,
    pub channels: Vec<Channel>,
    pub recipients: Vec<Recipient>,
    /// Deferred delivery time; `None` delivers immediately
    pub scheduled_at: Option<DateTime<Utc>>,
    pub source_module: String,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl NotificationDraft {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        source_module: impl Into<String>,
    ) -> Self {
        Self {
            kind: NotificationKind::Info,
            title: title.into(),
            body: body.into(),
            template_id: None,
            channels: vec![Channel::InApp],
            recipients: Vec::new(),
            scheduled_at: None,
            source_module: source_module.into(),
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

    pub fn with_recipients(mut self, recipients: Vec<Recipient>) -> Self {
        self.recipients = recipients;
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

/// A tracked notification message with its delivery ledger.
#[derive(Debug, Clone)]
pub struct NotificationMessage {
    pub id: NotificationId,
    pub kind: NotificationKind,
    pub title: String,
    pub body: String,
    pub channels: Vec<Channel>,
    pub recipients: Vec<Recipient>,
    pub status: DeliveryStatus,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub source_module: String,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    /// Delivery passes consumed by `retry_failed_notifications`
    pub retry_count: u32,
    pub attempts: Vec<DeliveryAttempt>,
}

impl NotificationMessage {
    /// Build a tracked message from a draft with rendered content.
    pub fn from_draft(draft: NotificationDraft, title: String, body: String) -> Self {
        Self {
            id: NotificationId::new(),
            kind: draft.kind,
            title,
            body,
            channels: draft.channels,
            recipients: draft.recipients,
            status: DeliveryStatus::Queued,
            scheduled_at: draft.scheduled_at,
            source_module: draft.source_module,
            metadata: draft.metadata,
            created_at: Utc::now(),
            retry_count: 0,
            attempts: Vec::new(),
        }
    }

    /// Whether a recipient/channel pair already has a ledger entry.
    pub fn has_attempt(&self, user_id: &str, channel: Channel) -> bool {
        self.attempts
            .iter()
            .any(|a| a.user_id == user_id && a.channel == channel)
    }

    /// Record an attempt, refusing duplicates for the same pair so retries
    /// never double-deliver.
    pub fn record_attempt(&mut self, attempt: DeliveryAttempt) {
        if self.has_attempt(&attempt.user_id, attempt.channel) {
            return;
        }
        self.attempts.push(attempt);
    }

    /// Recipient/channel pairs with no ledger entry yet.
    pub fn pending_pairs(&self) -> Vec<(Recipient, Channel)> {
        let mut pairs = Vec::new();
        for recipient in &self.recipients {
            for channel in &self.channels {
                if !self.has_attempt(&recipient.user_id, *channel) {
                    pairs.push((recipient.clone(), *channel));
                }
            }
        }
        pairs
    }

    /// Whether every recipient/channel pair has been attempted.
    pub fn is_complete(&self) -> bool {
        self.pending_pairs().is_empty()
    }

    /// Whether any attempt failed.
    pub fn has_failures(&self) -> bool {
        self.attempts
            .iter()
            .any(|a| a.outcome == AttemptOutcome::Failed)
    }

    /// Drop failed ledger entries so a retry pass re-attempts those pairs.
    /// Sent and skipped entries stay, preserving the double-delivery guard.
    pub fn clear_failed_attempts(&mut self) {
        self.attempts.retain(|a| a.outcome != AttemptOutcome::Failed);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn recipient(id: &str) -> Recipient {
        Recipient::new(id, "Test User")
            .with_email(format!("{}@example.com", id))
            .with_channels(vec![Channel::InApp, Channel::Email])
    }

    fn message() -> NotificationMessage {
        let draft = NotificationDraft::new("Title", "Body", "payroll")
            .with_channels(vec![Channel::InApp, Channel::Email])
            .with_recipients(vec![recipient("u1"), recipient("u2")]);
        NotificationMessage::from_draft(draft, "Title".into(), "Body".into())
    }

    #[test]
    fn test_recipient_channel_acceptance() {
        let r = recipient("u1");
        assert!(r.accepts_channel(Channel::Email));
        assert!(!r.accepts_channel(Channel::Sms));
        assert_eq!(r.contact_for(Channel::Email), Some("u1@example.com"));
        assert_eq!(r.contact_for(Channel::Sms), None);
    }

    #[test]
    fn test_attempt_ledger_dedupes_pairs() {
        let mut msg = message();
        assert_eq!(msg.pending_pairs().len(), 4);

        msg.record_attempt(DeliveryAttempt::new("u1", Channel::Email, AttemptOutcome::Sent, None));
        msg.record_attempt(DeliveryAttempt::new("u1", Channel::Email, AttemptOutcome::Sent, None));
        assert_eq!(msg.attempts.len(), 1);
        assert_eq!(msg.pending_pairs().len(), 3);
        assert!(!msg.is_complete());
    }

    #[test]
    fn test_clear_failed_keeps_sent_and_skipped() {
        let mut msg = message();
        msg.record_attempt(DeliveryAttempt::new("u1", Channel::Email, AttemptOutcome::Sent, None));
        msg.record_attempt(DeliveryAttempt::new("u1", Channel::InApp, AttemptOutcome::Skipped, None));
        msg.record_attempt(DeliveryAttempt::new(
            "u2",
            Channel::Email,
            AttemptOutcome::Failed,
            Some("provider 500".into()),
        ));
        assert!(msg.has_failures());

        msg.clear_failed_attempts();
        assert!(!msg.has_failures());
        assert_eq!(msg.attempts.len(), 2);
        // Only the failed pair is pending again, plus the never-attempted one.
        let pending = msg.pending_pairs();
        assert!(pending
            .iter()
            .any(|(r, c)| r.user_id == "u2" && *c == Channel::Email));
        assert!(!pending
            .iter()
            .any(|(r, c)| r.user_id == "u1" && *c == Channel::Email));
    }

    #[test]
    fn test_completeness() {
        let mut msg = message();
        for recipient in msg.recipients.clone() {
            for channel in msg.channels.clone() {
                msg.record_attempt(DeliveryAttempt::new(
                    recipient.user_id.clone(),
                    channel,
                    AttemptOutcome::Sent,
                    None,
                ));
            }
        }
        assert!(msg.is_complete());
        assert!(!msg.has_failures());
    }
}
