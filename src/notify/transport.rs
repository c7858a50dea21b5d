//! Channel transports and recipient resolution.
//!
//! [`ChannelTransport`] is the seam to external providers (email gateway, SMS
//! gateway); [`RecipientResolver`] is the seam to the user directory. The
//! in-memory implementations here back tests and single-process embeddings.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::message::{Channel, NotificationMessage, Recipient};
use crate::{ForemanError, Result};

/// Delivery adapter for one external channel.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// The channel this transport delivers on.
    fn channel(&self) -> Channel;

    /// Deliver one message to one recipient.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportFailed`](crate::ErrorCode::TransportFailed) error
    /// when the provider rejects or times out; such failures are recorded in
    /// the message's ledger and are retryable.
    async fn send(&self, message: &NotificationMessage, recipient: &Recipient) -> Result<()>;
}

/// Lookup from user ID to a resolved recipient.
#[async_trait]
pub trait RecipientResolver: Send + Sync {
    /// Resolve a user ID. `Ok(None)` means the user is unknown; the caller
    /// decides whether that skips the recipient or fails the operation.
    async fn resolve(&self, user_id: &str) -> Result<Option<Recipient>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// In-memory implementations
// ─────────────────────────────────────────────────────────────────────────────

/// In-memory user directory.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: DashMap<String, Recipient>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, recipient: Recipient) {
        self.users.insert(recipient.user_id.clone(), recipient);
    }
}

#[async_trait]
impl RecipientResolver for InMemoryDirectory {
    async fn resolve(&self, user_id: &str) -> Result<Option<Recipient>> {
        Ok(self.users.get(user_id).map(|entry| entry.clone()))
    }
}

/// Transport that records every send and can be toggled to fail, for tests
/// and local runs.
pub struct RecordingTransport {
    channel: Channel,
    sends: Arc<Mutex<Vec<(String, String)>>>,
    failing: AtomicBool,
}

impl RecordingTransport {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            sends: Arc::new(Mutex::new(Vec::new())),
            failing: AtomicBool::new(false),
        }
    }

    /// Make subsequent sends fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Recorded `(user_id, title)` pairs, in send order.
    pub fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().clone()
    }

    pub fn send_count(&self) -> usize {
        self.sends.lock().len()
    }
}

#[async_trait]
impl ChannelTransport for RecordingTransport {
    fn channel(&self) -> Channel {
        self.channel
    }

    async fn send(&self, message: &NotificationMessage, recipient: &Recipient) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ForemanError::transport(
                self.channel.as_str(),
                "simulated provider failure",
            ));
        }
        self.sends
            .lock()
            .push((recipient.user_id.clone(), message.title.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::message::NotificationDraft;

    fn message() -> NotificationMessage {
        NotificationMessage::from_draft(
            NotificationDraft::new("Hi", "Body", "test"),
            "Hi".into(),
            "Body".into(),
        )
    }

    #[tokio::test]
    async fn test_directory_resolution() {
        let directory = InMemoryDirectory::new();
        directory.insert(Recipient::new("u1", "User One"));

        assert!(directory.resolve("u1").await.unwrap().is_some());
        assert!(directory.resolve("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recording_transport_toggles_failure() {
        let transport = RecordingTransport::new(Channel::Email);
        let msg = message();
        let recipient = Recipient::new("u1", "User One");

        transport.send(&msg, &recipient).await.unwrap();
        assert_eq!(transport.send_count(), 1);

        transport.set_failing(true);
        let err = transport.send(&msg, &recipient).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(transport.send_count(), 1);
    }
}
