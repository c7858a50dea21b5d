//! Multi-channel notification dispatch.
//!
//! [`NotificationService::publish`] composes a message (directly or from a
//! template), delivers it in-app synchronously, and hands email and SMS
//! pairs to registered [`ChannelTransport`]s. Every recipient/channel pair
//! gets exactly one ledger entry per delivery pass, which is what makes
//! retries safe.

pub mod message;
pub mod service;
pub mod template;
pub mod transport;

pub use message::{
    AttemptOutcome, Channel, DeliveryAttempt, DeliveryStatus, NotificationDraft, NotificationId,
    NotificationKind, NotificationMessage, Recipient,
};
pub use service::{DeliveryStats, NotificationService, SendOptions};
pub use template::{NotificationTemplate, TemplateRegistry};
pub use transport::{ChannelTransport, InMemoryDirectory, RecipientResolver, RecordingTransport};
