//! End-to-end tests for notification delivery: synchronous in-app dispatch,
//! channel preference handling, external transport failures and retry, and
//! recipient resolution.

use chrono::Utc;
use fake::faker::internet::en::SafeEmail;
use fake::Fake;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use foreman::notify::{AttemptOutcome, InMemoryDirectory, RecordingTransport};
use foreman::prelude::*;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

struct Harness {
    service: Arc<NotificationService>,
    bus: Arc<EventBus>,
    directory: Arc<InMemoryDirectory>,
    email: Arc<RecordingTransport>,
}

fn harness() -> Harness {
    let bus = Arc::new(EventBus::new());
    let directory = Arc::new(InMemoryDirectory::new());
    let service = Arc::new(NotificationService::new(
        bus.clone(),
        directory.clone(),
        NotificationConfig::default(),
    ));
    let email = Arc::new(RecordingTransport::new(Channel::Email));
    service.register_transport(email.clone());
    Harness {
        service,
        bus,
        directory,
        email,
    }
}

fn email_recipient(id: &str) -> Recipient {
    let address: String = SafeEmail().fake();
    Recipient::new(id, format!("User {}", id))
        .with_email(address)
        .with_channels(vec![Channel::InApp, Channel::Email])
}

async fn wait_for_status(
    service: &Arc<NotificationService>,
    id: NotificationId,
    status: DeliveryStatus,
) -> NotificationMessage {
    for _ in 0..400 {
        let message = service.get_message(id).unwrap();
        if message.status == status {
            return message;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("message never reached {:?}", status);
}

// ─────────────────────────────────────────────────────────────────────────────
// In-app delivery
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn in_app_delivery_is_synchronous_with_publish() {
    let h = harness();
    let delivered = Arc::new(Mutex::new(Vec::new()));

    let delivered_clone = delivered.clone();
    h.bus.on(EventKind::NotificationDelivered, move |event| {
        if let BusEvent::NotificationDelivered(event) = event {
            delivered_clone.lock().push(event.recipient_user_id.clone());
        }
        Ok(())
    });

    let id = h
        .service
        .publish(
            NotificationDraft::new("Shift change", "Your shift moved to 9am", "scheduling")
                .with_recipients(vec![Recipient::new("u1", "One"), Recipient::new("u2", "Two")]),
        )
        .await
        .unwrap();

    // Events were observable before publish returned.
    assert_eq!(*delivered.lock(), vec!["u1".to_string(), "u2".to_string()]);
    let message = h.service.get_message(id).unwrap();
    assert_eq!(message.status, DeliveryStatus::Delivered);
    assert_eq!(message.attempts.len(), 2);
}

#[tokio::test]
async fn recipients_not_accepting_a_channel_are_skipped() {
    let h = harness();

    let opted_out = Recipient::new("quiet", "Quiet").with_channels(vec![]);
    let id = h
        .service
        .publish(
            NotificationDraft::new("Announcement", "Body", "hr")
                .with_recipients(vec![Recipient::new("loud", "Loud"), opted_out]),
        )
        .await
        .unwrap();

    let message = h.service.get_message(id).unwrap();
    assert_eq!(message.status, DeliveryStatus::Delivered);

    let skipped = message
        .attempts
        .iter()
        .find(|attempt| attempt.user_id == "quiet")
        .unwrap();
    assert_eq!(skipped.outcome, AttemptOutcome::Skipped);
    let sent = message
        .attempts
        .iter()
        .find(|attempt| attempt.user_id == "loud")
        .unwrap();
    assert_eq!(sent.outcome, AttemptOutcome::Sent);
}

// ─────────────────────────────────────────────────────────────────────────────
// External channels
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn email_pairs_are_delivered_through_the_transport() {
    let h = harness();
    let id = h
        .service
        .publish(
            NotificationDraft::new("Payslip ready", "Your payslip is available", "payroll")
                .with_channels(vec![Channel::InApp, Channel::Email])
                .with_recipients(vec![email_recipient("u1"), email_recipient("u2")]),
        )
        .await
        .unwrap();

    let message = wait_for_status(&h.service, id, DeliveryStatus::Delivered).await;
    assert_eq!(message.attempts.len(), 4);
    assert_eq!(h.email.send_count(), 2);
}

#[tokio::test]
async fn missing_contact_address_skips_instead_of_failing() {
    let h = harness();

    let no_address = Recipient::new("u1", "One").with_channels(vec![Channel::Email]);
    let id = h
        .service
        .publish(
            NotificationDraft::new("T", "B", "hr")
                .with_channels(vec![Channel::Email])
                .with_recipients(vec![no_address]),
        )
        .await
        .unwrap();

    let message = wait_for_status(&h.service, id, DeliveryStatus::Delivered).await;
    assert_eq!(message.attempts[0].outcome, AttemptOutcome::Skipped);
    assert_eq!(h.email.send_count(), 0);
}

#[tokio::test]
async fn transport_failure_marks_message_failed() {
    let h = harness();
    h.email.set_failing(true);

    let id = h
        .service
        .publish(
            NotificationDraft::new("T", "B", "payroll")
                .with_channels(vec![Channel::Email])
                .with_recipients(vec![email_recipient("u1")]),
        )
        .await
        .unwrap();

    let message = wait_for_status(&h.service, id, DeliveryStatus::Failed).await;
    assert!(message.has_failures());
    assert_eq!(message.retry_count, 0);
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn retry_reattempts_only_failed_pairs() {
    let h = harness();
    h.email.set_failing(true);

    // u1 succeeds in-app but fails on email; u2 is in-app only.
    let id = h
        .service
        .publish(
            NotificationDraft::new("Digest", "Weekly digest", "digest")
                .with_channels(vec![Channel::InApp, Channel::Email])
                .with_recipients(vec![email_recipient("u1"), Recipient::new("u2", "Two")]),
        )
        .await
        .unwrap();
    wait_for_status(&h.service, id, DeliveryStatus::Failed).await;

    h.email.set_failing(false);
    assert_eq!(h.service.retry_failed_notifications().await, 1);

    let message = wait_for_status(&h.service, id, DeliveryStatus::Delivered).await;
    assert_eq!(message.retry_count, 1);

    // Exactly one email went out across both passes: the in-app deliveries
    // were never repeated and u2 has no email pair to send.
    assert_eq!(h.email.send_count(), 1);
    let in_app_sent = message
        .attempts
        .iter()
        .filter(|a| a.channel == Channel::InApp && a.outcome == AttemptOutcome::Sent)
        .count();
    assert_eq!(in_app_sent, 2);
}

#[tokio::test]
async fn retry_budget_is_bounded() {
    let h = harness();
    h.email.set_failing(true);

    let id = h
        .service
        .publish(
            NotificationDraft::new("T", "B", "payroll")
                .with_channels(vec![Channel::Email])
                .with_recipients(vec![email_recipient("u1")]),
        )
        .await
        .unwrap();
    wait_for_status(&h.service, id, DeliveryStatus::Failed).await;

    // Default budget is three passes.
    for _ in 0..3 {
        assert_eq!(h.service.retry_failed_notifications().await, 1);
        wait_for_status(&h.service, id, DeliveryStatus::Failed).await;
    }
    assert_eq!(h.service.retry_failed_notifications().await, 0);
    assert_eq!(h.service.get_message(id).unwrap().retry_count, 3);
}

// ─────────────────────────────────────────────────────────────────────────────
// Recipient resolution
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn send_to_users_skips_unresolved_ids() {
    let h = harness();
    h.directory.insert(Recipient::new("known", "Known"));

    let id = h
        .service
        .send_to_users(
            &["known".to_string(), "ghost".to_string()],
            "Title",
            "Body",
            SendOptions::new("hr"),
        )
        .await
        .unwrap();

    let message = h.service.get_message(id).unwrap();
    assert_eq!(message.status, DeliveryStatus::Delivered);
    assert_eq!(message.recipients.len(), 1);
    assert_eq!(
        message.metadata.get("skipped_user_ids"),
        Some(&serde_json::json!(["ghost"]))
    );
}

#[tokio::test]
async fn send_to_users_fails_when_nobody_resolves() {
    let h = harness();
    let err = h
        .service
        .send_to_users(
            &["ghost".to_string()],
            "Title",
            "Body",
            SendOptions::new("hr"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoRecipients);
}

// ─────────────────────────────────────────────────────────────────────────────
// Scheduling, stats, and subscriptions
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn delivery_stats_reflect_message_states() {
    let h = harness();

    h.service
        .publish(
            NotificationDraft::new("ok", "B", "hr")
                .with_recipients(vec![Recipient::new("u1", "One")]),
        )
        .await
        .unwrap();

    h.email.set_failing(true);
    let failed_id = h
        .service
        .publish(
            NotificationDraft::new("bad", "B", "hr")
                .with_channels(vec![Channel::Email])
                .with_recipients(vec![email_recipient("u2")]),
        )
        .await
        .unwrap();
    wait_for_status(&h.service, failed_id, DeliveryStatus::Failed).await;

    h.service
        .publish(
            NotificationDraft::new("later", "B", "hr")
                .with_recipients(vec![Recipient::new("u3", "Three")])
                .with_scheduled_at(Utc::now() + chrono::Duration::hours(1)),
        )
        .await
        .unwrap();

    let stats = h.service.delivery_stats(None);
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.pending, 1);

    // A window starting now excludes nothing here but exercises the filter.
    let windowed = h.service.delivery_stats(Some(Utc::now() - chrono::Duration::minutes(5)));
    assert_eq!(windowed.delivered + windowed.failed + windowed.pending, 3);
}

#[tokio::test]
async fn unsubscribe_stops_event_delivery() {
    let h = harness();
    let count = Arc::new(Mutex::new(0u32));

    let count_clone = count.clone();
    let token = h.service.subscribe(EventKind::NotificationDelivered, move |_| {
        *count_clone.lock() += 1;
        Ok(())
    });

    let publish = |title: &str| {
        let service = h.service.clone();
        let draft = NotificationDraft::new(title, "B", "hr")
            .with_recipients(vec![Recipient::new("u1", "One")]);
        async move { service.publish(draft).await.unwrap() }
    };

    publish("first").await;
    assert_eq!(*count.lock(), 1);

    assert!(h.service.unsubscribe(EventKind::NotificationDelivered, token));
    publish("second").await;
    assert_eq!(*count.lock(), 1);
}
