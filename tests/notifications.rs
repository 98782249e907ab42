// Integration tests for topics, subscription confirmation and direct messages.

mod common;

use anyhow::Result;
use cloudsim::testing::assert_error_kind;
use cloudsim::*;
use common::simulated;

#[test]
fn test_address_subscriptions_need_confirmation() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.notifications.create_topic("alerts")?;
    let subscription = cloud
        .notifications
        .subscribe("alerts", Protocol::Email, "ops@example.com")?;
    assert!(!subscription.confirmed);

    // The confirmation request goes out first.
    let outbox = fakes.notifications.outbox();
    assert_eq!(outbox.len(), 1);
    assert_eq!(outbox[0].subject.as_deref(), Some("Subscription confirmation"));

    let receipt = cloud
        .notifications
        .publish("alerts", TopicMessage::new("disk full").with_subject("warning"))?;
    assert_eq!(receipt.delivered, 0);

    let token = fakes
        .notifications
        .confirmation_token(&subscription.id)
        .ok_or_else(|| anyhow::anyhow!("pending subscription has no token"))?;
    assert!(outbox[0].body.contains(&token));
    let confirmed = cloud.notifications.confirm_subscription("alerts", &token)?;
    assert!(confirmed.confirmed);
    assert_error_kind(
        &cloud.notifications.confirm_subscription("alerts", &token),
        ErrorKind::Validation,
    );

    let receipt = cloud
        .notifications
        .publish("alerts", TopicMessage::new("disk full").with_subject("warning"))?;
    assert_eq!(receipt.delivered, 1);
    let last = fakes
        .notifications
        .outbox()
        .pop()
        .ok_or_else(|| anyhow::anyhow!("empty outbox"))?;
    assert_eq!(last.id, receipt.message_id);
    assert_eq!(last.endpoint, "ops@example.com");
    assert_eq!(last.body, "disk full");
    assert_eq!(last.topic.as_deref(), Some("alerts"));
    Ok(())
}

#[test]
fn test_queue_subscriptions_receive_an_envelope() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("alert-feed", QueueConfig::default())?;
    cloud.notifications.create_topic("alerts")?;
    let subscription = cloud
        .notifications
        .subscribe("alerts", Protocol::Queue, "alert-feed")?;
    assert!(subscription.confirmed);

    let mut message = TopicMessage::new("cpu high").with_subject("warning");
    message.attributes.insert("severity".to_string(), "2".to_string());
    let receipt = cloud.notifications.publish("alerts", message)?;
    assert_eq!(receipt.delivered, 1);

    let received = cloud.queues.receive("alert-feed", ReceiveOptions::default())?;
    let envelope = &received[0].body;
    assert_eq!(envelope["message_id"], receipt.message_id.as_str());
    assert_eq!(envelope["topic"], "alerts");
    assert_eq!(envelope["subject"], "warning");
    assert_eq!(envelope["message"], "cpu high");
    assert_eq!(envelope["attributes"]["severity"], "2");
    assert_eq!(envelope["timestamp"], clock.now());
    Ok(())
}

#[test]
fn test_fifo_queue_subscriptions_receive_every_publish() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("orders.fifo", QueueConfig::fifo())?;
    cloud.notifications.create_topic("orders")?;
    cloud
        .notifications
        .subscribe("orders", Protocol::Queue, "orders.fifo")?;

    // Identical bodies are distinct publishes and must not collapse.
    let first = cloud.notifications.publish("orders", TopicMessage::new("hello"))?;
    let second = cloud.notifications.publish("orders", TopicMessage::new("hello"))?;
    assert_eq!((first.delivered, second.delivered), (1, 1));

    let received = cloud.queues.receive("orders.fifo", ReceiveOptions::up_to(10))?;
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].group_key.as_deref(), Some("orders"));
    assert_eq!(received[0].body["message_id"], first.message_id.as_str());
    assert_eq!(received[1].body["message_id"], second.message_id.as_str());
    Ok(())
}

#[test]
fn test_subscription_validation() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.notifications.create_topic("alerts")?;

    assert_error_kind(
        &cloud.notifications.subscribe("alerts", Protocol::Queue, "no-such-queue"),
        ErrorKind::NotFound,
    );
    assert_error_kind(
        &cloud.notifications.subscribe("alerts", Protocol::Sms, "555-0100"),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &cloud.notifications.subscribe("missing", Protocol::Https, "https://hooks.example.com"),
        ErrorKind::NotFound,
    );
    assert_error_kind(
        &cloud.notifications.publish("alerts", TopicMessage::new("")),
        ErrorKind::Validation,
    );
    Ok(())
}

#[test]
fn test_unsubscribe_and_topic_deletion() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.notifications.create_topic("alerts")?;
    let sms = cloud
        .notifications
        .subscribe("alerts", Protocol::Sms, "+14155550100")?;
    cloud
        .notifications
        .subscribe("alerts", Protocol::Https, "https://hooks.example.com/alerts")?;
    assert_eq!(cloud.notifications.list_topics()?[0].subscription_count, 2);

    cloud.notifications.unsubscribe(&sms.id)?;
    assert_error_kind(&cloud.notifications.unsubscribe(&sms.id), ErrorKind::NotFound);
    let remaining = cloud.notifications.list_subscriptions("alerts")?;
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].protocol, Protocol::Https);

    cloud.notifications.delete_topic("alerts")?;
    assert!(cloud.notifications.list_topics()?.is_empty());
    assert_error_kind(
        &cloud.notifications.list_subscriptions("alerts"),
        ErrorKind::NotFound,
    );
    Ok(())
}

#[test]
fn test_direct_email_and_sms() -> Result<()> {
    let (_, cloud, fakes) = simulated();

    let email_id = cloud.notifications.send_email(EmailMessage {
        to: "ada@example.com".to_string(),
        subject: "Welcome".to_string(),
        body: "Hello Ada".to_string(),
    })?;
    let sms_id = cloud.notifications.send_sms(SmsMessage {
        phone_number: "+447700900123".to_string(),
        message: "Your code is 123456".to_string(),
    })?;
    assert!(email_id.starts_with("email-"));
    assert!(sms_id.starts_with("sms-"));

    let outbox = fakes.notifications.outbox();
    assert_eq!(outbox.len(), 2);
    assert_eq!(outbox[0].protocol, Protocol::Email);
    assert_eq!(outbox[0].subject.as_deref(), Some("Welcome"));
    assert_eq!(outbox[1].protocol, Protocol::Sms);
    assert_eq!(outbox[1].topic, None);

    assert_eq!(fakes.notifications.drain_outbox().len(), 2);
    assert!(fakes.notifications.outbox().is_empty());

    assert_error_kind(
        &cloud.notifications.send_email(EmailMessage {
            to: "not-an-address".to_string(),
            subject: "x".to_string(),
            body: "x".to_string(),
        }),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &cloud.notifications.send_sms(SmsMessage {
            phone_number: "+447700900123".to_string(),
            message: String::new(),
        }),
        ErrorKind::Validation,
    );
    Ok(())
}
