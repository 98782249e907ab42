// Integration tests for event buses: rule matching and fan-out to queues and topics.

mod common;

use anyhow::Result;
use cloudsim::testing::assert_error_kind;
use cloudsim::*;
use common::simulated;
use serde_json::{Value, json};

fn order_placed(total: i64, region: &str) -> Event {
    Event::new(
        "shop.orders",
        "OrderPlaced",
        json!({ "total": total, "region": region }),
    )
}

fn drain(queues: &dyn QueueIO, queue: &str) -> Result<Vec<ReceivedMessage>> {
    let messages = queues.receive(queue, ReceiveOptions::up_to(10))?;
    for message in &messages {
        queues.acknowledge(queue, &message.receipt_handle)?;
    }
    Ok(messages)
}

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_matching_events_reach_queue_targets() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("eu-orders", QueueConfig::default())?;
    cloud.events.put_rule(
        "default",
        EventRule::new(
            "eu-orders",
            EventPattern::any()
                .with_sources(["shop.orders"])
                .with_field("region", Condition::In(vec![json!("eu"), json!("uk")])),
        )
        .with_target(Target::queue("to-queue", "eu-orders")),
    )?;

    let id = cloud.events.publish("default", order_placed(120, "eu"))?;
    cloud.events.publish("default", order_placed(80, "us"))?;
    cloud.events.publish(
        "default",
        Event::new("billing", "OrderPlaced", json!({ "region": "eu" })),
    )?;

    let delivered = drain(cloud.queues.as_ref(), "eu-orders")?;
    assert_eq!(delivered.len(), 1);
    let envelope = &delivered[0].body;
    assert_eq!(envelope["id"], Value::String(id));
    assert_eq!(envelope["bus"], "default");
    assert_eq!(envelope["source"], "shop.orders");
    assert_eq!(envelope["detail-type"], "OrderPlaced");
    assert_eq!(envelope["detail"]["total"], 120);
    assert_eq!(envelope["time"], "2024-01-01T00:00:00.000Z");
    assert_eq!(
        delivered[0].attributes.get("event-rule").map(String::as_str),
        Some("eu-orders")
    );
    Ok(())
}

#[test]
fn test_disabled_rules_do_not_deliver() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.queues.create_queue("audit", QueueConfig::default())?;
    let rule = EventRule::new("audit-all", EventPattern::any())
        .with_target(Target::queue("audit", "audit"))
        .disabled();
    cloud.events.put_rule("default", rule.clone())?;

    cloud.events.publish("default", order_placed(1, "eu"))?;
    assert!(fakes.queues.peek_bodies("audit").is_empty());

    let mut enabled = rule;
    enabled.enabled = true;
    cloud.events.update_rule("default", enabled)?;
    cloud.events.publish("default", order_placed(2, "eu"))?;
    assert_eq!(fakes.queues.peek_bodies("audit").len(), 1);
    assert!(cloud.events.describe_rule("default", "audit-all")?.enabled);
    Ok(())
}

#[test]
fn test_topic_targets_publish_the_envelope() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("order-feed", QueueConfig::default())?;
    cloud.notifications.create_topic("orders")?;
    cloud
        .notifications
        .subscribe("orders", Protocol::Queue, "order-feed")?;
    cloud.events.put_rule(
        "default",
        EventRule::new("to-topic", EventPattern::any().with_detail_types(["OrderPlaced"]))
            .with_target(Target::topic("orders-topic", "orders")),
    )?;

    cloud.events.publish("default", order_placed(15, "us"))?;

    let delivered = drain(cloud.queues.as_ref(), "order-feed")?;
    assert_eq!(delivered.len(), 1);
    let notification = &delivered[0].body;
    assert_eq!(notification["topic"], "orders");
    assert_eq!(notification["subject"], "OrderPlaced");
    let inner: Value = serde_json::from_str(notification["message"].as_str().unwrap_or_default())?;
    assert_eq!(inner["detail"]["region"], "us");
    Ok(())
}

#[test]
fn test_fifo_queue_target_uses_group_key() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("orders.fifo", QueueConfig::fifo())?;
    cloud.events.put_rule(
        "default",
        EventRule::new("ordered", EventPattern::any())
            .with_target(Target::queue("fifo", "orders.fifo").with_group_key("orders")),
    )?;

    cloud.events.publish("default", order_placed(1, "eu"))?;
    cloud.events.publish("default", order_placed(2, "eu"))?;

    let delivered = drain(cloud.queues.as_ref(), "orders.fifo")?;
    let totals: Vec<_> = delivered
        .iter()
        .filter_map(|m| m.body["detail"]["total"].as_i64())
        .collect();
    assert_eq!(totals, [1, 2]);
    assert_eq!(delivered[0].group_key.as_deref(), Some("orders"));
    Ok(())
}

#[test]
fn test_fifo_queue_target_defaults_to_rule_group() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.queues.create_queue("audit.fifo", QueueConfig::fifo())?;
    cloud.events.put_rule(
        "default",
        EventRule::new("audit", EventPattern::any())
            .with_target(Target::queue("fifo", "audit.fifo")),
    )?;

    cloud.events.publish("default", order_placed(1, "eu"))?;
    cloud.events.publish("default", order_placed(2, "eu"))?;

    assert_eq!(fakes.queues.peek_bodies("audit.fifo").len(), 2);
    let delivered = cloud.queues.receive("audit.fifo", ReceiveOptions::default())?;
    assert_eq!(delivered[0].group_key.as_deref(), Some("audit"));
    assert_eq!(delivered[0].body["detail"]["total"], 1);
    Ok(())
}

#[test]
fn test_missing_target_does_not_fail_publish() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.events.put_rule(
        "default",
        EventRule::new("dangling", EventPattern::any())
            .with_target(Target::queue("gone", "deleted-queue")),
    )?;
    let id = cloud.events.publish("default", order_placed(5, "eu"))?;
    assert!(id.starts_with("evt-"));
    Ok(())
}

// ============================================================================
// Batches and validation
// ============================================================================

#[test]
fn test_publish_batch_reports_each_entry() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.queues.create_queue("all", QueueConfig::default())?;
    cloud.events.put_rule(
        "default",
        EventRule::new("everything", EventPattern::any()).with_target(Target::queue("q", "all")),
    )?;

    let result = cloud.events.publish_batch(
        "default",
        vec![
            order_placed(1, "eu"),
            Event::new("", "OrderPlaced", json!({})),
            order_placed(3, "eu"),
        ],
    )?;
    assert_eq!(result.failed_count(), 1);
    assert_error_kind(&result.entries[1], ErrorKind::Validation);
    assert_eq!(result.succeeded().count(), 2);
    assert_eq!(fakes.queues.peek_bodies("all").len(), 2);

    let too_many = (0..11).map(|i| order_placed(i, "eu")).collect();
    assert_error_kind(
        &cloud.events.publish_batch("default", too_many),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &cloud.events.publish_batch("nope", vec![order_placed(1, "eu")]),
        ErrorKind::NotFound,
    );
    Ok(())
}

#[test]
fn test_rules_accept_only_equality_and_membership() -> Result<()> {
    let (_, cloud, _) = simulated();
    let rule = EventRule::new(
        "big-orders",
        EventPattern::any().with_field("total", Condition::Gte(json!(100))),
    );
    assert_error_kind(&cloud.events.put_rule("default", rule), ErrorKind::Validation);

    let rule = EventRule::new("dup", EventPattern::any());
    cloud.events.put_rule("default", rule.clone())?;
    assert_error_kind(&cloud.events.put_rule("default", rule), ErrorKind::Conflict);
    Ok(())
}

// ============================================================================
// Buses and targets
// ============================================================================

#[test]
fn test_bus_lifecycle() -> Result<()> {
    let (_, cloud, _) = simulated();
    let names = |buses: Vec<EventBusInfo>| buses.into_iter().map(|b| b.name).collect::<Vec<_>>();
    assert_eq!(names(cloud.events.list_event_buses()?), ["default"]);

    cloud.events.create_event_bus("orders")?;
    assert_error_kind(&cloud.events.create_event_bus("orders"), ErrorKind::Conflict);
    assert_eq!(names(cloud.events.list_event_buses()?), ["default", "orders"]);

    assert_error_kind(&cloud.events.delete_event_bus("default"), ErrorKind::Validation);
    cloud.events.delete_event_bus("orders")?;
    assert_error_kind(&cloud.events.delete_event_bus("orders"), ErrorKind::NotFound);
    assert_error_kind(
        &cloud.events.publish("orders", order_placed(1, "eu")),
        ErrorKind::NotFound,
    );
    Ok(())
}

#[test]
fn test_adding_and_removing_targets() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.queues.create_queue("a", QueueConfig::default())?;
    cloud.queues.create_queue("b", QueueConfig::default())?;
    cloud
        .events
        .put_rule("default", EventRule::new("fanout", EventPattern::any()))?;

    cloud.events.add_targets(
        "default",
        "fanout",
        vec![Target::queue("to-a", "a"), Target::queue("to-b", "b")],
    )?;
    assert_error_kind(
        &cloud
            .events
            .add_targets("default", "fanout", vec![Target::queue("to-a", "a")]),
        ErrorKind::Conflict,
    );
    cloud.events.publish("default", order_placed(1, "eu"))?;

    cloud
        .events
        .remove_targets("default", "fanout", &["to-a".to_string()])?;
    assert_error_kind(
        &cloud
            .events
            .remove_targets("default", "fanout", &["to-a".to_string()]),
        ErrorKind::NotFound,
    );
    cloud.events.publish("default", order_placed(2, "eu"))?;

    assert_eq!(fakes.queues.peek_bodies("a").len(), 1);
    assert_eq!(fakes.queues.peek_bodies("b").len(), 2);

    cloud.events.delete_rule("default", "fanout")?;
    assert!(cloud.events.list_rules("default")?.is_empty());
    assert_error_kind(
        &cloud.events.describe_rule("default", "fanout"),
        ErrorKind::NotFound,
    );
    Ok(())
}
