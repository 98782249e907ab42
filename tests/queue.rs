// Integration tests for the queue engine: visibility, delays, FIFO groups, dead letters.

mod common;

use anyhow::Result;
use cloudsim::helpers::{RetryConfig, retry_with_backoff, send_all};
use cloudsim::testing::assert_error_kind;
use cloudsim::*;
use common::simulated;
use serde_json::json;
use std::time::Duration;

fn standard(timeout_secs: u64) -> QueueConfig {
    QueueConfig::default().with_visibility_timeout(Duration::from_secs(timeout_secs))
}

// ============================================================================
// Visibility
// ============================================================================

#[test]
fn test_unacknowledged_message_is_redelivered() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("jobs", standard(30))?;
    cloud.queues.send("jobs", OutgoingMessage::text("resize 42"))?;

    let first = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].receive_count, 1);

    clock.advance(Duration::from_secs(29));
    assert!(cloud.queues.receive("jobs", ReceiveOptions::default())?.is_empty());

    clock.advance(Duration::from_secs(2));
    let second = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].message_id, first[0].message_id);
    assert_eq!(second[0].receive_count, 2);

    // The first delivery's handle is stale now.
    assert_error_kind(
        &cloud.queues.acknowledge("jobs", &first[0].receipt_handle),
        ErrorKind::Validation,
    );
    cloud.queues.acknowledge("jobs", &second[0].receipt_handle)?;
    assert_eq!(cloud.queues.queue_stats("jobs")?, QueueStats::default());
    Ok(())
}

#[test]
fn test_change_visibility_extends_the_deadline() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("jobs", standard(30))?;
    cloud.queues.send("jobs", OutgoingMessage::text("long task"))?;

    let received = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    cloud
        .queues
        .change_visibility("jobs", &received[0].receipt_handle, Duration::from_secs(120))?;

    clock.advance(Duration::from_secs(60));
    assert!(cloud.queues.receive("jobs", ReceiveOptions::default())?.is_empty());
    assert_eq!(cloud.queues.queue_stats("jobs")?.in_flight, 1);

    clock.advance(Duration::from_secs(61));
    let again = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    assert_eq!(again[0].receive_count, 2);
    Ok(())
}

#[test]
fn test_receive_override_timeout() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("jobs", standard(300))?;
    cloud.queues.send("jobs", OutgoingMessage::text("quick"))?;

    let options = ReceiveOptions::default().with_visibility_timeout(Duration::from_secs(5));
    cloud.queues.receive("jobs", options)?;
    clock.advance(Duration::from_secs(5));
    assert_eq!(cloud.queues.receive("jobs", ReceiveOptions::default())?.len(), 1);
    Ok(())
}

// ============================================================================
// Delays and retention
// ============================================================================

#[test]
fn test_delayed_messages_become_available() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("later", QueueConfig::default())?;
    cloud.queues.send(
        "later",
        OutgoingMessage::json(json!({ "order": 7 })).with_delay(Duration::from_secs(60)),
    )?;

    assert!(cloud.queues.receive("later", ReceiveOptions::default())?.is_empty());
    assert_eq!(cloud.queues.queue_stats("later")?.delayed, 1);

    clock.advance(Duration::from_secs(60));
    let received = cloud.queues.receive("later", ReceiveOptions::default())?;
    assert_eq!(received[0].body, json!({ "order": 7 }));

    #[derive(serde::Deserialize)]
    struct Order {
        order: u32,
    }
    assert_eq!(received[0].decode::<Order>()?.order, 7);
    Ok(())
}

#[test]
fn test_delay_above_maximum_is_rejected() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("later", QueueConfig::default())?;
    let result = cloud.queues.send(
        "later",
        OutgoingMessage::text("x").with_delay(Duration::from_secs(16 * 60)),
    );
    assert_error_kind(&result, ErrorKind::Validation);
    Ok(())
}

#[test]
fn test_retention_drops_old_messages() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue(
        "short-lived",
        QueueConfig::default().with_retention(Duration::from_secs(60)),
    )?;
    cloud.queues.send("short-lived", OutgoingMessage::text("stale soon"))?;

    clock.advance(Duration::from_secs(61));
    assert_eq!(cloud.queues.queue_stats("short-lived")?, QueueStats::default());
    assert!(cloud.queues.receive("short-lived", ReceiveOptions::default())?.is_empty());
    Ok(())
}

// ============================================================================
// FIFO
// ============================================================================

#[test]
fn test_fifo_deduplication_collapses_resends() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("orders.fifo", QueueConfig::fifo())?;
    let message = || {
        OutgoingMessage::text("order 1")
            .with_group_key("customer-1")
            .with_deduplication_key("order-1")
    };

    let first = cloud.queues.send("orders.fifo", message())?;
    let second = cloud.queues.send("orders.fifo", message())?;
    assert_eq!(first, second);
    assert_eq!(first.sequence_number, Some(1));
    assert_eq!(cloud.queues.queue_stats("orders.fifo")?.available, 1);

    // Outside the five-minute window the key is forgotten.
    clock.advance(Duration::from_secs(5 * 60));
    let third = cloud.queues.send("orders.fifo", message())?;
    assert_ne!(third.message_id, first.message_id);
    assert_eq!(cloud.queues.queue_stats("orders.fifo")?.available, 2);
    Ok(())
}

#[test]
fn test_fifo_content_based_deduplication() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue(
        "events.fifo",
        QueueConfig::fifo().with_content_based_deduplication(),
    )?;
    let a = cloud
        .queues
        .send("events.fifo", OutgoingMessage::text("same").with_group_key("g"))?;
    let b = cloud
        .queues
        .send("events.fifo", OutgoingMessage::text("same").with_group_key("g"))?;
    assert_eq!(a.message_id, b.message_id);

    assert_error_kind(
        &cloud.queues.send("events.fifo", OutgoingMessage::text("no group")),
        ErrorKind::Validation,
    );
    Ok(())
}

#[test]
fn test_fifo_without_dedup_key_is_rejected() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("strict.fifo", QueueConfig::fifo())?;
    let result = cloud
        .queues
        .send("strict.fifo", OutgoingMessage::text("x").with_group_key("g"));
    assert_error_kind(&result, ErrorKind::Validation);
    Ok(())
}

#[test]
fn test_fifo_group_blocks_behind_in_flight_message() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue(
        "work.fifo",
        QueueConfig::fifo().with_content_based_deduplication(),
    )?;
    for (group, body) in [("a", "a1"), ("a", "a2"), ("b", "b1")] {
        cloud
            .queues
            .send("work.fifo", OutgoingMessage::text(body).with_group_key(group))?;
    }

    let first = cloud.queues.receive("work.fifo", ReceiveOptions::default())?;
    assert_eq!(first[0].body_text(), Some("a1"));

    // a2 waits for a1; group b is independent.
    let next = cloud.queues.receive("work.fifo", ReceiveOptions::up_to(10))?;
    let bodies: Vec<_> = next.iter().filter_map(|m| m.body_text()).collect();
    assert_eq!(bodies, ["b1"]);

    cloud.queues.acknowledge("work.fifo", &first[0].receipt_handle)?;
    let last = cloud.queues.receive("work.fifo", ReceiveOptions::up_to(10))?;
    assert_eq!(last[0].body_text(), Some("a2"));
    Ok(())
}

#[test]
fn test_standard_queue_ignores_deduplication_keys() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("plain", QueueConfig::default())?;
    let a = cloud
        .queues
        .send("plain", OutgoingMessage::text("x").with_deduplication_key("k"))?;
    let b = cloud
        .queues
        .send("plain", OutgoingMessage::text("x").with_deduplication_key("k"))?;
    assert_ne!(a.message_id, b.message_id);
    assert_eq!(a.sequence_number, None);
    Ok(())
}

// ============================================================================
// Dead letters
// ============================================================================

#[test]
fn test_messages_move_to_dead_letter_queue() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("jobs-dlq", QueueConfig::default())?;
    cloud
        .queues
        .create_queue("jobs", standard(10).with_dead_letter("jobs-dlq", 2))?;
    cloud.queues.send("jobs", OutgoingMessage::text("poison"))?;

    cloud.queues.receive("jobs", ReceiveOptions::default())?;
    clock.advance(Duration::from_secs(10));
    let second = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    assert_eq!(second[0].receive_count, 2);

    clock.advance(Duration::from_secs(10));
    assert!(cloud.queues.receive("jobs", ReceiveOptions::default())?.is_empty());
    let dead = cloud.queues.receive("jobs-dlq", ReceiveOptions::default())?;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body_text(), Some("poison"));
    assert_eq!(dead[0].message_id, second[0].message_id);
    Ok(())
}

#[test]
fn test_dead_letter_queue_must_exist() -> Result<()> {
    let (_, cloud, _) = simulated();
    let result = cloud
        .queues
        .create_queue("jobs", QueueConfig::default().with_dead_letter("missing", 3));
    assert_error_kind(&result, ErrorKind::NotFound);
    Ok(())
}

#[test]
fn test_deleted_dead_letter_queue_keeps_messages_in_source() -> Result<()> {
    let (clock, cloud, _) = simulated();
    cloud.queues.create_queue("dlq", QueueConfig::default())?;
    cloud
        .queues
        .create_queue("jobs", standard(10).with_dead_letter("dlq", 1))?;
    let sent = cloud.queues.send("jobs", OutgoingMessage::text("poison"))?;
    cloud.queues.receive("jobs", ReceiveOptions::default())?;

    cloud.queues.delete_queue("dlq")?;
    clock.advance(Duration::from_secs(10));

    assert_eq!(cloud.queues.queue_stats("jobs")?.available, 1);
    let again = cloud.queues.receive("jobs", ReceiveOptions::default())?;
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].message_id, sent.message_id);
    assert_eq!(again[0].receive_count, 2);
    Ok(())
}

// ============================================================================
// Batches, helpers and faults
// ============================================================================

#[test]
fn test_batch_entries_fail_independently() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("mixed", QueueConfig::default())?;
    let oversized = "x".repeat(256 * 1024 + 1);
    let result = cloud.queues.send_batch(
        "mixed",
        vec![OutgoingMessage::text("ok"), OutgoingMessage::text(oversized)],
    )?;
    assert!(result.entries[0].is_ok());
    assert_eq!(result.failed_count(), 1);

    let received = cloud.queues.receive("mixed", ReceiveOptions::up_to(10))?;
    let handles = vec![received[0].receipt_handle.clone(), "receipt-bogus".to_string()];
    let acked = cloud.queues.acknowledge_batch("mixed", handles)?;
    assert!(acked.entries[0].is_ok());
    assert_error_kind(&acked.entries[1], ErrorKind::Validation);
    Ok(())
}

#[test]
fn test_send_all_chunks_large_inputs() -> Result<()> {
    let (_, cloud, _) = simulated();
    cloud.queues.create_queue("bulk", QueueConfig::default())?;
    let messages: Vec<_> = (0..25)
        .map(|i| OutgoingMessage::json(json!({ "n": i })))
        .collect();
    let receipts = send_all(cloud.queues.as_ref(), "bulk", &messages)?;
    assert_eq!(receipts.len(), 25);
    assert_eq!(cloud.queues.queue_stats("bulk")?.available, 25);
    Ok(())
}

#[test]
fn test_injected_faults_are_retried_on_simulated_time() -> Result<()> {
    let (clock, cloud, fakes) = simulated();
    cloud.queues.create_queue("flaky", QueueConfig::default())?;
    fakes.faults.fail_next("queue.send", 2);

    let start = clock.now();
    let receipt = retry_with_backoff(&RetryConfig::default(), &clock, || {
        cloud.queues.send("flaky", OutgoingMessage::text("eventually"))
    })?;
    assert!(!receipt.message_id.is_empty());
    assert_eq!(fakes.faults.triggered(), 2);
    assert_eq!(clock.now() - start, 300);
    assert_eq!(cloud.queues.queue_stats("flaky")?.available, 1);
    Ok(())
}

#[test]
fn test_latency_is_simulated_on_the_clock() -> Result<()> {
    let config = SimulationConfig {
        latency_ms: 20,
        ..SimulationConfig::default()
    };
    let (clock, cloud, _) = common::simulated_with(&config);
    let start = clock.now();
    cloud.queues.create_queue("slow", QueueConfig::default())?;
    cloud.queues.list_queues(None)?;
    assert_eq!(clock.now() - start, 40);
    Ok(())
}
