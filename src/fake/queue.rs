//! Visibility-timeout message queues.
//!
//! A received message stays in the queue, invisible, until it is acknowledged or its deadline
//! passes. FIFO queues add per-group ordering and a deduplication window; a dead-letter policy
//! moves messages that keep coming back to another queue.

use super::{Expire, IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs, duration_ms};
use crate::helpers::{MAX_BATCH_SIZE, content_hash, validate_resource_name};
use crate::testing::Resettable;
use crate::traits::{
    BatchResult, CloudError, CloudResult, OutgoingMessage, QueueConfig, QueueIO, QueueInfo,
    QueueStats, ReceiveOptions, ReceivedMessage, ResourceId, SendReceipt,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MAX_BODY_BYTES: usize = 256 * 1024;
pub const MAX_DELAY: Duration = Duration::from_secs(15 * 60);
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);
const MIN_RETENTION: Duration = Duration::from_secs(60);
const MAX_RETENTION: Duration = Duration::from_secs(14 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visibility {
    Visible,
    InFlight { deadline: TimestampMs },
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    body: Value,
    attributes: BTreeMap<String, String>,
    group_key: Option<String>,
    sequence: u64,
    sent_at: TimestampMs,
    available_at: TimestampMs,
    visibility: Visibility,
    receive_count: u32,
    receipt_handle: Option<String>,
}

impl StoredMessage {
    fn is_available(&self, now: TimestampMs) -> bool {
        self.visibility == Visibility::Visible && self.available_at <= now
    }

    fn received(&self, fifo: bool) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.id.clone(),
            receipt_handle: self.receipt_handle.clone().unwrap_or_default(),
            body: self.body.clone(),
            attributes: self.attributes.clone(),
            receive_count: self.receive_count,
            sent_at: self.sent_at,
            group_key: self.group_key.clone(),
            sequence_number: fifo.then_some(self.sequence),
        }
    }
}

#[derive(Debug, Clone)]
struct Deduplicated {
    receipt: SendReceipt,
    expires_at: TimestampMs,
}

#[derive(Debug)]
struct Queue {
    config: QueueConfig,
    created_at: TimestampMs,
    messages: VecDeque<StoredMessage>,
    dedup: HashMap<String, Deduplicated>,
    next_sequence: u64,
}

impl Queue {
    fn info(&self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            config: self.config.clone(),
            created_at: self.created_at,
        }
    }

    fn enqueue(
        &mut self,
        ids: &mut IdSequence,
        message: OutgoingMessage,
        now: TimestampMs,
    ) -> CloudResult<SendReceipt> {
        let bytes = body_bytes(&message.body);
        if bytes.len() > MAX_BODY_BYTES {
            return Err(CloudError::validation(format!(
                "message body is {} bytes (max {MAX_BODY_BYTES})",
                bytes.len()
            )));
        }
        let delay = message.delay.unwrap_or(self.config.delivery_delay);
        if delay > MAX_DELAY {
            return Err(CloudError::validation(format!(
                "delay {delay:?} exceeds the maximum of {MAX_DELAY:?}"
            )));
        }

        let dedup_key = if self.config.fifo {
            if message.group_key.as_deref().is_none_or(str::is_empty) {
                return Err(CloudError::validation("FIFO queues require a group key"));
            }
            let key = match message.deduplication_key.clone() {
                Some(key) => key,
                None if self.config.content_based_deduplication => content_hash(&bytes),
                None => {
                    return Err(CloudError::validation(
                        "FIFO queue without content-based deduplication requires a deduplication key",
                    ));
                }
            };
            if let Some(existing) = self.dedup.get(&key) {
                debug!(message_id = %existing.receipt.message_id, "duplicate send collapsed");
                return Ok(existing.receipt.clone());
            }
            Some(key)
        } else {
            None
        };

        self.next_sequence += 1;
        let receipt = SendReceipt {
            message_id: ids.next("msg"),
            sequence_number: self.config.fifo.then_some(self.next_sequence),
        };
        if let Some(key) = dedup_key {
            self.dedup.insert(
                key,
                Deduplicated {
                    receipt: receipt.clone(),
                    expires_at: now + duration_ms(self.config.deduplication_window),
                },
            );
        }
        self.messages.push_back(StoredMessage {
            id: receipt.message_id.clone(),
            body: message.body,
            attributes: message.attributes,
            group_key: message.group_key,
            sequence: self.next_sequence,
            sent_at: now,
            available_at: now + duration_ms(delay),
            visibility: Visibility::Visible,
            receive_count: 0,
            receipt_handle: None,
        });
        Ok(receipt)
    }

    fn in_flight_index(&self, queue: &str, handle: &str) -> CloudResult<usize> {
        self.messages
            .iter()
            .position(|m| {
                matches!(m.visibility, Visibility::InFlight { .. })
                    && m.receipt_handle.as_deref() == Some(handle)
            })
            .ok_or_else(|| {
                CloudError::validation("receipt handle is unknown or no longer current")
                    .with_resource(queue_id(queue))
            })
    }
}

/// All queues of one engine.
#[derive(Debug, Default)]
pub struct QueueState {
    queues: BTreeMap<String, Queue>,
    ids: IdSequence,
    handles: IdSequence,
}

impl QueueState {
    fn queue_mut(&mut self, name: &str) -> CloudResult<&mut Queue> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(queue_id(name)))
    }
}

impl Expire for QueueState {
    fn expire(&mut self, now: TimestampMs) {
        let mut dead_letters = Vec::new();
        let existing: HashSet<String> = self.queues.keys().cloned().collect();

        for (name, queue) in &mut self.queues {
            let retention = duration_ms(queue.config.retention);
            let before = queue.messages.len();
            queue.messages.retain(|m| m.sent_at + retention > now);
            if queue.messages.len() < before {
                debug!(queue = %name, dropped = before - queue.messages.len(), "retention expired");
            }
            queue.dedup.retain(|_, d| d.expires_at > now);

            let policy = queue.config.dead_letter.clone();
            let mut kept = VecDeque::with_capacity(queue.messages.len());
            for mut message in queue.messages.drain(..) {
                if let Visibility::InFlight { deadline } = message.visibility
                    && deadline <= now
                {
                    message.visibility = Visibility::Visible;
                    message.receipt_handle = None;
                    if let Some(policy) = &policy
                        && message.receive_count >= policy.max_receive_count
                    {
                        // Without its dead-letter queue the message stays redeliverable here.
                        if existing.contains(&policy.queue) {
                            dead_letters.push((name.clone(), policy.queue.clone(), message));
                            continue;
                        }
                        warn!(queue = %name, dead_letter_queue = %policy.queue, message_id = %message.id,
                            "dead-letter queue missing, message kept in source queue");
                    }
                }
                kept.push_back(message);
            }
            queue.messages = kept;
        }

        for (source, target, mut message) in dead_letters {
            let Some(dlq) = self.queues.get_mut(&target) else {
                continue;
            };
            dlq.next_sequence += 1;
            message.sequence = dlq.next_sequence;
            message.available_at = now;
            debug!(queue = %source, dead_letter_queue = %target, message_id = %message.id,
                receive_count = message.receive_count, "moved to dead-letter queue");
            dlq.messages.push_back(message);
        }
    }
}

fn queue_id(name: &str) -> ResourceId {
    ResourceId::new("queue", name)
}

fn body_bytes(body: &Value) -> Vec<u8> {
    match body {
        Value::String(text) => text.as_bytes().to_vec(),
        other => other.to_string().into_bytes(),
    }
}

fn validate_visibility(timeout: Duration) -> CloudResult<()> {
    if timeout > MAX_VISIBILITY_TIMEOUT {
        return Err(CloudError::validation(format!(
            "visibility timeout {timeout:?} exceeds the maximum of {MAX_VISIBILITY_TIMEOUT:?}"
        )));
    }
    Ok(())
}

fn validate_batch_len(len: usize) -> CloudResult<()> {
    if len == 0 || len > MAX_BATCH_SIZE {
        return Err(CloudError::validation(format!(
            "batch must contain 1..={MAX_BATCH_SIZE} entries, got {len}"
        )));
    }
    Ok(())
}

// ============================================================================
// FakeQueueIO
// ============================================================================

#[derive(Clone)]
pub struct FakeQueueIO {
    store: Store<QueueState>,
    env: SimEnv,
}

impl FakeQueueIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    /// Build an engine over existing state. Engines built on the same store see the same queues.
    #[must_use]
    pub fn with_store(store: Store<QueueState>, env: SimEnv) -> Self {
        store.register_sweeper(&env);
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<QueueState> {
        self.store.clone()
    }

    #[must_use]
    pub const fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Whether a queue exists right now, without latency or fault injection.
    pub(crate) fn has_queue(&self, name: &str) -> bool {
        self.store.lock().queues.contains_key(name)
    }

    /// Whether `name` exists and is a FIFO queue.
    pub(crate) fn is_fifo_queue(&self, name: &str) -> bool {
        self.store
            .lock()
            .queues
            .get(name)
            .is_some_and(|q| q.config.fifo)
    }

    /// Bodies of every message still stored in a queue, in queue order.
    #[must_use]
    pub fn peek_bodies(&self, queue: &str) -> Vec<Value> {
        self.store
            .lock_at(self.env.now())
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for FakeQueueIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeQueueIO {
    fn reset(&self) {
        *self.store.lock() = QueueState::default();
    }
}

impl QueueIO for FakeQueueIO {
    fn create_queue(&self, name: &str, config: QueueConfig) -> CloudResult<QueueInfo> {
        validate_resource_name(name)?;
        validate_visibility(config.visibility_timeout)?;
        if config.delivery_delay > MAX_DELAY {
            return Err(CloudError::validation(format!(
                "delivery delay {:?} exceeds the maximum of {MAX_DELAY:?}",
                config.delivery_delay
            )));
        }
        if !(MIN_RETENTION..=MAX_RETENTION).contains(&config.retention) {
            return Err(CloudError::validation(format!(
                "retention must be between {MIN_RETENTION:?} and {MAX_RETENTION:?}"
            )));
        }
        if config.deduplication_window.is_zero() {
            return Err(CloudError::validation("deduplication window must be positive"));
        }

        let now = self.env.enter("queue.create_queue")?;
        let mut state = self.store.lock_at(now);
        if state.queues.contains_key(name) {
            return Err(CloudError::already_exists(queue_id(name)));
        }
        if let Some(policy) = &config.dead_letter {
            if policy.queue == name {
                return Err(CloudError::validation("a queue cannot be its own dead-letter queue"));
            }
            if policy.max_receive_count == 0 {
                return Err(CloudError::validation("max_receive_count must be at least 1"));
            }
            let dlq = state.queue_mut(&policy.queue)?;
            if dlq.config.fifo != config.fifo {
                return Err(CloudError::validation(
                    "dead-letter queue must have the same FIFO setting as its source",
                ));
            }
        }

        let queue = Queue {
            config,
            created_at: now,
            messages: VecDeque::new(),
            dedup: HashMap::new(),
            next_sequence: 0,
        };
        let info = queue.info(name);
        state.queues.insert(name.to_string(), queue);
        info!(queue = name, fifo = info.config.fifo, "queue created");
        Ok(info)
    }

    fn delete_queue(&self, name: &str) -> CloudResult<()> {
        let now = self.env.enter("queue.delete_queue")?;
        let mut state = self.store.lock_at(now);
        state
            .queues
            .remove(name)
            .ok_or_else(|| CloudError::not_found(queue_id(name)))?;
        info!(queue = name, "queue deleted");
        Ok(())
    }

    fn list_queues(&self, prefix: Option<&str>) -> CloudResult<Vec<String>> {
        let now = self.env.enter("queue.list_queues")?;
        let state = self.store.lock_at(now);
        Ok(state
            .queues
            .keys()
            .filter(|name| prefix.is_none_or(|p| name.starts_with(p)))
            .cloned()
            .collect())
    }

    fn queue_stats(&self, name: &str) -> CloudResult<QueueStats> {
        let now = self.env.enter("queue.queue_stats")?;
        let mut state = self.store.lock_at(now);
        let queue = state.queue_mut(name)?;
        let mut stats = QueueStats::default();
        for message in &queue.messages {
            match message.visibility {
                Visibility::InFlight { .. } => stats.in_flight += 1,
                Visibility::Visible if message.available_at > now => stats.delayed += 1,
                Visibility::Visible => stats.available += 1,
            }
        }
        Ok(stats)
    }

    fn send(&self, queue: &str, message: OutgoingMessage) -> CloudResult<SendReceipt> {
        let now = self.env.enter("queue.send")?;
        let mut state = self.store.lock_at(now);
        let QueueState { queues, ids, .. } = &mut *state;
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| CloudError::not_found(queue_id(queue)))?;
        let receipt = target
            .enqueue(ids, message, now)
            .map_err(|e| e.with_resource(queue_id(queue)))?;
        debug!(queue, message_id = %receipt.message_id, "message sent");
        Ok(receipt)
    }

    fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> CloudResult<BatchResult<SendReceipt>> {
        validate_batch_len(messages.len())?;
        let now = self.env.enter("queue.send_batch")?;
        let mut state = self.store.lock_at(now);
        let QueueState { queues, ids, .. } = &mut *state;
        let target = queues
            .get_mut(queue)
            .ok_or_else(|| CloudError::not_found(queue_id(queue)))?;
        let result: BatchResult<SendReceipt> = messages
            .into_iter()
            .map(|m| target.enqueue(ids, m, now))
            .collect();
        debug!(queue, sent = result.entries.len() - result.failed_count(),
            failed = result.failed_count(), "batch sent");
        Ok(result)
    }

    fn receive(&self, queue: &str, options: ReceiveOptions) -> CloudResult<Vec<ReceivedMessage>> {
        if !(1..=10).contains(&options.max_messages) {
            return Err(CloudError::validation(format!(
                "max_messages must be between 1 and 10, got {}",
                options.max_messages
            )));
        }
        if let Some(timeout) = options.visibility_timeout {
            validate_visibility(timeout)?;
        }

        let now = self.env.enter("queue.receive")?;
        let mut state = self.store.lock_at(now);
        let QueueState {
            queues, handles, ..
        } = &mut *state;
        let source = queues
            .get_mut(queue)
            .ok_or_else(|| CloudError::not_found(queue_id(queue)))?;
        let visibility = duration_ms(
            options
                .visibility_timeout
                .unwrap_or(source.config.visibility_timeout),
        );
        let fifo = source.config.fifo;
        let max = options.max_messages as usize;

        let mut blocked_groups: HashSet<String> = HashSet::new();
        let mut received = Vec::new();
        for message in &mut source.messages {
            if received.len() >= max {
                break;
            }
            if fifo {
                let group = message.group_key.clone().unwrap_or_default();
                if blocked_groups.contains(&group) {
                    continue;
                }
                if !message.is_available(now) {
                    blocked_groups.insert(group);
                    continue;
                }
            } else if !message.is_available(now) {
                continue;
            }

            message.visibility = Visibility::InFlight {
                deadline: now + visibility,
            };
            message.receive_count += 1;
            message.receipt_handle = Some(handles.next("receipt"));
            received.push(message.received(fifo));
        }

        debug!(queue, count = received.len(), "messages received");
        Ok(received)
    }

    fn acknowledge(&self, queue: &str, receipt_handle: &str) -> CloudResult<()> {
        let now = self.env.enter("queue.acknowledge")?;
        let mut state = self.store.lock_at(now);
        let target = state.queue_mut(queue)?;
        let index = target.in_flight_index(queue, receipt_handle)?;
        if let Some(message) = target.messages.remove(index) {
            debug!(queue, message_id = %message.id, "message acknowledged");
        }
        Ok(())
    }

    fn acknowledge_batch(
        &self,
        queue: &str,
        receipt_handles: Vec<String>,
    ) -> CloudResult<BatchResult<()>> {
        validate_batch_len(receipt_handles.len())?;
        let now = self.env.enter("queue.acknowledge_batch")?;
        let mut state = self.store.lock_at(now);
        let target = state.queue_mut(queue)?;
        Ok(receipt_handles
            .iter()
            .map(|handle| {
                let index = target.in_flight_index(queue, handle)?;
                target.messages.remove(index);
                Ok(())
            })
            .collect())
    }

    fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> CloudResult<()> {
        validate_visibility(timeout)?;
        let now = self.env.enter("queue.change_visibility")?;
        let mut state = self.store.lock_at(now);
        let target = state.queue_mut(queue)?;
        let index = target.in_flight_index(queue, receipt_handle)?;
        target.messages[index].visibility = Visibility::InFlight {
            deadline: now + duration_ms(timeout),
        };
        Ok(())
    }

    fn purge(&self, queue: &str) -> CloudResult<()> {
        let now = self.env.enter("queue.purge")?;
        let mut state = self.store.lock_at(now);
        let target = state.queue_mut(queue)?;
        let purged = target.messages.len();
        target.messages.clear();
        info!(queue, purged, "queue purged");
        Ok(())
    }
}
