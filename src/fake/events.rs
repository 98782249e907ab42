//! Event buses with pattern-matched rules that fan events out to queues and topics.
//!
//! Matching happens under the bus lock; deliveries are collected and sent after it is released,
//! so a target engine is never called while this one holds its state. A failed delivery is
//! logged and the publish still succeeds.

use super::filter::{condition_holds, lookup};
use super::notification::FakeNotificationIO;
use super::queue::FakeQueueIO;
use super::{IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs};
use crate::helpers::{MAX_BATCH_SIZE, validate_resource_name};
use crate::testing::Resettable;
use crate::traits::{
    BatchResult, CloudError, CloudResult, Condition, Event, EventBusIO, EventBusInfo,
    EventPattern, EventRule, NotificationIO, OutgoingMessage, QueueIO, ResourceId, Target,
    TargetKind, TopicMessage,
};
use chrono::{DateTime, SecondsFormat};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, info, warn};

pub const DEFAULT_BUS: &str = "default";

#[derive(Debug)]
struct Bus {
    created_at: TimestampMs,
    rules: BTreeMap<String, EventRule>,
}

impl Bus {
    fn new(created_at: TimestampMs) -> Self {
        Self {
            created_at,
            rules: BTreeMap::new(),
        }
    }

    fn info(&self, name: &str) -> EventBusInfo {
        EventBusInfo {
            name: name.to_string(),
            rule_count: self.rules.len(),
            created_at: self.created_at,
        }
    }

    fn rule_mut(&mut self, bus: &str, name: &str) -> CloudResult<&mut EventRule> {
        self.rules
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(ResourceId::new("rule", name).within(bus)))
    }
}

#[derive(Debug, Default)]
pub struct EventBusState {
    buses: BTreeMap<String, Bus>,
    ids: IdSequence,
}

impl EventBusState {
    fn bus_mut(&mut self, name: &str) -> CloudResult<&mut Bus> {
        self.buses
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(bus_id(name)))
    }
}

fn bus_id(name: &str) -> ResourceId {
    ResourceId::new("event_bus", name)
}

/// Whether `event` satisfies `pattern`.
pub(crate) fn pattern_matches(pattern: &EventPattern, event: &Event) -> bool {
    let listed = |list: &Option<Vec<String>>, value: &str| {
        list.as_ref().is_none_or(|list| list.iter().any(|v| v == value))
    };
    listed(&pattern.sources, &event.source)
        && listed(&pattern.detail_types, &event.detail_type)
        && pattern
            .fields
            .iter()
            .all(|(path, condition)| condition_holds(lookup(&event.detail, path), condition))
}

fn validate_rule(rule: &EventRule) -> CloudResult<()> {
    validate_resource_name(&rule.name)?;
    for (path, condition) in &rule.pattern.fields {
        if !matches!(condition, Condition::Eq(_) | Condition::In(_)) {
            return Err(CloudError::validation(format!(
                "rule {}: field {path} may only use equality or membership",
                rule.name
            )));
        }
    }
    validate_targets(&rule.name, &rule.targets, &[])
}

fn validate_targets(rule: &str, targets: &[Target], existing: &[Target]) -> CloudResult<()> {
    let mut seen: HashSet<&str> = existing.iter().map(|t| t.id.as_str()).collect();
    for target in targets {
        if target.id.is_empty() {
            return Err(CloudError::validation(format!("rule {rule}: target id is empty")));
        }
        validate_resource_name(&target.endpoint)?;
        if !seen.insert(&target.id) {
            return Err(CloudError::conflict(format!(
                "rule {rule}: duplicate target id {}",
                target.id
            )));
        }
    }
    Ok(())
}

fn validate_event(event: &Event) -> CloudResult<()> {
    if event.source.is_empty() {
        return Err(CloudError::validation("event source is required"));
    }
    if event.detail_type.is_empty() {
        return Err(CloudError::validation("event detail type is required"));
    }
    Ok(())
}

fn envelope(id: &str, bus: &str, event: &Event, now: TimestampMs) -> Value {
    let time = event.time.unwrap_or(now);
    let rendered = DateTime::from_timestamp_millis(time)
        .map_or_else(|| time.to_string(), |t| t.to_rfc3339_opts(SecondsFormat::Millis, true));
    json!({
        "id": id,
        "bus": bus,
        "source": event.source,
        "detail-type": event.detail_type,
        "time": rendered,
        "detail": event.detail,
    })
}

/// A matched event waiting to be handed to its target.
struct Routed {
    event_id: String,
    rule: String,
    envelope: Value,
    target: Target,
}

// ============================================================================
// FakeEventBusIO
// ============================================================================

#[derive(Clone)]
pub struct FakeEventBusIO {
    store: Store<EventBusState>,
    env: SimEnv,
    queues: Option<FakeQueueIO>,
    topics: Option<FakeNotificationIO>,
}

impl FakeEventBusIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    /// The default bus is created here if the store does not have one yet.
    #[must_use]
    pub fn with_store(store: Store<EventBusState>, env: SimEnv) -> Self {
        let engine = Self {
            store,
            env,
            queues: None,
            topics: None,
        };
        engine.ensure_default_bus();
        engine
    }

    /// Deliver queue targets into `queues`.
    #[must_use]
    pub fn with_queues(mut self, queues: FakeQueueIO) -> Self {
        self.queues = Some(queues);
        self
    }

    /// Deliver topic targets into `topics`.
    #[must_use]
    pub fn with_topics(mut self, topics: FakeNotificationIO) -> Self {
        self.topics = Some(topics);
        self
    }

    #[must_use]
    pub fn store(&self) -> Store<EventBusState> {
        self.store.clone()
    }

    fn ensure_default_bus(&self) {
        let now = self.env.now();
        self.store
            .lock()
            .buses
            .entry(DEFAULT_BUS.to_string())
            .or_insert_with(|| Bus::new(now));
    }

    /// Match one event under the lock and return what has to be delivered.
    fn route(
        state: &mut EventBusState,
        bus: &str,
        event: &Event,
        now: TimestampMs,
    ) -> CloudResult<(String, Vec<Routed>)> {
        state.bus_mut(bus)?;
        validate_event(event)?;
        let id = state.ids.next("evt");
        let source = state.bus_mut(bus)?;
        let envelope = envelope(&id, bus, event, now);
        let routed = source
            .rules
            .values()
            .filter(|rule| rule.enabled && pattern_matches(&rule.pattern, event))
            .flat_map(|rule| {
                rule.targets.iter().map(|target| Routed {
                    event_id: id.clone(),
                    rule: rule.name.clone(),
                    envelope: envelope.clone(),
                    target: target.clone(),
                })
            })
            .collect();
        Ok((id, routed))
    }

    fn deliver(&self, routed: Routed) {
        let Routed {
            event_id,
            rule,
            envelope,
            target,
        } = routed;
        let result = match target.kind {
            TargetKind::Queue => match &self.queues {
                Some(queues) => {
                    let mut message = OutgoingMessage::json(envelope)
                        .with_attribute("event-rule", rule.as_str())
                        .with_deduplication_key(event_id.as_str());
                    match &target.group_key {
                        Some(group) => message = message.with_group_key(group.as_str()),
                        None if queues.is_fifo_queue(&target.endpoint) => {
                            message = message.with_group_key(rule.as_str());
                        }
                        None => {}
                    }
                    queues.send(&target.endpoint, message).map(drop)
                }
                None => Err(CloudError::unavailable("no queue engine linked")),
            },
            TargetKind::Topic => match &self.topics {
                Some(topics) => {
                    let subject = envelope["detail-type"].as_str().unwrap_or_default().to_string();
                    let message = TopicMessage::new(envelope.to_string()).with_subject(subject);
                    topics.publish(&target.endpoint, message).map(drop)
                }
                None => Err(CloudError::unavailable("no notification engine linked")),
            },
        };
        match result {
            Ok(()) => debug!(event = %event_id, rule = %rule, target = %target.id, "event delivered"),
            Err(err) => warn!(
                event = %event_id,
                rule = %rule,
                target = %target.id,
                error = %err,
                "event delivery dropped"
            ),
        }
    }
}

impl Default for FakeEventBusIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeEventBusIO {
    fn reset(&self) {
        *self.store.lock() = EventBusState::default();
        self.ensure_default_bus();
    }
}

impl EventBusIO for FakeEventBusIO {
    fn create_event_bus(&self, name: &str) -> CloudResult<EventBusInfo> {
        validate_resource_name(name)?;
        let now = self.env.enter("events.create_event_bus")?;
        let mut state = self.store.lock();
        if state.buses.contains_key(name) {
            return Err(CloudError::already_exists(bus_id(name)));
        }
        let bus = Bus::new(now);
        let info = bus.info(name);
        state.buses.insert(name.to_string(), bus);
        info!(bus = name, "event bus created");
        Ok(info)
    }

    fn delete_event_bus(&self, name: &str) -> CloudResult<()> {
        self.env.enter("events.delete_event_bus")?;
        if name == DEFAULT_BUS {
            return Err(CloudError::validation("the default event bus cannot be deleted"));
        }
        let mut state = self.store.lock();
        state
            .buses
            .remove(name)
            .ok_or_else(|| CloudError::not_found(bus_id(name)))?;
        info!(bus = name, "event bus deleted");
        Ok(())
    }

    fn list_event_buses(&self) -> CloudResult<Vec<EventBusInfo>> {
        self.env.enter("events.list_event_buses")?;
        let state = self.store.lock();
        Ok(state.buses.iter().map(|(name, bus)| bus.info(name)).collect())
    }

    fn publish(&self, bus: &str, event: Event) -> CloudResult<String> {
        let now = self.env.enter("events.publish")?;
        let (id, routed) = Self::route(&mut self.store.lock(), bus, &event, now)?;
        debug!(bus, id = %id, targets = routed.len(), "event published");
        routed.into_iter().for_each(|r| self.deliver(r));
        Ok(id)
    }

    fn publish_batch(&self, bus: &str, events: Vec<Event>) -> CloudResult<BatchResult<String>> {
        if events.len() > MAX_BATCH_SIZE {
            return Err(CloudError::validation(format!(
                "at most {MAX_BATCH_SIZE} events per batch, got {}",
                events.len()
            )));
        }
        let now = self.env.enter("events.publish_batch")?;

        let mut entries = Vec::with_capacity(events.len());
        let mut pending = Vec::new();
        {
            let mut state = self.store.lock();
            state.bus_mut(bus)?;
            for event in &events {
                let outcome = Self::route(&mut state, bus, event, now);
                entries.push(outcome.map(|(id, routed)| {
                    pending.extend(routed);
                    id
                }));
            }
        }
        pending.into_iter().for_each(|r| self.deliver(r));

        let result: BatchResult<String> = entries.into_iter().collect();
        debug!(bus, failed = result.failed_count(), "event batch published");
        Ok(result)
    }

    fn put_rule(&self, bus: &str, rule: EventRule) -> CloudResult<()> {
        validate_rule(&rule)?;
        self.env.enter("events.put_rule")?;
        let mut state = self.store.lock();
        let target = state.bus_mut(bus)?;
        if target.rules.contains_key(&rule.name) {
            return Err(CloudError::already_exists(
                ResourceId::new("rule", &rule.name).within(bus),
            ));
        }
        info!(bus, rule = %rule.name, enabled = rule.enabled, "rule created");
        target.rules.insert(rule.name.clone(), rule);
        Ok(())
    }

    fn update_rule(&self, bus: &str, rule: EventRule) -> CloudResult<()> {
        validate_rule(&rule)?;
        self.env.enter("events.update_rule")?;
        let mut state = self.store.lock();
        let existing = state.bus_mut(bus)?.rule_mut(bus, &rule.name)?;
        *existing = rule;
        info!(bus, rule = %existing.name, enabled = existing.enabled, "rule updated");
        Ok(())
    }

    fn delete_rule(&self, bus: &str, name: &str) -> CloudResult<()> {
        self.env.enter("events.delete_rule")?;
        let mut state = self.store.lock();
        let target = state.bus_mut(bus)?;
        target.rule_mut(bus, name)?;
        target.rules.remove(name);
        info!(bus, rule = name, "rule deleted");
        Ok(())
    }

    fn describe_rule(&self, bus: &str, name: &str) -> CloudResult<EventRule> {
        self.env.enter("events.describe_rule")?;
        let mut state = self.store.lock();
        Ok(state.bus_mut(bus)?.rule_mut(bus, name)?.clone())
    }

    fn list_rules(&self, bus: &str) -> CloudResult<Vec<EventRule>> {
        self.env.enter("events.list_rules")?;
        let mut state = self.store.lock();
        Ok(state.bus_mut(bus)?.rules.values().cloned().collect())
    }

    fn add_targets(&self, bus: &str, rule: &str, targets: Vec<Target>) -> CloudResult<()> {
        self.env.enter("events.add_targets")?;
        let mut state = self.store.lock();
        let existing = state.bus_mut(bus)?.rule_mut(bus, rule)?;
        validate_targets(rule, &targets, &existing.targets)?;
        debug!(bus, rule, added = targets.len(), "targets added");
        existing.targets.extend(targets);
        Ok(())
    }

    fn remove_targets(&self, bus: &str, rule: &str, target_ids: &[String]) -> CloudResult<()> {
        self.env.enter("events.remove_targets")?;
        let mut state = self.store.lock();
        let existing = state.bus_mut(bus)?.rule_mut(bus, rule)?;
        if let Some(missing) = target_ids
            .iter()
            .find(|id| !existing.targets.iter().any(|t| &t.id == *id))
        {
            return Err(CloudError::not_found(
                ResourceId::new("target", missing).within(rule),
            ));
        }
        existing.targets.retain(|t| !target_ids.contains(&t.id));
        debug!(bus, rule, removed = target_ids.len(), "targets removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_event(total: i64) -> Event {
        Event::new("shop.orders", "OrderPlaced", json!({ "total": total, "region": "eu" }))
    }

    #[test]
    fn pattern_lists_and_fields() {
        let event = order_event(10);
        assert!(pattern_matches(&EventPattern::any(), &event));
        assert!(pattern_matches(
            &EventPattern::any().with_sources(["shop.orders", "shop.returns"]),
            &event
        ));
        assert!(!pattern_matches(&EventPattern::any().with_sources(["billing"]), &event));
        assert!(!pattern_matches(
            &EventPattern::any().with_detail_types(["OrderShipped"]),
            &event
        ));
        assert!(pattern_matches(
            &EventPattern::any().with_field("region", Condition::In(vec![json!("eu"), json!("us")])),
            &event
        ));
        assert!(!pattern_matches(
            &EventPattern::any().with_field("customer.tier", Condition::Eq(json!("gold"))),
            &event
        ));
    }

    #[test]
    fn range_conditions_are_rejected_in_rules() {
        let rule = EventRule::new(
            "big-orders",
            EventPattern::any().with_field("total", Condition::Gt(json!(100))),
        );
        let err = validate_rule(&rule).unwrap_err();
        assert_eq!(err.kind, crate::traits::ErrorKind::Validation);
    }

    #[test]
    fn default_bus_survives_reset() {
        let events = FakeEventBusIO::new();
        events.create_event_bus("orders").unwrap();
        events.reset();
        let names: Vec<_> = events
            .list_event_buses()
            .unwrap()
            .into_iter()
            .map(|b| b.name)
            .collect();
        assert_eq!(names, vec![DEFAULT_BUS.to_string()]);
    }

    #[test]
    fn envelope_time_is_rfc3339() {
        let mut event = order_event(1);
        event.time = Some(1_704_067_200_000);
        let envelope = envelope("evt-1", "default", &event, 0);
        assert_eq!(envelope["time"], json!("2024-01-01T00:00:00.000Z"));
        assert_eq!(envelope["detail-type"], json!("OrderPlaced"));
    }
}
