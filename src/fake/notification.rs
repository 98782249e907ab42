//! Topics with confirmed subscriptions, plus direct email and SMS.
//!
//! Queue subscriptions deliver into a linked [`FakeQueueIO`]. Every address-based delivery
//! (confirmation requests, topic fan-out, direct messages) lands in an outbox that tests read
//! back through [`FakeNotificationIO::outbox`].

use super::queue::FakeQueueIO;
use super::{IdSequence, Store};
use crate::clock::{SimEnv, TimestampMs};
use crate::helpers::{content_hash, validate_resource_name};
use crate::testing::Resettable;
use crate::traits::{
    CloudError, CloudResult, EmailMessage, NotificationIO, OutgoingMessage, Protocol,
    PublishReceipt, QueueIO, ResourceId, SmsMessage, Subscription, TopicInfo, TopicMessage,
};
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}$")
        .expect("valid email regex")
});

/// E.164: a plus sign and up to fifteen digits.
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\+[1-9][0-9]{6,14}$").expect("valid phone regex"));

const CONFIRMATION_SUBJECT: &str = "Subscription confirmation";

/// One message handed to an address-based channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub topic: Option<String>,
    pub subject: Option<String>,
    pub body: String,
    pub sent_at: TimestampMs,
}

#[derive(Debug)]
struct StoredSubscription {
    subscription: Subscription,
    token: Option<String>,
}

#[derive(Debug)]
struct Topic {
    created_at: TimestampMs,
    subscriptions: Vec<StoredSubscription>,
}

impl Topic {
    fn info(&self, name: &str) -> TopicInfo {
        TopicInfo {
            name: name.to_string(),
            subscription_count: self.subscriptions.len(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct NotificationState {
    topics: BTreeMap<String, Topic>,
    outbox: Vec<Delivery>,
    ids: IdSequence,
}

impl NotificationState {
    fn topic_mut(&mut self, name: &str) -> CloudResult<&mut Topic> {
        self.topics
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(topic_id(name)))
    }
}

fn topic_id(name: &str) -> ResourceId {
    ResourceId::new("topic", name)
}

fn validate_endpoint(protocol: Protocol, endpoint: &str) -> CloudResult<()> {
    let valid = match protocol {
        Protocol::Queue => return validate_resource_name(endpoint),
        Protocol::Email => EMAIL.is_match(endpoint),
        Protocol::Sms => PHONE.is_match(endpoint),
        Protocol::Http => endpoint.len() > "http://".len() && endpoint.starts_with("http://"),
        Protocol::Https => endpoint.len() > "https://".len() && endpoint.starts_with("https://"),
    };
    if valid {
        Ok(())
    } else {
        Err(CloudError::validation(format!(
            "invalid {protocol:?} endpoint {endpoint:?}"
        )))
    }
}

// ============================================================================
// FakeNotificationIO
// ============================================================================

#[derive(Clone)]
pub struct FakeNotificationIO {
    store: Store<NotificationState>,
    env: SimEnv,
    queues: Option<FakeQueueIO>,
}

impl FakeNotificationIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<NotificationState>, env: SimEnv) -> Self {
        Self {
            store,
            env,
            queues: None,
        }
    }

    /// Route queue-protocol subscriptions into `queues`.
    #[must_use]
    pub fn with_queues(mut self, queues: FakeQueueIO) -> Self {
        self.queues = Some(queues);
        self
    }

    #[must_use]
    pub fn store(&self) -> Store<NotificationState> {
        self.store.clone()
    }

    /// Everything sent to email, SMS and HTTP endpoints so far, oldest first.
    #[must_use]
    pub fn outbox(&self) -> Vec<Delivery> {
        self.store.lock().outbox.clone()
    }

    /// Take everything in the outbox, leaving it empty.
    pub fn drain_outbox(&self) -> Vec<Delivery> {
        std::mem::take(&mut self.store.lock().outbox)
    }

    /// Token a pending subscription must present to be confirmed.
    #[must_use]
    pub fn confirmation_token(&self, subscription_id: &str) -> Option<String> {
        self.store
            .lock()
            .topics
            .values()
            .flat_map(|t| &t.subscriptions)
            .find(|s| s.subscription.id == subscription_id)
            .and_then(|s| s.token.clone())
    }
}

impl Default for FakeNotificationIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeNotificationIO {
    fn reset(&self) {
        *self.store.lock() = NotificationState::default();
    }
}

impl NotificationIO for FakeNotificationIO {
    fn create_topic(&self, name: &str) -> CloudResult<TopicInfo> {
        validate_resource_name(name)?;
        let now = self.env.enter("notification.create_topic")?;
        let mut state = self.store.lock();
        if state.topics.contains_key(name) {
            return Err(CloudError::already_exists(topic_id(name)));
        }
        let topic = Topic {
            created_at: now,
            subscriptions: Vec::new(),
        };
        let info = topic.info(name);
        state.topics.insert(name.to_string(), topic);
        info!(topic = name, "topic created");
        Ok(info)
    }

    fn delete_topic(&self, name: &str) -> CloudResult<()> {
        self.env.enter("notification.delete_topic")?;
        let mut state = self.store.lock();
        let topic = state
            .topics
            .remove(name)
            .ok_or_else(|| CloudError::not_found(topic_id(name)))?;
        info!(topic = name, subscriptions = topic.subscriptions.len(), "topic deleted");
        Ok(())
    }

    fn list_topics(&self) -> CloudResult<Vec<TopicInfo>> {
        self.env.enter("notification.list_topics")?;
        let state = self.store.lock();
        Ok(state.topics.iter().map(|(name, t)| t.info(name)).collect())
    }

    fn subscribe(
        &self,
        topic: &str,
        protocol: Protocol,
        endpoint: &str,
    ) -> CloudResult<Subscription> {
        validate_endpoint(protocol, endpoint)?;
        let now = self.env.enter("notification.subscribe")?;
        if protocol == Protocol::Queue {
            let queue_exists = self.queues.as_ref().is_some_and(|q| q.has_queue(endpoint));
            if !queue_exists {
                return Err(CloudError::not_found(ResourceId::new("queue", endpoint)));
            }
        }

        let mut state = self.store.lock();
        let NotificationState { topics, outbox, ids } = &mut *state;
        let target = topics
            .get_mut(topic)
            .ok_or_else(|| CloudError::not_found(topic_id(topic)))?;
        if let Some(existing) = target
            .subscriptions
            .iter()
            .find(|s| s.subscription.protocol == protocol && s.subscription.endpoint == endpoint)
        {
            return Ok(existing.subscription.clone());
        }

        let id = ids.next("sub");
        let confirmed = protocol.auto_confirms();
        let token = (!confirmed).then(|| content_hash(format!("{topic}:{id}:{now}").as_bytes()));
        if let Some(token) = &token {
            outbox.push(Delivery {
                id: ids.next("msg"),
                protocol,
                endpoint: endpoint.to_string(),
                topic: Some(topic.to_string()),
                subject: Some(CONFIRMATION_SUBJECT.to_string()),
                body: format!("Confirm your subscription to {topic} with token {token}"),
                sent_at: now,
            });
        }

        let subscription = Subscription {
            id,
            topic: topic.to_string(),
            protocol,
            endpoint: endpoint.to_string(),
            confirmed,
            created_at: now,
        };
        target.subscriptions.push(StoredSubscription {
            subscription: subscription.clone(),
            token,
        });
        info!(topic, id = %subscription.id, ?protocol, confirmed, "subscription created");
        Ok(subscription)
    }

    fn unsubscribe(&self, subscription_id: &str) -> CloudResult<()> {
        self.env.enter("notification.unsubscribe")?;
        let mut state = self.store.lock();
        for topic in state.topics.values_mut() {
            if let Some(index) = topic
                .subscriptions
                .iter()
                .position(|s| s.subscription.id == subscription_id)
            {
                topic.subscriptions.remove(index);
                info!(id = subscription_id, "subscription removed");
                return Ok(());
            }
        }
        Err(CloudError::not_found(ResourceId::new(
            "subscription",
            subscription_id,
        )))
    }

    fn confirm_subscription(&self, topic: &str, token: &str) -> CloudResult<Subscription> {
        self.env.enter("notification.confirm_subscription")?;
        let mut state = self.store.lock();
        let stored = state
            .topic_mut(topic)?
            .subscriptions
            .iter_mut()
            .find(|s| s.token.as_deref() == Some(token))
            .ok_or_else(|| CloudError::validation("unknown or already used confirmation token"))?;
        stored.token = None;
        stored.subscription.confirmed = true;
        info!(topic, id = %stored.subscription.id, "subscription confirmed");
        Ok(stored.subscription.clone())
    }

    fn list_subscriptions(&self, topic: &str) -> CloudResult<Vec<Subscription>> {
        self.env.enter("notification.list_subscriptions")?;
        let mut state = self.store.lock();
        Ok(state
            .topic_mut(topic)?
            .subscriptions
            .iter()
            .map(|s| s.subscription.clone())
            .collect())
    }

    fn publish(&self, topic: &str, message: TopicMessage) -> CloudResult<PublishReceipt> {
        if message.message.is_empty() {
            return Err(CloudError::validation("message must not be empty"));
        }
        let now = self.env.enter("notification.publish")?;

        let (message_id, queue_targets, mut delivered) = {
            let mut state = self.store.lock();
            let NotificationState { topics, outbox, ids } = &mut *state;
            let target = topics
                .get_mut(topic)
                .ok_or_else(|| CloudError::not_found(topic_id(topic)))?;
            let message_id = ids.next("msg");

            let mut queue_targets = Vec::new();
            let mut delivered = 0;
            for stored in target.subscriptions.iter().filter(|s| s.subscription.confirmed) {
                let sub = &stored.subscription;
                if sub.protocol == Protocol::Queue {
                    queue_targets.push(sub.endpoint.clone());
                    continue;
                }
                outbox.push(Delivery {
                    id: message_id.clone(),
                    protocol: sub.protocol,
                    endpoint: sub.endpoint.clone(),
                    topic: Some(topic.to_string()),
                    subject: message.subject.clone(),
                    body: message.message.clone(),
                    sent_at: now,
                });
                delivered += 1;
            }
            (message_id, queue_targets, delivered)
        };

        // Queue deliveries run after the topic lock is released.
        if !queue_targets.is_empty() {
            let envelope = json!({
                "message_id": message_id,
                "topic": topic,
                "subject": message.subject,
                "message": message.message,
                "attributes": message.attributes,
                "timestamp": now,
            });
            for queue in queue_targets {
                let sent = match &self.queues {
                    Some(queues) => {
                        let mut outgoing = OutgoingMessage::json(envelope.clone())
                            .with_deduplication_key(message_id.as_str());
                        // FIFO subscribers receive one group per topic.
                        if queues.is_fifo_queue(&queue) {
                            outgoing = outgoing.with_group_key(topic);
                        }
                        queues.send(&queue, outgoing)
                    }
                    None => Err(CloudError::unavailable("no queue engine linked")),
                };
                match sent {
                    Ok(_) => delivered += 1,
                    Err(err) => warn!(topic, queue = %queue, error = %err, "queue delivery dropped"),
                }
            }
        }

        debug!(topic, id = %message_id, delivered, "message published");
        Ok(PublishReceipt {
            message_id,
            delivered,
        })
    }

    fn send_email(&self, email: EmailMessage) -> CloudResult<String> {
        validate_endpoint(Protocol::Email, &email.to)?;
        if email.body.is_empty() {
            return Err(CloudError::validation("email body must not be empty"));
        }
        let now = self.env.enter("notification.send_email")?;
        let mut state = self.store.lock();
        let id = state.ids.next("email");
        state.outbox.push(Delivery {
            id: id.clone(),
            protocol: Protocol::Email,
            endpoint: email.to,
            topic: None,
            subject: Some(email.subject),
            body: email.body,
            sent_at: now,
        });
        debug!(id = %id, "email sent");
        Ok(id)
    }

    fn send_sms(&self, sms: SmsMessage) -> CloudResult<String> {
        validate_endpoint(Protocol::Sms, &sms.phone_number)?;
        if sms.message.is_empty() {
            return Err(CloudError::validation("SMS message must not be empty"));
        }
        let now = self.env.enter("notification.send_sms")?;
        let mut state = self.store.lock();
        let id = state.ids.next("sms");
        state.outbox.push(Delivery {
            id: id.clone(),
            protocol: Protocol::Sms,
            endpoint: sms.phone_number,
            topic: None,
            subject: None,
            body: sms.message,
            sent_at: now,
        });
        debug!(id = %id, "sms sent");
        Ok(id)
    }
}
