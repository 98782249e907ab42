//! Core traits for the cloud service contracts.
//!
//! Every trait here is provider neutral: the in-memory fakes in [`crate::fake`] and any vendor
//! adapter implement exactly these signatures, and every failure is reported as a
//! [`CloudError`] carrying one of the four [`ErrorKind`]s.

use crate::clock::TimestampMs;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::time::Duration;

// ============================================================================
// Core Error Type
// ============================================================================

/// Error returned by every cloud operation.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudError {
    pub kind: ErrorKind,
    pub message: String,
    pub resource: Option<ResourceId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The referenced resource does not exist.
    NotFound,
    /// The caller supplied structurally invalid input.
    Validation,
    /// The operation conflicts with the current state (duplicate name, non-empty bucket, ...).
    Conflict,
    /// Transient failure. Fakes only produce it through the fault injector.
    Unavailable,
}

impl ErrorKind {
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

impl fmt::Display for CloudError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.resource {
            Some(resource) => write!(f, "{:?} [{resource}]: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

impl Error for CloudError {}

impl CloudError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            resource: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    /// `NotFound` for a specific resource.
    #[must_use]
    pub fn not_found(resource: ResourceId) -> Self {
        Self {
            kind: ErrorKind::NotFound,
            message: format!("{} {} not found", resource.resource_type, resource.qualified_name()),
            resource: Some(resource),
        }
    }

    /// `Conflict` raised when creating a resource whose name is taken.
    #[must_use]
    pub fn already_exists(resource: ResourceId) -> Self {
        Self {
            kind: ErrorKind::Conflict,
            message: format!(
                "{} {} already exists",
                resource.resource_type,
                resource.qualified_name()
            ),
            resource: Some(resource),
        }
    }

    #[must_use]
    pub fn with_resource(mut self, resource: ResourceId) -> Self {
        self.resource = Some(resource);
        self
    }

    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

// ============================================================================
// Resource Identifier Types
// ============================================================================

/// Names a resource (queue, bucket, object, topic, ...) in error payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId {
    pub resource_type: String,
    pub name: String,
    pub parent: Option<String>, // bucket of an object, collection of a document, ...
}

impl ResourceId {
    pub fn new(resource_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            name: name.into(),
            parent: None,
        }
    }

    #[must_use]
    pub fn within(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    #[must_use]
    pub fn qualified_name(&self) -> String {
        match &self.parent {
            Some(parent) => format!("{parent}/{}", self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource_type, self.qualified_name())
    }
}

/// Per-entry outcome of a batch operation. Entries keep the order of the request.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchResult<T> {
    pub entries: Vec<CloudResult<T>>,
}

impl<T> BatchResult<T> {
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_err()).count()
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.entries.iter().all(Result::is_ok)
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().filter_map(|e| e.as_ref().ok())
    }
}

impl<T> FromIterator<CloudResult<T>> for BatchResult<T> {
    fn from_iter<I: IntoIterator<Item = CloudResult<T>>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

// ============================================================================
// QueueIO - Message Queues
// ============================================================================

/// Dead-letter redirection for messages that keep failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    pub queue: String,
    pub max_receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub retention: Duration,
    pub delivery_delay: Duration,
    pub fifo: bool,
    pub content_based_deduplication: bool,
    pub deduplication_window: Duration,
    pub dead_letter: Option<DeadLetterPolicy>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            retention: Duration::from_secs(4 * 24 * 60 * 60),
            delivery_delay: Duration::ZERO,
            fifo: false,
            content_based_deduplication: false,
            deduplication_window: Duration::from_secs(5 * 60),
            dead_letter: None,
        }
    }
}

impl QueueConfig {
    /// Default configuration with FIFO ordering enabled.
    #[must_use]
    pub fn fifo() -> Self {
        Self {
            fifo: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub const fn with_delivery_delay(mut self, delay: Duration) -> Self {
        self.delivery_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_content_based_deduplication(mut self) -> Self {
        self.content_based_deduplication = true;
        self
    }

    #[must_use]
    pub fn with_dead_letter(mut self, queue: impl Into<String>, max_receive_count: u32) -> Self {
        self.dead_letter = Some(DeadLetterPolicy {
            queue: queue.into(),
            max_receive_count,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueInfo {
    pub name: String,
    pub config: QueueConfig,
    pub created_at: TimestampMs,
}

/// Approximate message counts, as reported by real queue services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub available: u64,
    pub in_flight: u64,
    pub delayed: u64,
}

/// A message to send. Text bodies are JSON strings.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Value,
    pub attributes: BTreeMap<String, String>,
    pub delay: Option<Duration>,
    pub deduplication_key: Option<String>,
    pub group_key: Option<String>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self::json(Value::String(body.into()))
    }

    #[must_use]
    pub fn json(body: Value) -> Self {
        Self {
            body,
            attributes: BTreeMap::new(),
            delay: None,
            deduplication_key: None,
            group_key: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    #[must_use]
    pub fn with_deduplication_key(mut self, key: impl Into<String>) -> Self {
        self.deduplication_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    pub message_id: String,
    /// Present for FIFO queues only.
    pub sequence_number: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: u32,
    /// Overrides the queue's visibility timeout for this receive.
    pub visibility_timeout: Option<Duration>,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 1,
            visibility_timeout: None,
        }
    }
}

impl ReceiveOptions {
    #[must_use]
    pub const fn up_to(max_messages: u32) -> Self {
        Self {
            max_messages,
            visibility_timeout: None,
        }
    }

    #[must_use]
    pub const fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }
}

/// A delivered message. `receipt_handle` is opaque and identifies this delivery only.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: Value,
    pub attributes: BTreeMap<String, String>,
    pub receive_count: u32,
    pub sent_at: TimestampMs,
    pub group_key: Option<String>,
    pub sequence_number: Option<u64>,
}

impl ReceivedMessage {
    /// The body as text, if it was sent as text.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        self.body.as_str()
    }

    /// Deserialize a structured body.
    ///
    /// # Errors
    ///
    /// Returns a `Validation` error if the body does not match `T`
    pub fn decode<T: DeserializeOwned>(&self) -> CloudResult<T> {
        serde_json::from_value(self.body.clone())
            .map_err(|e| CloudError::validation(format!("cannot decode message body: {e}")))
    }
}

/// Trait for message queue operations
pub trait QueueIO: Send + Sync {
    /// Create a queue
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the name is taken, `Validation` for an invalid name or configuration,
    /// `NotFound` if the dead-letter queue does not exist
    fn create_queue(&self, name: &str, config: QueueConfig) -> CloudResult<QueueInfo>;

    /// Delete a queue and all its messages
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist
    fn delete_queue(&self, name: &str) -> CloudResult<()>;

    /// List queue names, optionally filtered by prefix, in lexicographic order
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_queues(&self, prefix: Option<&str>) -> CloudResult<Vec<String>>;

    /// Get approximate message counts
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist
    fn queue_stats(&self, name: &str) -> CloudResult<QueueStats>;

    /// Send a message to a queue
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist, `Validation` if the message is malformed
    fn send(&self, queue: &str, message: OutgoingMessage) -> CloudResult<SendReceipt>;

    /// Send multiple messages; each entry succeeds or fails independently
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist, `Validation` if the batch is empty or too large
    fn send_batch(
        &self,
        queue: &str,
        messages: Vec<OutgoingMessage>,
    ) -> CloudResult<BatchResult<SendReceipt>>;

    /// Receive up to `max_messages` available messages. An empty queue yields an empty vector
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist, `Validation` for out-of-range options
    fn receive(&self, queue: &str, options: ReceiveOptions) -> CloudResult<Vec<ReceivedMessage>>;

    /// Acknowledge (delete) a received message
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist, `Validation` if the handle is unknown,
    /// stale or already used
    fn acknowledge(&self, queue: &str, receipt_handle: &str) -> CloudResult<()>;

    /// Acknowledge multiple messages; each handle succeeds or fails independently
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist
    fn acknowledge_batch(
        &self,
        queue: &str,
        receipt_handles: Vec<String>,
    ) -> CloudResult<BatchResult<()>>;

    /// Reset the visibility deadline of an in-flight message to now + `timeout`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist, `Validation` if the handle is not current
    fn change_visibility(
        &self,
        queue: &str,
        receipt_handle: &str,
        timeout: Duration,
    ) -> CloudResult<()>;

    /// Remove every message from a queue
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the queue doesn't exist
    fn purge(&self, queue: &str) -> CloudResult<()>;
}

// ============================================================================
// DocumentIO - Document Stores
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CollectionConfig {
    pub ttl: Option<Duration>,
    /// Advisory: indexed fields are evaluated first, results never depend on them.
    pub indexes: Vec<String>,
}

impl CollectionConfig {
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    #[must_use]
    pub fn with_index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionInfo {
    pub name: String,
    pub ttl: Option<Duration>,
    pub indexes: Vec<String>,
    pub document_count: u64,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub data: Value,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// A single predicate on a field. Absent fields satisfy nothing except `Exists(false)`.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

impl Condition {
    /// Parse a `$op` operator and its operand.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown operator or a wrongly typed operand
    pub fn from_operator(operator: &str, operand: &Value) -> CloudResult<Self> {
        let list = || {
            operand.as_array().cloned().ok_or_else(|| {
                CloudError::validation(format!("operator {operator} expects an array"))
            })
        };
        Ok(match operator {
            "$eq" => Self::Eq(operand.clone()),
            "$ne" => Self::Ne(operand.clone()),
            "$gt" => Self::Gt(operand.clone()),
            "$gte" => Self::Gte(operand.clone()),
            "$lt" => Self::Lt(operand.clone()),
            "$lte" => Self::Lte(operand.clone()),
            "$in" => Self::In(list()?),
            "$nin" => Self::Nin(list()?),
            "$exists" => Self::Exists(operand.as_bool().ok_or_else(|| {
                CloudError::validation("operator $exists expects a boolean")
            })?),
            other => {
                return Err(CloudError::validation(format!(
                    "unknown query operator {other}"
                )));
            }
        })
    }
}

/// Conjunction of per-field conditions. Field paths use dots for nesting.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Filter {
    pub clauses: Vec<(String, Condition)>,
}

impl Filter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.clauses.push((path.into(), condition));
        self
    }

    #[must_use]
    pub fn eq(self, path: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(path, Condition::Eq(value.into()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Parse the JSON query form, e.g. `{"age": {"$gt": 30}, "name": "Ada"}`.
    ///
    /// A value that is an object whose keys all start with `$` is an operator expression;
    /// anything else is an equality literal.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the query is not an object or uses an unknown operator
    pub fn from_json(query: &Value) -> CloudResult<Self> {
        let fields = query
            .as_object()
            .ok_or_else(|| CloudError::validation("query must be a JSON object"))?;
        let mut filter = Self::new();
        for (path, spec) in fields {
            if path.is_empty() {
                return Err(CloudError::validation("query field path cannot be empty"));
            }
            match spec.as_object() {
                Some(ops) if !ops.is_empty() && ops.keys().all(|k| k.starts_with('$')) => {
                    for (op, operand) in ops {
                        filter = filter.with(path.clone(), Condition::from_operator(op, operand)?);
                    }
                }
                _ => filter = filter.with(path.clone(), Condition::Eq(spec.clone())),
            }
        }
        Ok(filter)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DocumentQuery {
    pub filter: Filter,
    pub sort: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl DocumentQuery {
    #[must_use]
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            sort: None,
            limit: None,
        }
    }

    #[must_use]
    pub fn sort_by(mut self, path: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some((path.into(), order));
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Trait for schema-less document store operations
pub trait DocumentIO: Send + Sync {
    /// Create a collection
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if it already exists, `Validation` for an invalid name
    fn create_collection(&self, name: &str, config: CollectionConfig)
    -> CloudResult<CollectionInfo>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection doesn't exist
    fn get_collection(&self, name: &str) -> CloudResult<CollectionInfo>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection doesn't exist
    fn delete_collection(&self, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_collections(&self) -> CloudResult<Vec<String>>;

    /// Insert a JSON object. Its string `id` field is used as identifier, or one is generated
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for a missing collection, `Validation` for a non-object document,
    /// `Conflict` for a duplicate id
    fn insert(&self, collection: &str, document: Value) -> CloudResult<Document>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection doesn't exist
    fn find_by_id(&self, collection: &str, id: &str) -> CloudResult<Option<Document>>;

    /// Merge the top-level fields of `patch` into a document
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the collection or document doesn't exist, `Validation` if the patch
    /// is not an object or tries to change the id
    fn update(&self, collection: &str, id: &str, patch: Value) -> CloudResult<Document>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection or document doesn't exist
    fn delete(&self, collection: &str, id: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection doesn't exist
    fn query(&self, collection: &str, query: &DocumentQuery) -> CloudResult<Vec<Document>>;

    /// # Errors
    ///
    /// Returns `NotFound` if the collection doesn't exist
    fn count(&self, collection: &str, filter: &Filter) -> CloudResult<u64>;
}

// ============================================================================
// DatabaseIO - Relational Databases
// ============================================================================

/// A row from a database query, keyed by column name.
pub type Row = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// A versioned schema change. `sql` may contain several `;`-separated statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: String,
    pub sql: String,
}

impl Migration {
    pub fn new(version: i64, name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            sql: sql.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationReport {
    pub applied: Vec<i64>,
    pub skipped: Vec<i64>,
}

/// Query/execute pair handed to a unit of work.
pub trait SqlExecutor {
    /// # Errors
    ///
    /// Returns `Validation` for malformed SQL, `NotFound` for a missing table
    fn query(&mut self, sql: &str, params: &[Value]) -> CloudResult<Vec<Row>>;

    /// # Errors
    ///
    /// Returns `Validation` for malformed SQL or constraint violations, `Conflict` for
    /// duplicate keys, `NotFound` for a missing table
    fn execute(&mut self, sql: &str, params: &[Value]) -> CloudResult<ExecuteResult>;
}

/// Trait for transactional relational database operations
pub trait DatabaseIO: Send + Sync {
    /// Run a read-only `SELECT`
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed or non-`SELECT` SQL, `NotFound` for a missing table
    fn query(&self, sql: &str, params: &[Value]) -> CloudResult<Vec<Row>>;

    /// Run a write statement
    ///
    /// # Errors
    ///
    /// Returns `Validation` for malformed SQL, `Conflict` for duplicate keys or when a
    /// transaction is in progress, `NotFound` for a missing table
    fn execute(&self, sql: &str, params: &[Value]) -> CloudResult<ExecuteResult>;

    /// Run `work` as one atomic unit. An `Err` from `work` rolls every write back and is returned
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a nested transaction, or whatever `work` returned
    fn transaction(
        &self,
        work: &mut dyn FnMut(&mut dyn SqlExecutor) -> CloudResult<()>,
    ) -> CloudResult<()>;

    /// Apply each migration not yet recorded, in version order
    ///
    /// # Errors
    ///
    /// Returns `Validation` for duplicate versions, or the first failing migration's error
    fn migrate(&self, migrations: &[Migration]) -> CloudResult<MigrationReport>;

    /// # Errors
    ///
    /// Returns an error if the check fails
    fn table_exists(&self, table: &str) -> CloudResult<bool>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_tables(&self) -> CloudResult<Vec<String>>;
}

/// Typed convenience over [`DatabaseIO::transaction`].
pub trait DatabaseIOExt: DatabaseIO {
    /// Run `work` in a transaction and return its value.
    ///
    /// # Errors
    ///
    /// Same as [`DatabaseIO::transaction`]
    fn run_transaction<T, F>(&self, work: F) -> CloudResult<T>
    where
        F: FnOnce(&mut dyn SqlExecutor) -> CloudResult<T>,
    {
        let mut work = Some(work);
        let mut output = None;
        self.transaction(&mut |tx| {
            let work = work
                .take()
                .ok_or_else(|| CloudError::validation("transaction body invoked twice"))?;
            output = Some(work(tx)?);
            Ok(())
        })?;
        output.ok_or_else(|| CloudError::validation("transaction body was not invoked"))
    }
}

impl<D: DatabaseIO + ?Sized> DatabaseIOExt for D {}

// ============================================================================
// EventBusIO - Event Routing
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub source: String,
    pub detail_type: String,
    pub detail: Value,
    /// Defaults to the publish time.
    pub time: Option<TimestampMs>,
}

impl Event {
    pub fn new(source: impl Into<String>, detail_type: impl Into<String>, detail: Value) -> Self {
        Self {
            source: source.into(),
            detail_type: detail_type.into(),
            detail,
            time: None,
        }
    }
}

/// Filter a published event must satisfy. `None` lists match everything.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventPattern {
    pub sources: Option<Vec<String>>,
    pub detail_types: Option<Vec<String>>,
    /// Conditions on the event detail; only `Eq` and `In` are accepted.
    pub fields: Vec<(String, Condition)>,
}

impl EventPattern {
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_sources<I, S>(mut self, sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sources = Some(sources.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_detail_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.detail_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn with_field(mut self, path: impl Into<String>, condition: Condition) -> Self {
        self.fields.push((path.into(), condition));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetKind {
    Queue,
    Topic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub id: String,
    pub kind: TargetKind,
    /// Name of the queue or topic.
    pub endpoint: String,
    /// Group key used when the endpoint is a FIFO queue.
    pub group_key: Option<String>,
}

impl Target {
    pub fn queue(id: impl Into<String>, queue: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Queue,
            endpoint: queue.into(),
            group_key: None,
        }
    }

    pub fn topic(id: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: TargetKind::Topic,
            endpoint: topic.into(),
            group_key: None,
        }
    }

    #[must_use]
    pub fn with_group_key(mut self, key: impl Into<String>) -> Self {
        self.group_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventRule {
    pub name: String,
    pub description: Option<String>,
    pub pattern: EventPattern,
    pub enabled: bool,
    pub targets: Vec<Target>,
}

impl EventRule {
    pub fn new(name: impl Into<String>, pattern: EventPattern) -> Self {
        Self {
            name: name.into(),
            description: None,
            pattern,
            enabled: true,
            targets: Vec::new(),
        }
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: Target) -> Self {
        self.targets.push(target);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBusInfo {
    pub name: String,
    pub rule_count: usize,
    pub created_at: TimestampMs,
}

/// Trait for event bus operations
pub trait EventBusIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the bus exists, `Validation` for an invalid name
    fn create_event_bus(&self, name: &str) -> CloudResult<EventBusInfo>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bus doesn't exist, `Validation` for the default bus
    fn delete_event_bus(&self, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_event_buses(&self) -> CloudResult<Vec<EventBusInfo>>;

    /// Publish one event and return its id
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus doesn't exist, `Validation` if source or type is missing
    fn publish(&self, bus: &str, event: Event) -> CloudResult<String>;

    /// Publish events; malformed entries fail individually
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus doesn't exist
    fn publish_batch(&self, bus: &str, events: Vec<Event>) -> CloudResult<BatchResult<String>>;

    /// Create a rule
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus doesn't exist, `Conflict` if the rule exists,
    /// `Validation` for an invalid pattern or target
    fn put_rule(&self, bus: &str, rule: EventRule) -> CloudResult<()>;

    /// Replace an existing rule
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus or rule doesn't exist, `Validation` for an invalid pattern
    fn update_rule(&self, bus: &str, rule: EventRule) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bus or rule doesn't exist
    fn delete_rule(&self, bus: &str, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bus or rule doesn't exist
    fn describe_rule(&self, bus: &str, name: &str) -> CloudResult<EventRule>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bus doesn't exist
    fn list_rules(&self, bus: &str) -> CloudResult<Vec<EventRule>>;

    /// Append targets to a rule
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bus or rule doesn't exist, `Conflict` for a duplicate target id
    fn add_targets(&self, bus: &str, rule: &str, targets: Vec<Target>) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bus, rule or any target id doesn't exist
    fn remove_targets(&self, bus: &str, rule: &str, target_ids: &[String]) -> CloudResult<()>;
}

// ============================================================================
// ObjectIO - Object Storage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PutOptions {
    pub content_type: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl PutOptions {
    pub fn content_type(content_type: impl Into<String>) -> Self {
        Self {
            content_type: Some(content_type.into()),
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Metadata for an object in storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    pub content_type: String,
    /// Hex SHA-256 of the content, computed by the store.
    pub content_hash: String,
    pub last_modified: TimestampMs,
    pub custom_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub metadata: ObjectMetadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlMethod {
    Get,
    Put,
}

impl UrlMethod {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
        }
    }
}

impl fmt::Display for UrlMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UrlMethod {
    type Err = CloudError;

    fn from_str(s: &str) -> CloudResult<Self> {
        match s {
            "GET" => Ok(Self::Get),
            "PUT" => Ok(Self::Put),
            other => Err(CloudError::validation(format!("unknown URL method {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedUrl {
    pub url: String,
    pub method: UrlMethod,
    pub expires_at: TimestampMs,
}

/// Trait for object storage operations
pub trait ObjectIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the bucket exists, `Validation` for an invalid name
    fn create_bucket(&self, bucket: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist, `Conflict` if it still holds objects
    fn delete_bucket(&self, bucket: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_buckets(&self) -> CloudResult<Vec<String>>;

    /// Upload data, replacing any object at the same key
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist, `Validation` for an invalid key
    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        options: PutOptions,
    ) -> CloudResult<ObjectMetadata>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bucket or object doesn't exist
    fn get_object(&self, bucket: &str, key: &str) -> CloudResult<StoredObject>;

    /// Delete an object. Deleting a missing key succeeds
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist
    fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()>;

    /// List objects in key order, optionally restricted to a prefix
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist
    fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> CloudResult<Vec<ObjectMetadata>>;

    /// Copy content and metadata to a new location
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if either bucket or the source object doesn't exist
    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> CloudResult<ObjectMetadata>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist
    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool>;

    /// # Errors
    ///
    /// Returns `NotFound` if the bucket or object doesn't exist
    fn get_metadata(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata>;

    /// Create a time-limited access URL
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the bucket doesn't exist, `Validation` for an out-of-range expiry
    fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        method: UrlMethod,
        expires_in: Duration,
    ) -> CloudResult<PresignedUrl>;
}

// ============================================================================
// NotificationIO - Topics and Direct Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: String,
    pub subscription_count: usize,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Queue,
    Email,
    Sms,
    Http,
    Https,
}

impl Protocol {
    /// Channels with synchronous delivery are confirmed at subscribe time.
    #[must_use]
    pub const fn auto_confirms(self) -> bool {
        matches!(self, Self::Queue)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub topic: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub confirmed: bool,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TopicMessage {
    pub subject: Option<String>,
    pub message: String,
    pub attributes: BTreeMap<String, String>,
}

impl TopicMessage {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    /// Number of confirmed subscriptions the message reached.
    pub delivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmsMessage {
    pub phone_number: String,
    pub message: String,
}

/// Trait for notification operations
pub trait NotificationIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the topic exists, `Validation` for an invalid name
    fn create_topic(&self, name: &str) -> CloudResult<TopicInfo>;

    /// Delete a topic and its subscriptions
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the topic doesn't exist
    fn delete_topic(&self, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_topics(&self) -> CloudResult<Vec<TopicInfo>>;

    /// Subscribe an endpoint. Address-based protocols start unconfirmed and receive a token
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the topic (or the queue endpoint) doesn't exist, `Validation` for
    /// a malformed endpoint
    fn subscribe(&self, topic: &str, protocol: Protocol, endpoint: &str)
    -> CloudResult<Subscription>;

    /// # Errors
    ///
    /// Returns `NotFound` if the subscription doesn't exist
    fn unsubscribe(&self, subscription_id: &str) -> CloudResult<()>;

    /// Confirm a pending subscription with the token issued at subscribe time
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the topic doesn't exist, `Validation` for an unknown token
    fn confirm_subscription(&self, topic: &str, token: &str) -> CloudResult<Subscription>;

    /// # Errors
    ///
    /// Returns `NotFound` if the topic doesn't exist
    fn list_subscriptions(&self, topic: &str) -> CloudResult<Vec<Subscription>>;

    /// Fan a message out to every confirmed subscription
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the topic doesn't exist, `Validation` for an empty message
    fn publish(&self, topic: &str, message: TopicMessage) -> CloudResult<PublishReceipt>;

    /// # Errors
    ///
    /// Returns `Validation` for a malformed address or empty content
    fn send_email(&self, email: EmailMessage) -> CloudResult<String>;

    /// # Errors
    ///
    /// Returns `Validation` for a malformed phone number or empty content
    fn send_sms(&self, sms: SmsMessage) -> CloudResult<String>;
}

// ============================================================================
// SecretsIO - Secret Storage
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub value: String,
    pub version: u32,
    pub created_at: TimestampMs,
    pub updated_at: TimestampMs,
}

/// Trait for versioned secret storage
pub trait SecretsIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the secret exists, `Validation` for an invalid name
    fn create_secret(&self, name: &str, value: &str) -> CloudResult<Secret>;

    /// Get the latest version, or a specific one
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the secret or version doesn't exist
    fn get_secret(&self, name: &str, version: Option<u32>) -> CloudResult<Secret>;

    /// Store a new version
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the secret doesn't exist
    fn put_secret_value(&self, name: &str, value: &str) -> CloudResult<Secret>;

    /// # Errors
    ///
    /// Returns `NotFound` if the secret doesn't exist
    fn delete_secret(&self, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_secrets(&self, prefix: Option<&str>) -> CloudResult<Vec<String>>;
}

// ============================================================================
// ConfigIO - Configuration Parameters
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParameterKind {
    String,
    StringList,
    Secure,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parameter {
    pub name: String,
    pub value: String,
    pub kind: ParameterKind,
    pub version: u64,
    pub last_modified: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterBatch {
    pub found: Vec<Parameter>,
    pub missing: Vec<String>,
}

/// Trait for configuration service operations
pub trait ConfigIO: Send + Sync {
    /// Store a parameter and return its new version
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if it exists and `overwrite` is false, `Validation` for an invalid name
    fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
        overwrite: bool,
    ) -> CloudResult<u64>;

    /// # Errors
    ///
    /// Returns `NotFound` if the parameter doesn't exist
    fn get_parameter(&self, name: &str) -> CloudResult<Parameter>;

    /// # Errors
    ///
    /// Returns an error if the lookup fails; missing names are reported in the batch
    fn get_parameters(&self, names: &[String]) -> CloudResult<ParameterBatch>;

    /// Parameters below a `/`-separated path. Non-recursive lookups return direct children only
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the path does not start with `/`
    fn get_parameters_by_path(&self, path: &str, recursive: bool) -> CloudResult<Vec<Parameter>>;

    /// # Errors
    ///
    /// Returns `NotFound` if the parameter doesn't exist
    fn delete_parameter(&self, name: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_parameters(&self, prefix: Option<&str>) -> CloudResult<Vec<String>>;
}

// ============================================================================
// AuthIO - Authentication
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignUp {
    pub username: String,
    pub password: String,
    pub attributes: BTreeMap<String, String>,
}

impl SignUp {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub username: String,
    pub attributes: BTreeMap<String, String>,
    pub enabled: bool,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: TimestampMs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub username: String,
    pub issued_at: TimestampMs,
    pub expires_at: TimestampMs,
}

/// Trait for user-pool authentication
pub trait AuthIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` for a taken username, `Validation` for a weak password
    fn sign_up(&self, request: SignUp) -> CloudResult<User>;

    /// # Errors
    ///
    /// Returns `Validation` for wrong credentials or a disabled user
    fn sign_in(&self, username: &str, password: &str) -> CloudResult<AuthTokens>;

    /// # Errors
    ///
    /// Returns `Validation` for an unknown, expired or revoked token
    fn verify_token(&self, access_token: &str) -> CloudResult<TokenClaims>;

    /// Exchange a refresh token for a new token pair
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown or revoked refresh token
    fn refresh(&self, refresh_token: &str) -> CloudResult<AuthTokens>;

    /// Revoke the session behind an access token
    ///
    /// # Errors
    ///
    /// Returns `Validation` for an unknown token
    fn sign_out(&self, access_token: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns `NotFound` if the user doesn't exist
    fn get_user(&self, username: &str) -> CloudResult<User>;

    /// # Errors
    ///
    /// Returns `NotFound` if the user doesn't exist
    fn update_user_attributes(
        &self,
        username: &str,
        attributes: BTreeMap<String, String>,
    ) -> CloudResult<User>;

    /// Disabling a user revokes its sessions
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the user doesn't exist
    fn set_user_enabled(&self, username: &str, enabled: bool) -> CloudResult<User>;

    /// # Errors
    ///
    /// Returns `NotFound` if the user doesn't exist
    fn delete_user(&self, username: &str) -> CloudResult<()>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_users(&self) -> CloudResult<Vec<User>>;
}

// ============================================================================
// HostingIO - Application Hosting
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AppConfig {
    pub runtime: String,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct App {
    pub name: String,
    pub runtime: String,
    pub url: String,
    pub environment: BTreeMap<String, String>,
    pub active_deployment: Option<String>,
    pub created_at: TimestampMs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeploymentStatus {
    Active,
    Superseded,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub version: String,
    pub artifact: String,
    pub environment: BTreeMap<String, String>,
}

impl DeploymentRequest {
    pub fn new(version: impl Into<String>, artifact: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            artifact: artifact.into(),
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Deployment {
    pub id: String,
    pub app: String,
    pub version: String,
    pub artifact: String,
    pub environment: BTreeMap<String, String>,
    pub status: DeploymentStatus,
    pub deployed_at: TimestampMs,
}

/// Trait for application hosting operations
pub trait HostingIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the app exists, `Validation` for an invalid name or empty runtime
    fn create_app(&self, name: &str, config: AppConfig) -> CloudResult<App>;

    /// # Errors
    ///
    /// Returns `NotFound` if the app doesn't exist
    fn get_app(&self, name: &str) -> CloudResult<App>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_apps(&self) -> CloudResult<Vec<App>>;

    /// # Errors
    ///
    /// Returns `NotFound` if the app doesn't exist
    fn delete_app(&self, name: &str) -> CloudResult<()>;

    /// Activate a new deployment, superseding the current one
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the app doesn't exist, `Validation` for an empty version or artifact
    fn deploy(&self, app: &str, request: DeploymentRequest) -> CloudResult<Deployment>;

    /// Deployments, oldest first
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the app doesn't exist
    fn list_deployments(&self, app: &str) -> CloudResult<Vec<Deployment>>;

    /// Re-activate the deployment that preceded the active one
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the app doesn't exist, `Conflict` if there is nothing to roll back to
    fn rollback(&self, app: &str) -> CloudResult<Deployment>;
}

// ============================================================================
// BatchIO - Batch Jobs
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobDefinition {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            command: Vec::new(),
            environment: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub name: String,
    pub definition: String,
    pub parameters: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
}

impl JobRequest {
    pub fn new(name: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            definition: definition.into(),
            parameters: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn depends_on(mut self, job_id: impl Into<String>) -> Self {
        self.depends_on.push(job_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    #[must_use]
    pub const fn is_finished(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: String,
    pub name: String,
    pub definition: String,
    pub parameters: BTreeMap<String, String>,
    pub depends_on: Vec<String>,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub status_reason: Option<String>,
    pub submitted_at: TimestampMs,
    pub started_at: Option<TimestampMs>,
    pub stopped_at: Option<TimestampMs>,
}

/// Trait for batch job operations
pub trait BatchIO: Send + Sync {
    /// # Errors
    ///
    /// Returns `Conflict` if the definition exists, `Validation` for an empty image
    fn register_job_definition(&self, definition: JobDefinition) -> CloudResult<JobDefinition>;

    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_job_definitions(&self) -> CloudResult<Vec<JobDefinition>>;

    /// # Errors
    ///
    /// Returns `NotFound` for an unknown definition or dependency
    fn submit_job(&self, request: JobRequest) -> CloudResult<Job>;

    /// # Errors
    ///
    /// Returns `NotFound` if the job doesn't exist
    fn describe_job(&self, job_id: &str) -> CloudResult<Job>;

    /// Jobs in submission order, optionally filtered by status
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails
    fn list_jobs(&self, status: Option<JobStatus>) -> CloudResult<Vec<Job>>;

    /// # Errors
    ///
    /// Returns `NotFound` if the job doesn't exist, `Conflict` if it already finished
    fn cancel_job(&self, job_id: &str, reason: &str) -> CloudResult<Job>;
}
