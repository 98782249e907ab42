//! Helpers shared by the engines and by code written against the `*IO` traits.
//!
//! - [`retry_with_backoff`] - Retry transient (`Unavailable`) failures on an injected clock
//! - [`batch_in_chunks`] - Split large inputs to respect batch limits
//! - [`send_all`] - Send any number of messages through a batch-limited queue
//! - [`validate_resource_name`] / [`validate_key_path`] - Naming rules
//! - [`presigned_locator`] / [`parse_presigned_url`] - In-memory presigned URL format
//! - [`content_hash`] - Hex SHA-256 of a byte slice

use crate::clock::{Clock, TimestampMs};
use crate::traits::{
    CloudError, CloudResult, ErrorKind, OutgoingMessage, QueueIO, SendReceipt, UrlMethod,
};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

/// Largest batch accepted by batch operations.
pub const MAX_BATCH_SIZE: usize = 10;

// ============================================================================
// Retry Helper
// ============================================================================

/// Configuration for retry behavior
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2,
        }
    }
}

/// Retry an operation while it fails with a retryable error
///
/// Pauses go through `clock`, so a [`ManualClock`](crate::ManualClock) turns backoff into
/// simulated time instead of real sleeps.
///
/// # Example
/// ```
/// use cloudsim::helpers::{retry_with_backoff, RetryConfig};
/// use cloudsim::{CloudError, ManualClock};
///
/// let clock = ManualClock::new();
/// let mut attempts = 0;
/// let value = retry_with_backoff(&RetryConfig::default(), &clock, || {
///     attempts += 1;
///     if attempts < 2 { Err(CloudError::unavailable("busy")) } else { Ok(7) }
/// });
/// assert_eq!(value, Ok(7));
/// ```
///
/// # Errors
///
/// Returns the first non-retryable error, or the last error once `max_attempts` is reached
pub fn retry_with_backoff<F, T>(config: &RetryConfig, clock: &dyn Clock, mut operation: F) -> CloudResult<T>
where
    F: FnMut() -> CloudResult<T>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        match operation() {
            Ok(result) => return Ok(result),
            Err(err) => {
                if !err.is_retryable() || attempt >= config.max_attempts {
                    return Err(err);
                }
                debug!(attempt, delay_ms = delay.as_millis(), error = %err, "retrying");
                clock.pause(delay);
                delay = delay
                    .saturating_mul(config.backoff_multiplier.max(1))
                    .min(config.max_delay);
            }
        }
    }
}

// ============================================================================
// Batch Helpers
// ============================================================================

/// Split a batch operation into smaller chunks
///
/// # Errors
///
/// Returns an error if any chunk processing operation fails
pub fn batch_in_chunks<T, R, F>(items: &[T], chunk_size: usize, mut process_chunk: F) -> CloudResult<Vec<R>>
where
    T: Clone,
    F: FnMut(Vec<T>) -> CloudResult<Vec<R>>,
{
    if chunk_size == 0 {
        return Err(CloudError::validation("chunk size must be positive"));
    }
    let mut results = Vec::with_capacity(items.len());
    for chunk in items.chunks(chunk_size) {
        results.extend(process_chunk(chunk.to_vec())?);
    }
    Ok(results)
}

/// Send every message, `MAX_BATCH_SIZE` at a time
///
/// # Errors
///
/// Returns the batch-level error, or the first per-entry failure
pub fn send_all(
    queues: &dyn QueueIO,
    queue: &str,
    messages: &[OutgoingMessage],
) -> CloudResult<Vec<SendReceipt>> {
    batch_in_chunks(messages, MAX_BATCH_SIZE, |chunk| {
        queues
            .send_batch(queue, chunk)?
            .entries
            .into_iter()
            .collect()
    })
}

// ============================================================================
// Error Conversion Helpers
// ============================================================================

/// Convert foreign errors into `CloudError`
pub trait IntoCloudError<T> {
    /// # Errors
    ///
    /// Returns a `CloudError` with the specified kind if the Result is an error
    fn into_cloud_error(self, kind: ErrorKind) -> CloudResult<T>;
}

impl<T, E: std::error::Error> IntoCloudError<T> for Result<T, E> {
    fn into_cloud_error(self, kind: ErrorKind) -> CloudResult<T> {
        self.map_err(|e| CloudError::new(kind, e.to_string()))
    }
}

// ============================================================================
// Validation Helpers
// ============================================================================

static RESOURCE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid resource name regex"));

/// Validate a resource name (queue, bucket, topic, collection, ...)
///
/// # Errors
///
/// Returns `Validation` if the name is empty, longer than 255 characters, or contains
/// anything other than ASCII alphanumerics, `-`, `_` and `.`
pub fn validate_resource_name(name: &str) -> CloudResult<()> {
    if name.is_empty() {
        return Err(CloudError::validation("Resource name cannot be empty"));
    }
    if name.len() > 255 {
        return Err(CloudError::validation(
            "Resource name too long (max 255 characters)",
        ));
    }
    if !RESOURCE_NAME.is_match(name) {
        return Err(CloudError::validation(format!(
            "Resource name {name:?} contains invalid characters"
        )));
    }
    Ok(())
}

/// Validate an object key
///
/// # Errors
///
/// Returns `Validation` if the key is empty, starts with `/` or exceeds 1024 bytes
pub fn validate_key_path(path: &str) -> CloudResult<()> {
    if path.is_empty() {
        return Err(CloudError::validation("Key path cannot be empty"));
    }
    if path.starts_with('/') {
        return Err(CloudError::validation("Key path cannot start with '/'"));
    }
    if path.len() > 1024 {
        return Err(CloudError::validation("Key path too long (max 1024 bytes)"));
    }
    Ok(())
}

// ============================================================================
// Presigned URLs
// ============================================================================

const MEMORY_SCHEME: &str = "memory";

/// Decoded form of an in-memory presigned URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresignedLocator {
    pub bucket: String,
    pub key: String,
    pub method: UrlMethod,
    pub expires_at: TimestampMs,
}

/// Render `memory://bucket/key?method=GET&expires_at=...`. Key segments are percent-encoded.
#[must_use]
pub fn presigned_locator(bucket: &str, key: &str, method: UrlMethod, expires_at: TimestampMs) -> String {
    let path = key
        .split('/')
        .map(|segment| urlencoding::encode(segment))
        .collect::<Vec<_>>()
        .join("/");
    format!("{MEMORY_SCHEME}://{bucket}/{path}?method={method}&expires_at={expires_at}")
}

/// Parse a URL produced by [`presigned_locator`]
///
/// # Errors
///
/// Returns `Validation` if the scheme, path or query is malformed
pub fn parse_presigned_url(url: &str) -> CloudResult<PresignedLocator> {
    let invalid = || CloudError::validation(format!("Invalid presigned URL: {url}"));

    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    if scheme != MEMORY_SCHEME {
        return Err(invalid());
    }
    let (path, query) = rest.split_once('?').ok_or_else(invalid)?;
    let (bucket, key) = path.split_once('/').ok_or_else(invalid)?;
    if bucket.is_empty() || key.is_empty() {
        return Err(invalid());
    }
    let key = urlencoding::decode(key).map_err(|_| invalid())?;

    let mut params: BTreeMap<&str, &str> = BTreeMap::new();
    for (name, value) in query.split('&').filter_map(|p| p.split_once('=')) {
        if params.insert(name, value).is_some() {
            return Err(invalid());
        }
    }
    let method = params.get("method").ok_or_else(invalid)?.parse()?;
    let expires_at = params
        .get("expires_at")
        .and_then(|v| v.parse().ok())
        .ok_or_else(invalid)?;

    Ok(PresignedLocator {
        bucket: bucket.to_string(),
        key: key.into_owned(),
        method,
        expires_at,
    })
}

// ============================================================================
// Hashing
// ============================================================================

/// Lowercase hex SHA-256 digest.
#[must_use]
pub fn content_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

// ============================================================================
// Environment Helpers
// ============================================================================

/// Collect environment variables starting with `prefix`, keyed by the lowercased remainder
#[must_use]
pub fn config_from_env(prefix: &str) -> BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(key, value)| {
            key.strip_prefix(prefix)
                .map(|name| (name.to_lowercase(), value))
        })
        .collect()
}
