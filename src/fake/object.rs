//! Buckets of byte blobs with hashed content and presigned-URL stand-ins.

use super::Store;
use crate::clock::{SimEnv, TimestampMs, duration_ms};
use crate::helpers::{content_hash, parse_presigned_url, presigned_locator, validate_key_path, validate_resource_name};
use crate::testing::Resettable;
use crate::traits::{
    CloudError, CloudResult, ObjectIO, ObjectMetadata, PresignedUrl, PutOptions, ResourceId,
    StoredObject, UrlMethod,
};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

pub const MIN_PRESIGN_EXPIRY: Duration = Duration::from_secs(1);
pub const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

#[derive(Debug)]
struct Bucket {
    objects: BTreeMap<String, StoredObject>,
}

#[derive(Debug, Default)]
pub struct ObjectState {
    buckets: BTreeMap<String, Bucket>,
}

impl ObjectState {
    fn bucket(&self, name: &str) -> CloudResult<&Bucket> {
        self.buckets
            .get(name)
            .ok_or_else(|| CloudError::not_found(bucket_id(name)))
    }

    fn bucket_mut(&mut self, name: &str) -> CloudResult<&mut Bucket> {
        self.buckets
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(bucket_id(name)))
    }

    fn object(&self, bucket: &str, key: &str) -> CloudResult<&StoredObject> {
        self.bucket(bucket)?
            .objects
            .get(key)
            .ok_or_else(|| CloudError::not_found(object_id(bucket, key)))
    }
}

fn bucket_id(name: &str) -> ResourceId {
    ResourceId::new("bucket", name)
}

fn object_id(bucket: &str, key: &str) -> ResourceId {
    ResourceId::new("object", key).within(bucket)
}

fn build_object(
    bucket: &str,
    key: &str,
    data: Vec<u8>,
    content_type: String,
    custom_metadata: BTreeMap<String, String>,
    now: TimestampMs,
) -> StoredObject {
    StoredObject {
        metadata: ObjectMetadata {
            bucket: bucket.to_string(),
            key: key.to_string(),
            size: data.len() as u64,
            content_type,
            content_hash: content_hash(&data),
            last_modified: now,
            custom_metadata,
        },
        data,
    }
}

// ============================================================================
// FakeObjectIO
// ============================================================================

#[derive(Clone)]
pub struct FakeObjectIO {
    store: Store<ObjectState>,
    env: SimEnv,
}

impl FakeObjectIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<ObjectState>, env: SimEnv) -> Self {
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<ObjectState> {
        self.store.clone()
    }

    /// Resolve a presigned GET URL the way an HTTP client would.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed, expired or non-GET URL and `NotFound` for a missing
    /// object
    pub fn fetch_presigned(&self, url: &str) -> CloudResult<StoredObject> {
        let locator = parse_presigned_url(url)?;
        if locator.method != UrlMethod::Get {
            return Err(CloudError::validation("presigned URL does not allow GET"));
        }
        let now = self.env.enter("object.fetch_presigned")?;
        if now >= locator.expires_at {
            return Err(CloudError::validation("presigned URL has expired"));
        }
        let state = self.store.lock();
        state.object(&locator.bucket, &locator.key).cloned()
    }

    /// Upload through a presigned PUT URL.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a malformed, expired or non-PUT URL and `NotFound` for a missing
    /// bucket
    pub fn upload_presigned(&self, url: &str, data: &[u8]) -> CloudResult<ObjectMetadata> {
        let locator = parse_presigned_url(url)?;
        if locator.method != UrlMethod::Put {
            return Err(CloudError::validation("presigned URL does not allow PUT"));
        }
        if self.env.now() >= locator.expires_at {
            return Err(CloudError::validation("presigned URL has expired"));
        }
        self.put_object(&locator.bucket, &locator.key, data, PutOptions::default())
    }
}

impl Default for FakeObjectIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeObjectIO {
    fn reset(&self) {
        *self.store.lock() = ObjectState::default();
    }
}

impl ObjectIO for FakeObjectIO {
    fn create_bucket(&self, bucket: &str) -> CloudResult<()> {
        validate_resource_name(bucket)?;
        self.env.enter("object.create_bucket")?;
        let mut state = self.store.lock();
        if state.buckets.contains_key(bucket) {
            return Err(CloudError::already_exists(bucket_id(bucket)));
        }
        state.buckets.insert(
            bucket.to_string(),
            Bucket {
                objects: BTreeMap::new(),
            },
        );
        info!(bucket, "bucket created");
        Ok(())
    }

    fn delete_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.env.enter("object.delete_bucket")?;
        let mut state = self.store.lock();
        let count = state.bucket(bucket)?.objects.len();
        if count > 0 {
            return Err(CloudError::conflict(format!(
                "bucket {bucket} still holds {count} object(s)"
            ))
            .with_resource(bucket_id(bucket)));
        }
        state.buckets.remove(bucket);
        info!(bucket, "bucket deleted");
        Ok(())
    }

    fn list_buckets(&self) -> CloudResult<Vec<String>> {
        self.env.enter("object.list_buckets")?;
        Ok(self.store.lock().buckets.keys().cloned().collect())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        data: &[u8],
        options: PutOptions,
    ) -> CloudResult<ObjectMetadata> {
        validate_key_path(key)?;
        let now = self.env.enter("object.put_object")?;
        let mut state = self.store.lock();
        let target = state.bucket_mut(bucket)?;
        let object = build_object(
            bucket,
            key,
            data.to_vec(),
            options
                .content_type
                .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
            options.metadata,
            now,
        );
        let metadata = object.metadata.clone();
        target.objects.insert(key.to_string(), object);
        debug!(bucket, key, size = metadata.size, "object stored");
        Ok(metadata)
    }

    fn get_object(&self, bucket: &str, key: &str) -> CloudResult<StoredObject> {
        self.env.enter("object.get_object")?;
        self.store.lock().object(bucket, key).cloned()
    }

    fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.env.enter("object.delete_object")?;
        let mut state = self.store.lock();
        if state.bucket_mut(bucket)?.objects.remove(key).is_some() {
            debug!(bucket, key, "object deleted");
        }
        Ok(())
    }

    fn list_objects(&self, bucket: &str, prefix: Option<&str>) -> CloudResult<Vec<ObjectMetadata>> {
        self.env.enter("object.list_objects")?;
        let state = self.store.lock();
        let prefix = prefix.unwrap_or_default();
        Ok(state
            .bucket(bucket)?
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, object)| object.metadata.clone())
            .collect())
    }

    fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> CloudResult<ObjectMetadata> {
        validate_key_path(dst_key)?;
        let now = self.env.enter("object.copy_object")?;
        let mut state = self.store.lock();
        let source = state.object(src_bucket, src_key)?;
        let copy = build_object(
            dst_bucket,
            dst_key,
            source.data.clone(),
            source.metadata.content_type.clone(),
            source.metadata.custom_metadata.clone(),
            now,
        );
        let metadata = copy.metadata.clone();
        state
            .bucket_mut(dst_bucket)?
            .objects
            .insert(dst_key.to_string(), copy);
        debug!(src_bucket, src_key, dst_bucket, dst_key, "object copied");
        Ok(metadata)
    }

    fn object_exists(&self, bucket: &str, key: &str) -> CloudResult<bool> {
        self.env.enter("object.object_exists")?;
        Ok(self.store.lock().bucket(bucket)?.objects.contains_key(key))
    }

    fn get_metadata(&self, bucket: &str, key: &str) -> CloudResult<ObjectMetadata> {
        self.env.enter("object.get_metadata")?;
        Ok(self.store.lock().object(bucket, key)?.metadata.clone())
    }

    fn presigned_url(
        &self,
        bucket: &str,
        key: &str,
        method: UrlMethod,
        expires_in: Duration,
    ) -> CloudResult<PresignedUrl> {
        validate_key_path(key)?;
        if !(MIN_PRESIGN_EXPIRY..=MAX_PRESIGN_EXPIRY).contains(&expires_in) {
            return Err(CloudError::validation(format!(
                "presigned URL expiry must be between {MIN_PRESIGN_EXPIRY:?} and {MAX_PRESIGN_EXPIRY:?}, got {expires_in:?}"
            )));
        }
        let now = self.env.enter("object.presigned_url")?;
        self.store.lock().bucket(bucket)?;
        let expires_at = now + duration_ms(expires_in);
        Ok(PresignedUrl {
            url: presigned_locator(bucket, key, method, expires_at),
            method,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn presigned_round_trip_and_expiry() {
        let clock = ManualClock::new();
        let objects = FakeObjectIO::with_env(SimEnv::manual(&clock));
        objects.create_bucket("assets").unwrap();

        let put = objects
            .presigned_url("assets", "logo.png", UrlMethod::Put, Duration::from_secs(60))
            .unwrap();
        objects.upload_presigned(&put.url, b"png").unwrap();
        assert!(objects.fetch_presigned(&put.url).is_err());

        let get = objects
            .presigned_url("assets", "logo.png", UrlMethod::Get, Duration::from_secs(60))
            .unwrap();
        assert_eq!(objects.fetch_presigned(&get.url).unwrap().data, b"png");

        clock.advance(Duration::from_secs(60));
        assert!(objects.fetch_presigned(&get.url).is_err());
    }

    #[test]
    fn prefix_listing_stops_at_first_non_match() {
        let objects = FakeObjectIO::new();
        objects.create_bucket("logs").unwrap();
        for key in ["a/1", "b/1", "b/2", "c/1"] {
            objects
                .put_object("logs", key, key.as_bytes(), PutOptions::default())
                .unwrap();
        }
        let keys: Vec<_> = objects
            .list_objects("logs", Some("b/"))
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        assert_eq!(keys, vec!["b/1", "b/2"]);
    }
}
