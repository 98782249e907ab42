//! Versioned secrets. Every write appends a version; old versions stay readable.

use super::Store;
use crate::clock::{SimEnv, TimestampMs};
use crate::helpers::validate_resource_name;
use crate::testing::Resettable;
use crate::traits::{CloudError, CloudResult, ResourceId, Secret, SecretsIO};
use std::collections::BTreeMap;
use tracing::info;

#[derive(Debug)]
struct StoredSecret {
    created_at: TimestampMs,
    versions: Vec<(String, TimestampMs)>,
}

impl StoredSecret {
    fn version(&self, name: &str, version: u32) -> Option<Secret> {
        let index = usize::try_from(version).ok()?.checked_sub(1)?;
        let (value, updated_at) = self.versions.get(index)?;
        Some(Secret {
            name: name.to_string(),
            value: value.clone(),
            version,
            created_at: self.created_at,
            updated_at: *updated_at,
        })
    }

    fn latest(&self, name: &str) -> Option<Secret> {
        u32::try_from(self.versions.len())
            .ok()
            .and_then(|v| self.version(name, v))
    }
}

#[derive(Debug, Default)]
pub struct SecretsState {
    secrets: BTreeMap<String, StoredSecret>,
}

fn secret_id(name: &str) -> ResourceId {
    ResourceId::new("secret", name)
}

#[derive(Clone)]
pub struct FakeSecretsIO {
    store: Store<SecretsState>,
    env: SimEnv,
}

impl FakeSecretsIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<SecretsState>, env: SimEnv) -> Self {
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<SecretsState> {
        self.store.clone()
    }
}

impl Default for FakeSecretsIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeSecretsIO {
    fn reset(&self) {
        *self.store.lock() = SecretsState::default();
    }
}

impl SecretsIO for FakeSecretsIO {
    fn create_secret(&self, name: &str, value: &str) -> CloudResult<Secret> {
        validate_resource_name(name)?;
        let now = self.env.enter("secrets.create_secret")?;
        let mut state = self.store.lock();
        if state.secrets.contains_key(name) {
            return Err(CloudError::already_exists(secret_id(name)));
        }
        let secret = StoredSecret {
            created_at: now,
            versions: vec![(value.to_string(), now)],
        };
        let created = secret
            .latest(name)
            .ok_or_else(|| CloudError::validation("secret has no versions"))?;
        state.secrets.insert(name.to_string(), secret);
        info!(secret = name, "secret created");
        Ok(created)
    }

    fn get_secret(&self, name: &str, version: Option<u32>) -> CloudResult<Secret> {
        self.env.enter("secrets.get_secret")?;
        let state = self.store.lock();
        let secret = state
            .secrets
            .get(name)
            .ok_or_else(|| CloudError::not_found(secret_id(name)))?;
        match version {
            None => secret.latest(name),
            Some(v) => secret.version(name, v),
        }
        .ok_or_else(|| {
            CloudError::not_found(
                ResourceId::new("secret_version", version.unwrap_or_default().to_string())
                    .within(name),
            )
        })
    }

    fn put_secret_value(&self, name: &str, value: &str) -> CloudResult<Secret> {
        let now = self.env.enter("secrets.put_secret_value")?;
        let mut state = self.store.lock();
        let secret = state
            .secrets
            .get_mut(name)
            .ok_or_else(|| CloudError::not_found(secret_id(name)))?;
        secret.versions.push((value.to_string(), now));
        let latest = secret
            .latest(name)
            .ok_or_else(|| CloudError::validation("secret version overflow"))?;
        info!(secret = name, version = latest.version, "secret rotated");
        Ok(latest)
    }

    fn delete_secret(&self, name: &str) -> CloudResult<()> {
        self.env.enter("secrets.delete_secret")?;
        self.store
            .lock()
            .secrets
            .remove(name)
            .ok_or_else(|| CloudError::not_found(secret_id(name)))?;
        info!(secret = name, "secret deleted");
        Ok(())
    }

    fn list_secrets(&self, prefix: Option<&str>) -> CloudResult<Vec<String>> {
        self.env.enter("secrets.list_secrets")?;
        let prefix = prefix.unwrap_or_default();
        Ok(self
            .store
            .lock()
            .secrets
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}
