//! Hierarchical configuration parameters addressed by `/`-separated paths.

use super::Store;
use crate::clock::SimEnv;
use crate::testing::Resettable;
use crate::traits::{CloudError, CloudResult, ConfigIO, Parameter, ParameterBatch, ParameterKind, ResourceId};
use std::collections::BTreeMap;
use tracing::{debug, info};

const MAX_NAME_LEN: usize = 1011;
const MAX_VALUE_LEN: usize = 4096;

#[derive(Debug, Default)]
pub struct ConfigState {
    parameters: BTreeMap<String, Parameter>,
}

fn parameter_id(name: &str) -> ResourceId {
    ResourceId::new("parameter", name)
}

fn validate_name(name: &str) -> CloudResult<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(CloudError::validation(format!(
            "parameter name must be 1 to {MAX_NAME_LEN} characters"
        )));
    }
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "/_.-".contains(c));
    if !valid_chars || name.ends_with('/') || name.contains("//") {
        return Err(CloudError::validation(format!("invalid parameter name {name:?}")));
    }
    Ok(())
}

/// Normalise a lookup path to end with exactly one `/`.
fn path_prefix(path: &str) -> CloudResult<String> {
    if !path.starts_with('/') {
        return Err(CloudError::validation(format!(
            "parameter path {path:?} must start with '/'"
        )));
    }
    Ok(format!("{}/", path.trim_end_matches('/')))
}

#[derive(Clone)]
pub struct FakeConfigIO {
    store: Store<ConfigState>,
    env: SimEnv,
}

impl FakeConfigIO {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env(SimEnv::default())
    }

    #[must_use]
    pub fn with_env(env: SimEnv) -> Self {
        Self::with_store(Store::default(), env)
    }

    #[must_use]
    pub fn with_store(store: Store<ConfigState>, env: SimEnv) -> Self {
        Self { store, env }
    }

    #[must_use]
    pub fn store(&self) -> Store<ConfigState> {
        self.store.clone()
    }
}

impl Default for FakeConfigIO {
    fn default() -> Self {
        Self::new()
    }
}

impl Resettable for FakeConfigIO {
    fn reset(&self) {
        *self.store.lock() = ConfigState::default();
    }
}

impl ConfigIO for FakeConfigIO {
    fn put_parameter(
        &self,
        name: &str,
        value: &str,
        kind: ParameterKind,
        overwrite: bool,
    ) -> CloudResult<u64> {
        validate_name(name)?;
        if value.is_empty() || value.len() > MAX_VALUE_LEN {
            return Err(CloudError::validation(format!(
                "parameter value must be 1 to {MAX_VALUE_LEN} bytes"
            )));
        }
        let now = self.env.enter("config.put_parameter")?;
        let mut state = self.store.lock();
        let version = match state.parameters.get(name) {
            Some(_) if !overwrite => return Err(CloudError::already_exists(parameter_id(name))),
            Some(existing) => existing.version + 1,
            None => 1,
        };
        state.parameters.insert(
            name.to_string(),
            Parameter {
                name: name.to_string(),
                value: value.to_string(),
                kind,
                version,
                last_modified: now,
            },
        );
        info!(parameter = name, version, "parameter stored");
        Ok(version)
    }

    fn get_parameter(&self, name: &str) -> CloudResult<Parameter> {
        self.env.enter("config.get_parameter")?;
        self.store
            .lock()
            .parameters
            .get(name)
            .cloned()
            .ok_or_else(|| CloudError::not_found(parameter_id(name)))
    }

    fn get_parameters(&self, names: &[String]) -> CloudResult<ParameterBatch> {
        self.env.enter("config.get_parameters")?;
        let state = self.store.lock();
        let mut batch = ParameterBatch::default();
        for name in names {
            match state.parameters.get(name) {
                Some(parameter) => batch.found.push(parameter.clone()),
                None => batch.missing.push(name.clone()),
            }
        }
        debug!(found = batch.found.len(), missing = batch.missing.len(), "parameters fetched");
        Ok(batch)
    }

    fn get_parameters_by_path(&self, path: &str, recursive: bool) -> CloudResult<Vec<Parameter>> {
        let prefix = path_prefix(path)?;
        self.env.enter("config.get_parameters_by_path")?;
        let state = self.store.lock();
        Ok(state
            .parameters
            .range(prefix.clone()..)
            .take_while(|(name, _)| name.starts_with(&prefix))
            .filter(|(name, _)| recursive || !name[prefix.len()..].contains('/'))
            .map(|(_, parameter)| parameter.clone())
            .collect())
    }

    fn delete_parameter(&self, name: &str) -> CloudResult<()> {
        self.env.enter("config.delete_parameter")?;
        self.store
            .lock()
            .parameters
            .remove(name)
            .ok_or_else(|| CloudError::not_found(parameter_id(name)))?;
        info!(parameter = name, "parameter deleted");
        Ok(())
    }

    fn list_parameters(&self, prefix: Option<&str>) -> CloudResult<Vec<String>> {
        self.env.enter("config.list_parameters")?;
        let prefix = prefix.unwrap_or_default();
        Ok(self
            .store
            .lock()
            .parameters
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}
