//! Provider selection and simulation tuning.
//!
//! Configuration is plain serde data. It can come from a JSON string, a JSON file or
//! `CLOUDSIM_*` environment variables:
//!
//! ```
//! use cloudsim::settings::{ClockMode, ProviderConfig};
//!
//! let config = ProviderConfig::from_json(r#"{ "provider": "memory", "clock": "manual", "latency_ms": 5 }"#)?;
//! let ProviderConfig::Memory(sim) = config else { unreachable!() };
//! assert_eq!(sim.clock, ClockMode::Manual);
//! assert_eq!(sim.latency_ms, 5);
//! # anyhow::Result::<()>::Ok(())
//! ```

use crate::helpers::config_from_env;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Prefix of the environment variables read by [`ProviderConfig::from_env`].
pub const ENV_PREFIX: &str = "CLOUDSIM_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    #[default]
    System,
    Manual,
}

/// Tuning for the in-memory provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub clock: ClockMode,
    /// Start of a manual clock; `None` means 2024-01-01T00:00:00Z.
    pub start_time_ms: Option<i64>,
    /// Artificial latency added to every operation.
    pub latency_ms: u64,
    /// Lifetime of issued access tokens.
    pub token_ttl_secs: u64,
    /// Delay between submitting a batch job and its earliest start.
    pub batch_start_delay_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clock: ClockMode::System,
            start_time_ms: None,
            latency_ms: 0,
            token_ttl_secs: 3600,
            batch_start_delay_ms: 0,
        }
    }
}

impl SimulationConfig {
    #[must_use]
    pub const fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    #[must_use]
    pub const fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }

    #[must_use]
    pub const fn batch_start_delay(&self) -> Duration {
        Duration::from_millis(self.batch_start_delay_ms)
    }
}

/// Connection details handed to an external adapter factory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalConfig {
    pub vendor: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Which provider backs the facade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum ProviderConfig {
    Memory(SimulationConfig),
    External(ExternalConfig),
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::Memory(SimulationConfig::default())
    }
}

impl ProviderConfig {
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or names an unknown provider
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("invalid provider configuration")
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a valid configuration
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Read `CLOUDSIM_*` variables. Without `CLOUDSIM_PROVIDER` the memory provider is used.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable holds a value of the wrong shape
    pub fn from_env() -> Result<Self> {
        Self::from_vars(config_from_env(ENV_PREFIX))
    }

    /// Build from already-collected variables, keyed by lowercase field name.
    ///
    /// Numbers and booleans are parsed; everything else is kept as a string.
    ///
    /// # Errors
    ///
    /// Returns an error if a value has the wrong shape for its field
    pub fn from_vars(vars: BTreeMap<String, String>) -> Result<Self> {
        let mut fields = Map::new();
        fields.insert("provider".to_string(), Value::from("memory"));
        for (key, raw) in vars {
            let value = match serde_json::from_str::<Value>(&raw) {
                Ok(parsed @ (Value::Number(_) | Value::Bool(_))) => parsed,
                _ => Value::String(raw),
            };
            fields.insert(key, value);
        }
        serde_json::from_value(Value::Object(fields)).context("invalid CLOUDSIM_* environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_defaults_fill_missing_fields() {
        let config = ProviderConfig::from_json(r#"{ "provider": "memory" }"#).unwrap();
        assert_eq!(config, ProviderConfig::default());
    }

    #[test]
    fn external_is_tagged() {
        let config =
            ProviderConfig::from_json(r#"{ "provider": "external", "vendor": "acme", "region": "eu-1" }"#)
                .unwrap();
        let ProviderConfig::External(external) = config else {
            panic!("expected external");
        };
        assert_eq!(external.vendor, "acme");
        assert_eq!(external.region.as_deref(), Some("eu-1"));
    }

    #[test]
    fn unknown_provider_is_an_error() {
        assert!(ProviderConfig::from_json(r#"{ "provider": "mainframe" }"#).is_err());
    }

    #[test]
    fn vars_are_typed() {
        let vars = BTreeMap::from([
            ("clock".to_string(), "manual".to_string()),
            ("latency_ms".to_string(), "25".to_string()),
        ]);
        let ProviderConfig::Memory(sim) = ProviderConfig::from_vars(vars).unwrap() else {
            panic!("expected memory");
        };
        assert_eq!(sim.clock, ClockMode::Manual);
        assert_eq!(sim.latency(), Duration::from_millis(25));

        let bad = BTreeMap::from([("latency_ms".to_string(), "soon".to_string())]);
        assert!(ProviderConfig::from_vars(bad).is_err());
    }
}
