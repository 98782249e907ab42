// Integration tests for loading provider configuration from files and variables.

use anyhow::Result;
use cloudsim::settings::ClockMode;
use cloudsim::{ProviderConfig, SimulationConfig};
use std::collections::BTreeMap;
use std::io::Write;
use std::time::Duration;

fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_config_from_file() -> Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    write!(
        file,
        r#"{{
            "provider": "memory",
            "clock": "manual",
            "start_time_ms": 0,
            "token_ttl_secs": 900
        }}"#
    )?;

    let ProviderConfig::Memory(sim) = ProviderConfig::from_file(file.path())? else {
        anyhow::bail!("expected the memory provider");
    };
    assert_eq!(sim.clock, ClockMode::Manual);
    assert_eq!(sim.start_time_ms, Some(0));
    assert_eq!(sim.token_ttl(), Duration::from_secs(900));
    assert_eq!(sim.latency_ms, SimulationConfig::default().latency_ms);
    Ok(())
}

#[test]
fn test_file_errors_name_the_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let missing = dir.path().join("absent.json");
    let err = ProviderConfig::from_file(&missing).expect_err("missing file must fail");
    assert!(format!("{err:#}").contains("absent.json"));

    let broken = dir.path().join("broken.json");
    std::fs::write(&broken, r#"{ "provider": "memory", "latency_ms": "fast" }"#)?;
    let err = ProviderConfig::from_file(&broken).expect_err("bad value must fail");
    let message = format!("{err:#}");
    assert!(message.contains("broken.json"));
    assert!(message.contains("invalid provider configuration"));
    Ok(())
}

#[test]
fn test_variables_are_typed_per_field() -> Result<()> {
    let config = ProviderConfig::from_vars(vars(&[
        ("clock", "manual"),
        ("latency_ms", "15"),
        ("batch_start_delay_ms", "2000"),
    ]))?;
    assert_eq!(
        config,
        ProviderConfig::Memory(SimulationConfig {
            clock: ClockMode::Manual,
            latency_ms: 15,
            batch_start_delay_ms: 2000,
            ..SimulationConfig::default()
        })
    );

    assert_eq!(ProviderConfig::from_vars(BTreeMap::new())?, ProviderConfig::default());
    Ok(())
}

#[test]
fn test_external_provider_from_variables() -> Result<()> {
    let config = ProviderConfig::from_vars(vars(&[
        ("provider", "external"),
        ("vendor", "acme"),
        ("region", "eu-1"),
    ]))?;
    let ProviderConfig::External(external) = config else {
        anyhow::bail!("expected the external provider");
    };
    assert_eq!(external.vendor, "acme");
    assert_eq!(external.region.as_deref(), Some("eu-1"));
    assert!(external.options.is_empty());
    Ok(())
}

#[test]
fn test_invalid_provider_settings() {
    assert!(ProviderConfig::from_vars(vars(&[("provider", "mainframe")])).is_err());
    assert!(ProviderConfig::from_vars(vars(&[("provider", "external")])).is_err());
    assert!(ProviderConfig::from_vars(vars(&[("clock", "sundial")])).is_err());
    assert!(ProviderConfig::from_json("not json").is_err());
}
