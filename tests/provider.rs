// Integration tests for provider selection, shared wiring and reset.

mod common;

use anyhow::Result;
use cloudsim::provider::AdapterFactory;
use cloudsim::settings::{ClockMode, ExternalConfig};
use cloudsim::testing::{assert_error_kind, assert_names};
use cloudsim::*;
use common::simulated;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Stands in for a vendor adapter crate: records what it was asked to build.
#[derive(Default)]
struct RecordingFactory {
    built: Mutex<Vec<ExternalConfig>>,
}

impl AdapterFactory for RecordingFactory {
    fn build(&self, config: &ExternalConfig) -> CloudResult<CloudProvider> {
        if config.vendor != "acme" {
            return Err(CloudError::validation(format!("unsupported vendor {}", config.vendor)));
        }
        if let Ok(mut built) = self.built.lock() {
            built.push(config.clone());
        }
        Ok(CloudProvider::memory(&SimulationConfig::default()))
    }
}

fn external(vendor: &str) -> ProviderConfig {
    ProviderConfig::External(ExternalConfig {
        vendor: vendor.to_string(),
        region: Some("eu-1".to_string()),
        options: BTreeMap::from([("endpoint".to_string(), "https://acme.test".to_string())]),
    })
}

#[test]
fn test_memory_config_builds_working_services() -> Result<()> {
    let config = ProviderConfig::Memory(SimulationConfig {
        clock: ClockMode::Manual,
        start_time_ms: Some(1_700_000_000_000),
        ..SimulationConfig::default()
    });
    let cloud = CloudProvider::from_config(&config, None)?;

    cloud.queues.create_queue("stamped", QueueConfig::default())?;
    cloud.events.put_rule(
        "default",
        EventRule::new("all", EventPattern::any()).with_target(Target::queue("q", "stamped")),
    )?;
    cloud
        .events
        .publish("default", Event::new("clock.test", "Tick", json!({})))?;

    // The manual clock starts where the config says.
    let received = cloud.queues.receive("stamped", ReceiveOptions::default())?;
    assert_eq!(received[0].body["time"], "2023-11-14T22:13:20.000Z");
    Ok(())
}

#[test]
fn test_external_config_goes_to_the_factory() -> Result<()> {
    let factory = RecordingFactory::default();
    let cloud = CloudProvider::from_config(&external("acme"), Some(&factory))?;
    cloud.secrets.create_secret("api-key", "k")?;

    let built = factory
        .built
        .lock()
        .map_err(|_| anyhow::anyhow!("factory lock poisoned"))?;
    assert_eq!(built.len(), 1);
    assert_eq!(built[0].region.as_deref(), Some("eu-1"));
    assert_eq!(built[0].options["endpoint"], "https://acme.test");
    drop(built);

    assert_error_kind(
        &CloudProvider::from_config(&external("globex"), Some(&factory)),
        ErrorKind::Validation,
    );
    assert_error_kind(
        &CloudProvider::from_config(&external("acme"), None),
        ErrorKind::Validation,
    );
    Ok(())
}

#[test]
fn test_facades_over_the_same_engines_share_state() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    let other = CloudProvider::from_fakes(&fakes);

    cloud.objects.create_bucket("shared")?;
    other
        .objects
        .put_object("shared", "k", b"v", PutOptions::default())?;
    assert!(cloud.objects.object_exists("shared", "k")?);

    fakes.faults.fail_next("object.*", 1);
    assert_error_kind(&other.objects.list_buckets(), ErrorKind::Unavailable);
    assert_names(&cloud.objects.list_buckets(), &["shared"]);
    Ok(())
}

#[test]
fn test_reset_all_clears_resources_and_faults() -> Result<()> {
    let (_, cloud, fakes) = simulated();
    cloud.queues.create_queue("jobs", QueueConfig::default())?;
    cloud.secrets.create_secret("token", "t")?;
    cloud
        .database
        .execute("CREATE TABLE notes (id INTEGER PRIMARY KEY, body TEXT)", &[])?;
    cloud.auth.sign_up(SignUp::new("ada", "correct horse"))?;
    fakes.faults.fail_always("hosting.*");

    fakes.reset_all();

    assert_names(&cloud.queues.list_queues(None), &[]);
    assert_names(&cloud.secrets.list_secrets(None), &[]);
    assert_names(&cloud.database.list_tables(), &[]);
    assert!(cloud.auth.list_users()?.is_empty());
    assert!(cloud.hosting.list_apps()?.is_empty());
    assert_names(
        &cloud
            .events
            .list_event_buses()
            .map(|buses| buses.into_iter().map(|b| b.name).collect()),
        &["default"],
    );

    // Resources can be recreated under the same names.
    cloud.queues.create_queue("jobs", QueueConfig::default())?;
    cloud.secrets.create_secret("token", "t")?;
    Ok(())
}

#[test]
fn test_latency_is_charged_to_the_shared_clock() -> Result<()> {
    let config = SimulationConfig {
        latency_ms: 250,
        ..SimulationConfig::default()
    };
    let (clock, cloud, _) = common::simulated_with(&config);
    let start = clock.now();

    cloud.secrets.create_secret("slow", "v")?;
    cloud.config.put_parameter("/slow", "v", ParameterKind::String, false)?;
    let secret = cloud.secrets.get_secret("slow", None)?;

    assert_eq!(clock.now(), start + 750);
    assert_eq!(secret.created_at, start + 250);
    Ok(())
}
