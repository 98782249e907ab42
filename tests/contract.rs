// The shared behavioral checks, run against the in-memory provider in both clock modes.

mod common;

use cloudsim::settings::ClockMode;
use cloudsim::testing::contract;
use cloudsim::{Clock, CloudProvider, SimulationConfig};

#[test]
fn test_contract_on_system_clock() {
    common::init_tracing();
    contract::check_all(&CloudProvider::memory(&SimulationConfig::default()));
}

#[test]
fn test_contract_on_manual_clock_with_latency() {
    let config = SimulationConfig {
        clock: ClockMode::Manual,
        latency_ms: 5,
        ..SimulationConfig::default()
    };
    let (clock, provider, _) = common::simulated_with(&config);
    let start = clock.now();
    contract::check_all(&provider);
    assert!(clock.now() > start);
}

#[test]
fn test_contract_can_run_twice_on_one_provider() {
    let (_, provider, _) = common::simulated();
    contract::check_all(&provider);
    contract::check_all(&provider);
}
