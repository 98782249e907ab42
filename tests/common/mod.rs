// Shared setup for the integration tests.
#![allow(dead_code)]

use cloudsim::{CloudProvider, FakeServices, ManualClock, SimulationConfig};
use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route engine logs to the test output. Filter with `RUST_LOG=cloudsim=debug`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// An in-memory provider on a fresh manual clock.
pub fn simulated() -> (ManualClock, CloudProvider, FakeServices) {
    simulated_with(&SimulationConfig::default())
}

pub fn simulated_with(config: &SimulationConfig) -> (ManualClock, CloudProvider, FakeServices) {
    init_tracing();
    let clock = ManualClock::new();
    let (cloud, fakes) = CloudProvider::memory_with_clock(config, &clock);
    (clock, cloud, fakes)
}
