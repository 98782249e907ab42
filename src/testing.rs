//! Test support for code written against the cloud service contracts.
//!
//! - **Faults**: [`FaultInjector`] makes chosen operations fail with `Unavailable`
//! - **Reset**: [`Resettable`] clears an engine between tests
//! - **Assertions**: error-kind checks with readable panic messages
//! - **Contract**: [`contract`] holds behavioral checks that any `*IO` implementation,
//!   fake or real, is expected to pass
//!
//! # Quick Start
//!
//! ```
//! use cloudsim::testing::*;
//! use cloudsim::{CloudProvider, ManualClock, SimulationConfig};
//!
//! let clock = ManualClock::new();
//! let (provider, fakes) = CloudProvider::memory_with_clock(&SimulationConfig::default(), &clock);
//! fakes.faults.fail_next("queue.send", 1);
//! contract::check_object_contract(provider.objects.as_ref());
//! ```

pub mod assertions;
pub mod contract;
pub mod faults;

pub use assertions::*;
pub use faults::FaultInjector;

/// Drop every resource held by an engine, as if it had just been constructed.
pub trait Resettable {
    fn reset(&self);
}
