//! # cloudsim
//!
//! **Provider-agnostic cloud service contracts** with an in-memory simulation engine.
//! Application code is written once against eleven `*IO` traits; in tests (or local runs) a
//! [`CloudProvider`] backed by in-memory engines stands in for a real vendor.
//!
//! ## Key Features
//!
//! - **Eleven services** - queues, documents, relational SQL, event bus, objects, notifications,
//!   secrets, configuration parameters, authentication, hosting and batch jobs
//! - **Deterministic time** - every engine reads a [`Clock`]; [`ManualClock`] drives visibility
//!   timeouts, delays, TTLs and token expiry without sleeping
//! - **Fault injection** - make chosen operations fail with retryable errors
//! - **One error taxonomy** - every failure is a [`CloudError`] with one of four [`ErrorKind`]s
//! - **Contract checks** - the same behavioral suite runs against fakes and real adapters
//!
//! ## Quick Start
//!
//! ```
//! use cloudsim::*;
//! use std::time::Duration;
//!
//! # fn main() -> anyhow::Result<()> {
//! let clock = ManualClock::new();
//! let (cloud, _fakes) = CloudProvider::memory_with_clock(&SimulationConfig::default(), &clock);
//!
//! cloud.queues.create_queue(
//!     "jobs",
//!     QueueConfig::default().with_visibility_timeout(Duration::from_secs(30)),
//! )?;
//! cloud.queues.send("jobs", OutgoingMessage::text("resize image 42"))?;
//!
//! let first = cloud.queues.receive("jobs", ReceiveOptions::default())?;
//! assert_eq!(first[0].receive_count, 1);
//!
//! // Not acknowledged: the message comes back once its visibility timeout has passed.
//! clock.advance(Duration::from_secs(31));
//! let second = cloud.queues.receive("jobs", ReceiveOptions::default())?;
//! assert_eq!(second[0].receive_count, 2);
//! cloud.queues.acknowledge("jobs", &second[0].receipt_handle)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Configuration
//!
//! [`ProviderConfig`] is an internally tagged serde enum, loadable from JSON, a file or
//! `CLOUDSIM_*` environment variables. [`CloudProvider::from_config`] builds the facade; the
//! `external` variant is handed to an [`AdapterFactory`](provider::AdapterFactory).
//!
//! ## Module Overview
//!
//! - [`traits`] - The `*IO` service contracts, their data types and [`CloudError`]
//! - [`fake`] - In-memory engines implementing every contract
//! - [`clock`] - [`SystemClock`], [`ManualClock`] and the per-engine [`SimEnv`]
//! - [`provider`] - The [`CloudProvider`] facade and [`FakeServices`] handles
//! - [`settings`] - [`SimulationConfig`] and [`ProviderConfig`]
//! - [`testing`] - Fault injection, reset, assertions and contract checks
//! - [`helpers`] - Retry with backoff, batching, naming rules, hashing

pub mod clock;
pub mod fake;
pub mod helpers;
pub mod provider;
pub mod settings;
pub mod testing;
pub mod traits;

// General re-exports
pub use clock::{Clock, ManualClock, SimEnv, SystemClock, TimestampMs};
pub use provider::{CloudProvider, FakeServices};
pub use settings::{ProviderConfig, SimulationConfig};
pub use traits::*;
