//! One facade over all eleven services.
//!
//! A [`CloudProvider`] is built once from a [`ProviderConfig`]. The `memory` variant wires the
//! in-memory engines together (notifications and events deliver into the same queues, every
//! engine shares one clock and one fault injector); the `external` variant is handed to a
//! caller-supplied [`AdapterFactory`].

use crate::clock::{Clock, MANUAL_EPOCH_MS, ManualClock, SimEnv, SystemClock};
use crate::fake::{
    FakeAuthIO, FakeBatchIO, FakeConfigIO, FakeDatabaseIO, FakeDocumentIO, FakeEventBusIO,
    FakeHostingIO, FakeNotificationIO, FakeObjectIO, FakeQueueIO, FakeSecretsIO,
};
use crate::settings::{ClockMode, ExternalConfig, ProviderConfig, SimulationConfig};
use crate::testing::{FaultInjector, Resettable};
use crate::traits::{
    AuthIO, BatchIO, CloudError, CloudResult, ConfigIO, DatabaseIO, DocumentIO, EventBusIO,
    HostingIO, NotificationIO, ObjectIO, QueueIO, SecretsIO,
};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Builds vendor-backed services for the `external` provider.
pub trait AdapterFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if the adapters cannot be constructed from `config`
    fn build(&self, config: &ExternalConfig) -> CloudResult<CloudProvider>;
}

/// The services an application talks to.
#[derive(Clone)]
pub struct CloudProvider {
    pub hosting: Arc<dyn HostingIO>,
    pub batch: Arc<dyn BatchIO>,
    pub secrets: Arc<dyn SecretsIO>,
    pub config: Arc<dyn ConfigIO>,
    pub documents: Arc<dyn DocumentIO>,
    pub database: Arc<dyn DatabaseIO>,
    pub objects: Arc<dyn ObjectIO>,
    pub queues: Arc<dyn QueueIO>,
    pub events: Arc<dyn EventBusIO>,
    pub notifications: Arc<dyn NotificationIO>,
    pub auth: Arc<dyn AuthIO>,
}

impl fmt::Debug for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudProvider").finish_non_exhaustive()
    }
}

impl CloudProvider {
    /// In-memory provider. A manual clock configured here can only be moved through latency;
    /// use [`memory_with_clock`](Self::memory_with_clock) to drive time from a test.
    #[must_use]
    pub fn memory(config: &SimulationConfig) -> Self {
        let clock: Arc<dyn Clock> = match config.clock {
            ClockMode::System => Arc::new(SystemClock),
            ClockMode::Manual => Arc::new(ManualClock::starting_at(
                config.start_time_ms.unwrap_or(MANUAL_EPOCH_MS),
            )),
        };
        Self::from_fakes(&FakeServices::new(SimEnv::new(clock), config))
    }

    /// In-memory provider on a caller-held clock, plus typed handles to its engines.
    #[must_use]
    pub fn memory_with_clock(config: &SimulationConfig, clock: &ManualClock) -> (Self, FakeServices) {
        let fakes = FakeServices::new(SimEnv::manual(clock), config);
        (Self::from_fakes(&fakes), fakes)
    }

    /// # Errors
    ///
    /// Returns `Validation` for an `external` config without a factory, or the factory's error
    pub fn from_config(
        config: &ProviderConfig,
        factory: Option<&dyn AdapterFactory>,
    ) -> CloudResult<Self> {
        match config {
            ProviderConfig::Memory(sim) => {
                info!(clock = ?sim.clock, latency_ms = sim.latency_ms, "using in-memory provider");
                Ok(Self::memory(sim))
            }
            ProviderConfig::External(external) => {
                let factory = factory.ok_or_else(|| {
                    CloudError::validation(format!(
                        "no adapter factory supplied for external provider {}",
                        external.vendor
                    ))
                })?;
                info!(vendor = %external.vendor, region = ?external.region, "using external provider");
                factory.build(external)
            }
        }
    }

    /// Facade over existing engines; the engines keep sharing state with `fakes`.
    #[must_use]
    pub fn from_fakes(fakes: &FakeServices) -> Self {
        Self {
            hosting: Arc::new(fakes.hosting.clone()),
            batch: Arc::new(fakes.batch.clone()),
            secrets: Arc::new(fakes.secrets.clone()),
            config: Arc::new(fakes.config.clone()),
            documents: Arc::new(fakes.documents.clone()),
            database: Arc::new(fakes.database.clone()),
            objects: Arc::new(fakes.objects.clone()),
            queues: Arc::new(fakes.queues.clone()),
            events: Arc::new(fakes.events.clone()),
            notifications: Arc::new(fakes.notifications.clone()),
            auth: Arc::new(fakes.auth.clone()),
        }
    }
}

/// Concrete engines behind an in-memory provider, for test-only hooks.
#[derive(Clone)]
pub struct FakeServices {
    pub hosting: FakeHostingIO,
    pub batch: FakeBatchIO,
    pub secrets: FakeSecretsIO,
    pub config: FakeConfigIO,
    pub documents: FakeDocumentIO,
    pub database: FakeDatabaseIO,
    pub objects: FakeObjectIO,
    pub queues: FakeQueueIO,
    pub events: FakeEventBusIO,
    pub notifications: FakeNotificationIO,
    pub auth: FakeAuthIO,
    pub faults: FaultInjector,
    pub env: SimEnv,
}

impl FakeServices {
    /// Engines sharing `env`'s clock and fault injector, with cross-service delivery wired up.
    #[must_use]
    pub fn new(env: SimEnv, config: &SimulationConfig) -> Self {
        let env = env.with_latency(config.latency());
        let faults = env.faults().clone();
        let queues = FakeQueueIO::with_env(env.clone());
        let notifications = FakeNotificationIO::with_env(env.clone()).with_queues(queues.clone());
        let events = FakeEventBusIO::with_env(env.clone())
            .with_queues(queues.clone())
            .with_topics(notifications.clone());

        Self {
            hosting: FakeHostingIO::with_env(env.clone()),
            batch: FakeBatchIO::with_env(env.clone()).with_start_delay(config.batch_start_delay()),
            secrets: FakeSecretsIO::with_env(env.clone()),
            config: FakeConfigIO::with_env(env.clone()),
            documents: FakeDocumentIO::with_env(env.clone()),
            database: FakeDatabaseIO::with_env(env.clone()),
            objects: FakeObjectIO::with_env(env.clone()),
            queues,
            events,
            notifications,
            auth: FakeAuthIO::with_env(env.clone()).with_token_ttl(config.token_ttl()),
            faults,
            env,
        }
    }

    /// Drop every resource in every engine and disarm all faults.
    pub fn reset_all(&self) {
        self.hosting.reset();
        self.batch.reset();
        self.secrets.reset();
        self.config.reset();
        self.documents.reset();
        self.database.reset();
        self.objects.reset();
        self.queues.reset();
        self.events.reset();
        self.notifications.reset();
        self.auth.reset();
        self.faults.clear();
    }
}

impl Resettable for FakeServices {
    fn reset(&self) {
        self.reset_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ErrorKind;

    #[test]
    fn external_without_factory_is_rejected() {
        let config = ProviderConfig::External(ExternalConfig {
            vendor: "acme".to_string(),
            region: None,
            options: Default::default(),
        });
        let err = CloudProvider::from_config(&config, None).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
    }

    #[test]
    fn engines_share_one_fault_injector() {
        let clock = ManualClock::new();
        let (provider, fakes) = CloudProvider::memory_with_clock(&SimulationConfig::default(), &clock);
        fakes.faults.fail_next("secrets.*", 1);
        let err = provider.secrets.list_secrets(None).unwrap_err();
        assert!(err.is_retryable());
        assert!(provider.secrets.list_secrets(None).is_ok());
    }
}
