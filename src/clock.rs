//! Time sources and the per-engine simulation environment.
//!
//! Every engine reads time through a [`Clock`]. Tests use [`ManualClock`] so that visibility
//! timeouts, delays, TTLs and token expiry can be driven deterministically, and registered
//! [`Sweep`]ers run expiry eagerly whenever the clock moves.

use crate::testing::FaultInjector;
use crate::traits::CloudResult;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tracing::trace;

/// Milliseconds since UNIX epoch (UTC).
pub type TimestampMs = i64;

/// 2024-01-01T00:00:00Z, the starting point of a default [`ManualClock`].
pub const MANUAL_EPOCH_MS: TimestampMs = 1_704_067_200_000;

#[must_use]
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Something that drops expired state when the clock reaches `now`.
pub trait Sweep: Send + Sync {
    fn sweep(&self, now: TimestampMs);
}

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> TimestampMs;

    /// Block (or, for simulated clocks, advance) for `duration`.
    fn pause(&self, duration: Duration);

    /// Register a sweeper to run on every clock movement. Wall clocks ignore it.
    fn register_sweeper(&self, _sweeper: Weak<dyn Sweep>) {}
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> TimestampMs {
        chrono::Utc::now().timestamp_millis()
    }

    fn pause(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<ManualInner>,
}

#[derive(Debug)]
struct ManualInner {
    now: AtomicI64,
    sweepers: Mutex<Vec<Weak<dyn Sweep>>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(MANUAL_EPOCH_MS)
    }
}

impl ManualClock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn starting_at(now: TimestampMs) -> Self {
        Self {
            inner: Arc::new(ManualInner {
                now: AtomicI64::new(now),
                sweepers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Move time forward and run every live sweeper.
    pub fn advance(&self, duration: Duration) {
        let now = self
            .inner
            .now
            .fetch_add(duration_ms(duration), Ordering::SeqCst)
            + duration_ms(duration);
        self.run_sweepers(now);
    }

    /// Jump to an absolute time. Moving backwards is allowed but never un-expires anything.
    pub fn set(&self, now: TimestampMs) {
        self.inner.now.store(now, Ordering::SeqCst);
        self.run_sweepers(now);
    }

    fn run_sweepers(&self, now: TimestampMs) {
        // Collect strong refs first: sweepers take engine locks and must not run under ours.
        let live: Vec<Arc<dyn Sweep>> = {
            let mut sweepers = self
                .inner
                .sweepers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            sweepers.retain(|s| s.strong_count() > 0);
            sweepers.iter().filter_map(Weak::upgrade).collect()
        };
        trace!(now, sweepers = live.len(), "manual clock moved");
        for sweeper in live {
            sweeper.sweep(now);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> TimestampMs {
        self.inner.now.load(Ordering::SeqCst)
    }

    fn pause(&self, duration: Duration) {
        self.advance(duration);
    }

    fn register_sweeper(&self, sweeper: Weak<dyn Sweep>) {
        self.inner
            .sweepers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sweeper);
    }
}

/// Clock, artificial latency and fault injection shared by an engine.
#[derive(Debug, Clone)]
pub struct SimEnv {
    clock: Arc<dyn Clock>,
    latency: Duration,
    faults: FaultInjector,
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl SimEnv {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            latency: Duration::ZERO,
            faults: FaultInjector::new(),
        }
    }

    /// Environment driven by a (shared) manual clock.
    #[must_use]
    pub fn manual(clock: &ManualClock) -> Self {
        Self::new(Arc::new(clock.clone()))
    }

    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    #[must_use]
    pub fn with_faults(mut self, faults: FaultInjector) -> Self {
        self.faults = faults;
        self
    }

    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    #[must_use]
    pub const fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    #[must_use]
    pub fn now(&self) -> TimestampMs {
        self.clock.now()
    }

    pub fn register_sweeper(&self, sweeper: Weak<dyn Sweep>) {
        self.clock.register_sweeper(sweeper);
    }

    /// Called at the start of every operation, before any engine lock is taken.
    ///
    /// # Errors
    ///
    /// Returns the injected failure if the fault injector has one armed for `operation`
    pub fn enter(&self, operation: &str) -> CloudResult<TimestampMs> {
        if !self.latency.is_zero() {
            trace!(operation, latency_ms = duration_ms(self.latency), "simulating latency");
            self.clock.pause(self.latency);
        }
        self.faults.check(operation)?;
        Ok(self.clock.now())
    }
}
