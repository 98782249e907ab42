//! In-memory engines behind the `*IO` traits.
//!
//! Each engine keeps its resources in a [`Store`] and reads time through its [`SimEnv`].
//! Passing the same store to two constructors is the only way for two engine values to share
//! state; nothing here is global.

use crate::clock::{SimEnv, Sweep, TimestampMs};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub mod auth;
pub mod batch;
pub mod config;
pub mod database;
pub mod document;
pub mod events;
pub mod filter;
pub mod hosting;
pub mod notification;
pub mod object;
pub mod queue;
pub mod secrets;
pub(crate) mod sql;

pub use auth::{AuthState, FakeAuthIO};
pub use batch::{BatchState, FakeBatchIO, JobHandler};
pub use config::{ConfigState, FakeConfigIO};
pub use database::{DatabaseState, FakeDatabaseIO};
pub use document::{DocumentState, FakeDocumentIO};
pub use events::{EventBusState, FakeEventBusIO};
pub use hosting::{FakeHostingIO, HostingState};
pub use notification::{Delivery, FakeNotificationIO, NotificationState};
pub use object::{FakeObjectIO, ObjectState};
pub use queue::{FakeQueueIO, QueueState};
pub use secrets::{FakeSecretsIO, SecretsState};

/// Shared, lockable engine state.
pub struct Store<S> {
    inner: Arc<Mutex<S>>,
}

impl<S> Clone for Store<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: Default> Default for Store<S> {
    fn default() -> Self {
        Self::new(S::default())
    }
}

impl<S> Store<S> {
    pub fn new(state: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Lock for the duration of one operation. A panic inside a previous holder does not make
    /// the state unusable: every operation validates before it mutates.
    pub(crate) fn lock(&self) -> MutexGuard<'_, S> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether two stores are the same underlying state.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S: Expire + Send + 'static> Store<S> {
    /// Let clock movements run this store's expiry.
    pub(crate) fn register_sweeper(&self, env: &SimEnv) {
        let weak: Weak<dyn Sweep> = Arc::downgrade(&self.inner) as Weak<Mutex<S>>;
        env.register_sweeper(weak);
    }

    /// Lock and run lazy expiry first, so reads never observe expired state.
    pub(crate) fn lock_at(&self, now: TimestampMs) -> MutexGuard<'_, S> {
        let mut state = self.lock();
        state.expire(now);
        state
    }
}

/// Time-driven cleanup. Shared by lazy expiry and clock sweeps so both yield the same state.
pub trait Expire {
    fn expire(&mut self, now: TimestampMs);
}

impl<S: Expire + Send> Sweep for Mutex<S> {
    fn sweep(&self, now: TimestampMs) {
        self.lock().unwrap_or_else(PoisonError::into_inner).expire(now);
    }
}

/// Monotonic identifier source, rendered as `prefix-00000001`.
#[derive(Debug, Default, Clone)]
pub(crate) struct IdSequence {
    next: u64,
}

impl IdSequence {
    pub(crate) fn next(&mut self, prefix: &str) -> String {
        self.next += 1;
        format!("{prefix}-{:08}", self.next)
    }

    pub(crate) fn next_number(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}
