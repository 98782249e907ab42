//! Injected transient failures.
//!
//! Operations are named `service.method` (`queue.send`, `object.get_object`, ...). A rule either
//! names one operation exactly or ends in `*` to match every operation with that prefix.

use crate::traits::{CloudError, CloudResult, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

#[derive(Debug, Clone)]
struct FaultRule {
    pattern: String,
    kind: ErrorKind,
    remaining: Option<u32>, // None fails forever
}

impl FaultRule {
    fn matches(&self, operation: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => operation.starts_with(prefix),
            None => self.pattern == operation,
        }
    }
}

/// Shared, cloneable fault switchboard. Clones arm the same rules.
#[derive(Debug, Clone, Default)]
pub struct FaultInjector {
    rules: Arc<Mutex<Vec<FaultRule>>>,
    triggered: Arc<AtomicU64>,
}

impl FaultInjector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` calls matching `pattern` with `Unavailable`.
    pub fn fail_next(&self, pattern: &str, times: u32) {
        self.fail_next_with(pattern, times, ErrorKind::Unavailable);
    }

    /// Fail the next `times` calls matching `pattern` with the given kind.
    pub fn fail_next_with(&self, pattern: &str, times: u32, kind: ErrorKind) {
        if times == 0 {
            return;
        }
        self.push(FaultRule {
            pattern: pattern.to_string(),
            kind,
            remaining: Some(times),
        });
    }

    /// Fail every call matching `pattern` until [`clear`](Self::clear) is called.
    pub fn fail_always(&self, pattern: &str) {
        self.push(FaultRule {
            pattern: pattern.to_string(),
            kind: ErrorKind::Unavailable,
            remaining: None,
        });
    }

    pub fn clear(&self) {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    /// Number of failures injected so far.
    #[must_use]
    pub fn triggered(&self) -> u64 {
        self.triggered.load(Ordering::SeqCst)
    }

    fn push(&self, rule: FaultRule) {
        self.rules.lock().unwrap_or_else(PoisonError::into_inner).push(rule);
    }

    pub(crate) fn check(&self, operation: &str) -> CloudResult<()> {
        let mut rules = self.rules.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = rules.iter().position(|r| r.matches(operation)) else {
            return Ok(());
        };
        let kind = rules[index].kind;
        if let Some(remaining) = rules[index].remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                rules.remove(index);
            }
        }
        drop(rules);

        self.triggered.fetch_add(1, Ordering::SeqCst);
        debug!(operation, ?kind, "injecting fault");
        Err(CloudError::new(
            kind,
            format!("injected fault for {operation}"),
        ))
    }
}
