//! Sink for failures that happen in the background with nobody to report
//! them to: an unexpected connection failure, a disconnect with a cause while
//! no disconnect was requested, a completion callback that panicked.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tracing::error;

use super::error::Error;

struct Inner {
    capacity: usize,
    total: AtomicU64,
    recent: Mutex<VecDeque<Error>>,
}

/// Logs background failures and keeps the most recent ones.
///
/// Clones share the same history.
#[derive(Clone)]
pub struct UnhandledFailures {
    inner: Arc<Inner>,
}

impl UnhandledFailures {
    /// Creates a sink that remembers up to `capacity` failures (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                capacity,
                total: AtomicU64::new(0),
                recent: Mutex::new(VecDeque::with_capacity(capacity)),
            }),
        }
    }

    pub fn report(&self, error: Error) {
        error!(
            kind = %error.kind(),
            "Exception caught in background thread. Unable to handle: {}",
            error.chain_report()
        );

        self.inner.total.fetch_add(1, Ordering::Relaxed);
        let mut recent = match self.inner.recent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if recent.len() == self.inner.capacity {
            recent.pop_front();
        }
        recent.push_back(error);
    }

    /// Total number of failures reported, including ones no longer kept.
    pub fn count(&self) -> u64 {
        self.inner.total.load(Ordering::Relaxed)
    }

    /// Kept failures, oldest first.
    pub fn recent(&self) -> Vec<Error> {
        match self.inner.recent.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }
}

impl Default for UnhandledFailures {
    fn default() -> Self {
        Self::new(64)
    }
}

impl std::fmt::Debug for UnhandledFailures {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnhandledFailures")
            .field("count", &self.count())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}
