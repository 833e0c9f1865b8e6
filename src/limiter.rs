//! Caps how many outbound fetches run at once.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Shared gate in front of the feed endpoint and the extractor.
///
/// Cloning is cheap and every clone draws from the same permits. Tokio's
/// semaphore is fair, so waiters are served in the order they called
/// [`ConcurrencyLimiter::acquire`]. Callers that fan work out to spawned tasks
/// should acquire on their own task, in order, and move the permit into the
/// spawned one; spawned tasks reach the semaphore in whatever order the
/// runtime polls them.
#[derive(Clone)]
pub struct ConcurrencyLimiter {
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    limit: usize,
}

/// A held slot. Dropping it frees the slot.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for LimiterPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            limit,
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Waits for a free slot and hands it over as an owned permit.
    pub async fn acquire(&self) -> LimiterPermit {
        // The semaphore is never closed, so acquire cannot fail.
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .unwrap_or_else(|_| unreachable!("limiter semaphore closed"));
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        LimiterPermit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        }
    }

    /// Waits for a free slot, runs `task`, then frees the slot.
    ///
    /// The slot is released when the task finishes, whatever it returned, and
    /// also if the future is dropped or unwinds mid-poll.
    pub async fn schedule<F, T>(&self, task: F) -> T
    where
        F: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        task.await
    }
}

impl Default for ConcurrencyLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}
