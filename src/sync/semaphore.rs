// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_queue::WaitQueue;
use crate::time::{timeout, Elapsed};
use crate::util::Backoff;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// An async counting semaphore with an upper bound.
///
/// The permit count lives in one atomic; acquirers spin a bounded number of
/// times on the compare-exchange fast path before parking on the wait queue.
/// [`Semaphore::release`] saturates at the bound and reports the number of
/// permits actually added, which is how saturation is observed.
pub struct Semaphore {
    permits: AtomicUsize,
    bound: usize,
    waiters: WaitQueue,
}

/// RAII permit returned by the acquire family; releases on drop.
#[must_use = "dropping a Permit immediately releases it"]
pub struct Permit<'a> {
    semaphore: &'a Semaphore,
}

impl Semaphore {
    /// A semaphore with `permits` available and no meaningful upper bound.
    pub fn new(permits: usize) -> Self {
        Self::bounded(usize::MAX, permits)
    }

    /// A semaphore bounded at `bound`, starting with `permits` available.
    pub fn bounded(bound: usize, permits: usize) -> Self {
        assert!(permits <= bound, "initial permits exceed the bound");
        Self {
            permits: AtomicUsize::new(permits),
            bound,
            waiters: WaitQueue::new(),
        }
    }

    /// Acquires one permit, waiting if none is available.
    pub async fn acquire(&self) -> Permit<'_> {
        loop {
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            // register first, then re-check: a release that raced the failed
            // try_acquire recorded an untriggered notification, which the
            // registration consumed
            let wait = self.waiters.wait();
            if let Some(permit) = self.try_acquire() {
                return permit;
            }
            wait.await;
        }
    }

    /// Acquires one permit without waiting.
    pub fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut backoff = Backoff::new();
        let mut current = self.permits.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return None;
            }
            match self.permits.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // take the matching wakeup credit with the permit so the
                    // untriggered counter stays bounded by the bound
                    self.waiters.try_wait();
                    return Some(Permit { semaphore: self });
                }
                Err(actual) => {
                    current = actual;
                    backoff.spin();
                }
            }
        }
    }

    /// Acquires one permit or gives up after `duration`.
    ///
    /// The wait is interrupted by a timer entry; on expiry the parked wait
    /// is dropped and its queue node unlinked.
    pub async fn acquire_for(&self, duration: Duration) -> Result<Permit<'_>, Elapsed> {
        timeout(duration, self.acquire()).await
    }

    /// Acquires one permit or gives up at `deadline`.
    pub async fn acquire_until(&self, deadline: Instant) -> Result<Permit<'_>, Elapsed> {
        self.acquire_for(deadline.saturating_duration_since(Instant::now()))
            .await
    }

    /// Returns `n` permits, saturating at the bound.
    ///
    /// Wakes up to `n` waiters; surplus notifications are recorded so that a
    /// late waiter does not park past an available permit. Returns the
    /// number of permits actually added.
    pub fn release(&self, n: usize) -> usize {
        let mut current = self.permits.load(Ordering::Acquire);
        let added = loop {
            let added = n.min(self.bound - current);
            if added == 0 {
                break 0;
            }
            match self.permits.compare_exchange_weak(
                current,
                current + added,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break added,
                Err(actual) => current = actual,
            }
        };
        if n > 0 {
            self.waiters.notify(n, true);
        }
        added
    }

    /// Permits currently available.
    pub fn available(&self) -> usize {
        self.permits.load(Ordering::Acquire)
    }

    /// The semaphore's upper bound.
    pub fn bound(&self) -> usize {
        self.bound
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("available", &self.available())
            .field("bound", &self.bound)
            .finish()
    }
}

impl Permit<'_> {
    /// Consumes the permit without releasing it back.
    pub fn forget(self) {
        core::mem::forget(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        self.semaphore.release(1);
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Permit")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_acquire_tracks_the_count() {
        let sem = Semaphore::bounded(2, 2);
        let a = sem.try_acquire().unwrap();
        let b = sem.try_acquire().unwrap();
        assert!(sem.try_acquire().is_none());
        drop(a);
        let c = sem.try_acquire().unwrap();
        drop(b);
        drop(c);
        assert_eq!(sem.available(), 2);
    }

    #[test]
    fn release_saturates_at_the_bound() {
        let sem = Semaphore::bounded(3, 1);
        assert_eq!(sem.release(5), 2);
        assert_eq!(sem.available(), 3);
        assert_eq!(sem.release(1), 0);
    }

    #[test]
    fn forget_leaks_the_permit() {
        let sem = Semaphore::bounded(1, 1);
        sem.try_acquire().unwrap().forget();
        assert_eq!(sem.available(), 0);
    }
}
