// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::mutex::MutexGuard;
use crate::sync::wait_queue::WaitQueue;
use core::fmt;

/// An async condition variable for use with [`Mutex`](crate::sync::Mutex).
///
/// [`Condvar::wait`] registers on the wait list *before* releasing the
/// guard, so a notification sent between unlock and suspension is never
/// missed. As with any condition variable, wakeups are permission to
/// re-check, not proof; use [`Condvar::wait_while`] to loop over a
/// predicate.
pub struct Condvar {
    waiters: WaitQueue,
}

impl Condvar {
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Atomically releases `guard`, waits for a notification, and re-locks.
    pub async fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex = guard.mutex();
        let wait = self.waiters.wait();
        drop(guard);
        wait.await;
        mutex.lock().await
    }

    /// Waits until `predicate` returns `false`, re-checking under the lock
    /// at every wakeup.
    pub async fn wait_while<'a, T: ?Sized>(
        &self,
        mut guard: MutexGuard<'a, T>,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        while predicate(&mut *guard) {
            guard = self.wait(guard).await;
        }
        guard
    }

    /// Wakes one waiting task.
    pub fn notify_one(&self) {
        self.waiters.notify(1, false);
    }

    /// Wakes every waiting task.
    pub fn notify_all(&self) {
        self.waiters.notify_all();
    }
}

impl Default for Condvar {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Condvar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Condvar").finish_non_exhaustive()
    }
}
