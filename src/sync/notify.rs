// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_queue::{Wait, WaitQueue};
use core::fmt;

/// Notifies tasks that are currently waiting, and only those.
///
/// Unlike the semaphore family, `Notify` deliberately does *not* record
/// untriggered notifications: a `notify_one` with no waiter queued is lost.
/// Use it for edge-triggered conditions where the waiter re-checks shared
/// state itself.
pub struct Notify {
    waiters: WaitQueue,
}

impl Notify {
    pub const fn new() -> Self {
        Self {
            waiters: WaitQueue::new(),
        }
    }

    /// Completes at the next `notify_one`/`notify_all` after registration.
    pub fn notified(&self) -> Notified<'_> {
        Notified {
            wait: self.waiters.wait(),
        }
    }

    /// Wakes one currently waiting task, if any. Returns whether one was
    /// woken.
    pub fn notify_one(&self) -> bool {
        self.waiters.notify(1, false) == 1
    }

    /// Wakes every currently waiting task; returns how many.
    pub fn notify_all(&self) -> usize {
        self.waiters.notify_all()
    }
}

impl Default for Notify {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Notify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notify").finish_non_exhaustive()
    }
}

/// Future returned by [`Notify::notified`]. Registration happens when this
/// is created, not when it is first polled.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Notified<'a> {
    wait: Wait<'a>,
}

impl Future for Notified<'_> {
    type Output = ();

    fn poll(
        mut self: core::pin::Pin<&mut Self>,
        cx: &mut core::task::Context<'_>,
    ) -> core::task::Poll<Self::Output> {
        core::pin::Pin::new(&mut self.wait).poll(cx)
    }
}

impl Unpin for Notified<'_> {}

impl fmt::Debug for Notified<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notified").finish_non_exhaustive()
    }
}
