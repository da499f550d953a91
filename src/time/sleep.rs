// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::cancel::{self, Cancelled};
use crate::runtime::{self, Shared};
use crate::time::timer::TimerId;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Waits until `duration` has elapsed.
///
/// The sleep is cancellation-aware: if the current task's cancellation scope
/// fires first, the timer entry is removed and the future completes
/// immediately. The caller observes the cancellation through
/// [`cancel::current`]`().is_cancelled()` or because a surrounding
/// [`CancelScope::run_until_cancelled`](crate::cancel::CancelScope::run_until_cancelled)
/// discards it.
///
/// # Panics
///
/// Panics when called outside of a runtime context.
#[track_caller]
pub fn sleep(duration: Duration) -> Sleep {
    let shared =
        runtime::current_shared().expect("spindle::time::sleep requires a runtime context");
    let deadline = shared.timer.deadline_after(duration);
    Sleep::new(shared, deadline)
}

/// Waits until `deadline`.
#[track_caller]
pub fn sleep_until(deadline: Instant) -> Sleep {
    sleep(deadline.saturating_duration_since(Instant::now()))
}

pub(crate) fn sleep_until_nanos(shared: Arc<Shared>, deadline: u64) -> Sleep {
    Sleep::new(shared, deadline)
}

/// Future returned by [`sleep`] and [`sleep_until`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Sleep {
    shared: Arc<Shared>,
    deadline: u64,
    entry: Option<TimerId>,
    cancelled: Option<Cancelled>,
    done: bool,
}

impl Sleep {
    fn new(shared: Arc<Shared>, deadline: u64) -> Self {
        Self {
            shared,
            deadline,
            entry: None,
            cancelled: None,
            done: false,
        }
    }

    fn deregister(&mut self) {
        if let Some(id) = self.entry.take() {
            self.shared.timer.cancel(id);
        }
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(());
        }

        // watch the containing task's cancellation scope; a fired scope
        // removes the entry and ends the sleep right away
        let cancelled = this
            .cancelled
            .get_or_insert_with(|| cancel::current().cancelled());
        if Pin::new(cancelled).poll(cx).is_ready() {
            this.deregister();
            this.done = true;
            return Poll::Ready(());
        }

        if this.shared.timer.now_nanos() >= this.deadline {
            this.deregister();
            this.done = true;
            return Poll::Ready(());
        }

        match this.entry {
            None => this.entry = Some(this.shared.timer.register(this.deadline, cx.waker().clone())),
            Some(id) => this.shared.timer.update_waker(id, cx.waker()),
        }

        // the deadline may have passed while we were registering; the daemon
        // could already have fired the entry without a useful waker
        if this.shared.timer.now_nanos() >= this.deadline {
            this.deregister();
            this.done = true;
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

impl Unpin for Sleep {}

impl Drop for Sleep {
    fn drop(&mut self) {
        self.deregister();
    }
}

impl fmt::Debug for Sleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sleep")
            .field("deadline", &self.deadline)
            .field("registered", &self.entry.is_some())
            .field("done", &self.done)
            .finish()
    }
}
