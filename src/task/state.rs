// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use core::fmt;

/// Task lifecycle state, packed into one atomic word.
///
/// ```text
/// | 7           | 6        | 5           | 4         | 3         | 2        | 1     | 0       |
/// | await_start | rethrown | join handle | scheduled | cancelled | complete | woken | polling |
/// ```
///
/// Transitions happen through a CAS loop
/// ([`State::transition`]); every mutation is a pure function of the previous
/// snapshot, retried on contention.
pub(crate) struct State {
    val: AtomicUsize,
}

bitflags::bitflags! {
    /// A decoded snapshot of a task's state word.
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub(crate) struct Snapshot: usize {
        /// The task is currently being polled by its worker.
        const POLLING       = 1 << 0;
        /// The task's waker fired; it is queued (or will be re-queued) for a
        /// poll. Consumed by `start_poll`.
        const WOKEN         = 1 << 1;
        /// The future returned `Ready`, panicked, or was dropped by a cancel.
        const COMPLETE      = 1 << 2;
        /// The task was cancelled through its handle.
        const CANCELLED     = 1 << 3;
        /// A worker currently owns this task in its tables. The record's
        /// worker slot is only meaningful while this is set.
        const SCHEDULED     = 1 << 4;
        /// A `JoinHandle` for this task exists.
        const JOIN_HANDLE   = 1 << 5;
        /// The task's panic payload has been taken by its `JoinHandle`.
        /// Monotonic: never cleared once set.
        const RETHROWN      = 1 << 6;
        /// The `JoinHandle` has been polled at least once.
        /// Monotonic: transitions false to true at most once.
        const AWAIT_STARTED = 1 << 7;
    }
}

/// What the worker should do after attempting to start a poll.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum StartPoll {
    /// Transitioned to POLLING; go ahead.
    Poll,
    /// The task was cancelled before this poll; drop the future instead.
    Cancelled,
    /// Already polling elsewhere or already complete; do nothing.
    Skip,
}

/// What the worker should do after a poll returns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum PollOutcome {
    /// The task completed.
    Ready,
    /// The task is suspended; whoever holds its waker will re-activate it.
    Pending,
    /// The task woke itself during the poll; re-queue it at the back of the
    /// active deque.
    PendingSchedule,
}

/// Result of a cancellation attempt.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[must_use]
pub(crate) enum CancelAction {
    /// We claimed the cancellation; `enqueue` says whether the caller must
    /// schedule the task so the worker can observe it.
    Claimed { enqueue: bool },
    /// The task was already cancelled or complete.
    Unreachable,
}

impl State {
    pub(crate) fn new() -> Self {
        // tasks are born woken: they sit in a dispatch queue and must be
        // polled once they reach a worker
        Self {
            val: AtomicUsize::new(Snapshot::WOKEN.bits() | Snapshot::JOIN_HANDLE.bits()),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot::from_bits_retain(self.val.load(ordering))
    }

    pub(crate) fn start_poll(&self) -> StartPoll {
        self.transition(|s| {
            if s.contains(Snapshot::POLLING) || s.contains(Snapshot::COMPLETE) {
                return StartPoll::Skip;
            }
            if s.contains(Snapshot::CANCELLED) {
                s.insert(Snapshot::COMPLETE);
                return StartPoll::Cancelled;
            }
            s.insert(Snapshot::POLLING);
            s.remove(Snapshot::WOKEN);
            StartPoll::Poll
        })
    }

    pub(crate) fn end_poll(&self, completed: bool) -> PollOutcome {
        self.transition(|s| {
            debug_assert!(s.contains(Snapshot::POLLING));
            s.remove(Snapshot::POLLING);
            if completed {
                s.insert(Snapshot::COMPLETE);
                return PollOutcome::Ready;
            }
            if s.contains(Snapshot::WOKEN) {
                // leave WOKEN set: the task is queued again, and stray wakes
                // until the next start_poll must not re-enqueue it
                return PollOutcome::PendingSchedule;
            }
            PollOutcome::Pending
        })
    }

    /// Transition for a waker firing. Returns `true` if the caller must
    /// enqueue the task.
    pub(crate) fn wake(&self) -> bool {
        self.transition(|s| {
            if s.contains(Snapshot::COMPLETE) || s.contains(Snapshot::WOKEN) {
                return false;
            }
            s.insert(Snapshot::WOKEN);
            // a wake during the poll is consumed by end_poll instead
            !s.contains(Snapshot::POLLING)
        })
    }

    pub(crate) fn cancel(&self) -> CancelAction {
        self.transition(|s| {
            if s.contains(Snapshot::COMPLETE) || s.contains(Snapshot::CANCELLED) {
                return CancelAction::Unreachable;
            }
            s.insert(Snapshot::CANCELLED);
            if s.contains(Snapshot::WOKEN) || s.contains(Snapshot::POLLING) {
                return CancelAction::Claimed { enqueue: false };
            }
            s.insert(Snapshot::WOKEN);
            CancelAction::Claimed { enqueue: true }
        })
    }

    pub(crate) fn set_scheduled(&self, scheduled: bool) {
        if scheduled {
            self.val.fetch_or(Snapshot::SCHEDULED.bits(), Ordering::AcqRel);
        } else {
            self.val
                .fetch_and(!Snapshot::SCHEDULED.bits(), Ordering::AcqRel);
        }
    }

    pub(crate) fn mark_await_started(&self) {
        self.val
            .fetch_or(Snapshot::AWAIT_STARTED.bits(), Ordering::AcqRel);
    }

    pub(crate) fn mark_rethrown(&self) {
        self.val.fetch_or(Snapshot::RETHROWN.bits(), Ordering::AcqRel);
    }

    pub(crate) fn drop_join_handle(&self) {
        let prev = self
            .val
            .fetch_and(!Snapshot::JOIN_HANDLE.bits(), Ordering::AcqRel);
        debug_assert!(
            Snapshot::from_bits_retain(prev).contains(Snapshot::JOIN_HANDLE),
            "tried to drop a join handle the task did not have"
        );
    }

    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);
            if next == current {
                return res;
            }
            match self.val.compare_exchange_weak(
                current.bits(),
                next.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot::from_bits_retain(actual),
            }
        }
    }
}

impl Snapshot {
    pub(crate) fn is_complete(self) -> bool {
        self.contains(Snapshot::COMPLETE)
    }

    pub(crate) fn is_cancelled(self) -> bool {
        self.contains(Snapshot::CANCELLED)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        bitflags::parser::to_writer(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn born_woken() {
        let state = State::new();
        // a second wake before the first poll must not re-enqueue
        assert!(!state.wake());
        assert_eq!(state.start_poll(), StartPoll::Poll);
    }

    #[test]
    fn wake_during_poll_reschedules() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPoll::Poll);
        assert!(!state.wake());
        assert_eq!(state.end_poll(false), PollOutcome::PendingSchedule);
        // still queued; further wakes are coalesced
        assert!(!state.wake());
    }

    #[test]
    fn wake_after_suspend_enqueues_once() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPoll::Poll);
        assert_eq!(state.end_poll(false), PollOutcome::Pending);
        assert!(state.wake());
        assert!(!state.wake());
    }

    #[test]
    fn cancel_is_observed_by_next_poll() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPoll::Poll);
        assert_eq!(state.end_poll(false), PollOutcome::Pending);
        assert_eq!(state.cancel(), CancelAction::Claimed { enqueue: true });
        assert_eq!(state.start_poll(), StartPoll::Cancelled);
        assert!(state.load(Ordering::Relaxed).is_complete());
        assert_eq!(state.cancel(), CancelAction::Unreachable);
    }

    #[test]
    fn complete_tasks_ignore_wakes() {
        let state = State::new();
        assert_eq!(state.start_poll(), StartPoll::Poll);
        assert_eq!(state.end_poll(true), PollOutcome::Ready);
        assert!(!state.wake());
        assert_eq!(state.start_poll(), StartPoll::Skip);
    }

    #[test]
    fn rethrown_is_monotonic() {
        let state = State::new();
        state.mark_rethrown();
        state.mark_await_started();
        state.mark_rethrown();
        assert!(state.load(Ordering::Relaxed).contains(Snapshot::RETHROWN));
    }
}
