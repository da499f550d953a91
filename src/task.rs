// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task record and its lifecycle.
//!
//! A spawned future is erased into a [`RawTask`]: an `Arc`-shared heap record
//! owned jointly by the caller's [`JoinHandle`], the owning worker's tables
//! (while the task is scheduled), and every [`core::task::Waker`] derived
//! from it. The record carries the atomic lifecycle state word, the boxed
//! future, the typed delivery slot (through the handle), the panic slot, the
//! task's cancellation scope and task-local storage, and a back-reference to
//! the worker that currently owns it.
//!
//! Plain `.await` of a sub-future is the *inline* path: it runs on the
//! caller's worker inside the caller's poll with no scheduler round-trip.
//! Only explicit [`spawn`](crate::spawn) creates an independently dispatched
//! record.

mod builder;
mod id;
mod join_handle;
pub(crate) mod local;
mod state;
mod yield_now;

use crate::cancel::CancelScope;
use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::runtime::Shared;
use crate::task::local::LocalMap;
use crate::task::state::{CancelAction, StartPoll, State};
use core::any::Any;
use core::cell::RefCell;
use core::fmt;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::sync::Arc;
use std::task::Wake;

pub use builder::TaskBuilder;
pub use id::Id;
pub use join_handle::{JoinError, JoinHandle};
pub use local::LocalKey;
pub use yield_now::yield_now;

pub(crate) use state::PollOutcome;

/// A reference-counted, type-erased pointer to a spawned task record.
///
/// `TaskRef`s are what moves through dispatch queues and worker tables;
/// the typed output travels separately through the [`JoinHandle`]'s delivery
/// slot, so the scheduler never needs to know a task's output type.
#[derive(Clone)]
pub(crate) struct TaskRef(Arc<RawTask>);

pub(crate) struct RawTask {
    pub(crate) header: Header,
    /// The erased future. `None` once the task completed (or its future was
    /// dropped by cancellation).
    stage: spin::Mutex<Option<Pin<Box<dyn Future<Output = ()> + Send>>>>,
    /// Waker of the `JoinHandle` awaiting this task, if any. This is the
    /// record's caller link: completion wakes it exactly once.
    join_waker: spin::Mutex<Option<Waker>>,
    /// Panic payload of the future, delivered to the `JoinHandle` at most
    /// once.
    panic_slot: spin::Mutex<Option<Box<dyn Any + Send>>>,
}

pub(crate) struct Header {
    pub(crate) id: Id,
    pub(crate) state: State,
    /// Dispatch preference: `true` inverts the load comparison towards the
    /// compute queue.
    pub(crate) core: bool,
    /// Index + 1 of the worker that owns this record; 0 when unscheduled.
    /// Only meaningful while the state word says SCHEDULED.
    pub(crate) worker: AtomicUsize,
    pub(crate) shared: Arc<Shared>,
    /// The task's cancellation scope, a child of the spawning task's scope.
    pub(crate) cancel: CancelScope,
    /// The spawning task, if any; the root of the await chain for
    /// diagnostics.
    pub(crate) parent: Option<Id>,
    pub(crate) locals: spin::Mutex<LocalMap>,
    pub(crate) span: tracing::Span,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// Runs `f` with the task record currently being polled on this thread.
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&TaskRef>) -> R) -> R {
    CURRENT_TASK.with(|current| f(current.borrow().as_ref()))
}

/// The id of the task currently executing on this thread, if any.
pub fn current_id() -> Option<Id> {
    with_current(|task| task.map(TaskRef::id))
}

struct CurrentTaskGuard {
    prev: Option<TaskRef>,
}

impl CurrentTaskGuard {
    fn enter(task: TaskRef) -> Self {
        let prev = CURRENT_TASK.with(|current| current.borrow_mut().replace(task));
        Self { prev }
    }
}

impl Drop for CurrentTaskGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_TASK.with(|current| *current.borrow_mut() = prev);
    }
}

// === impl TaskRef ===

impl TaskRef {
    pub(crate) fn new(raw: RawTask) -> Self {
        Self(Arc::new(raw))
    }

    pub(crate) fn id(&self) -> Id {
        self.0.header.id
    }

    pub(crate) fn raw(&self) -> &Arc<RawTask> {
        &self.0
    }

    pub(crate) fn header(&self) -> &Header {
        &self.0.header
    }

    /// Polls the task's future once, routing panics into the panic slot.
    pub(crate) fn poll(&self) -> PollOutcome {
        self.0.poll_raw()
    }

    /// Cancels the task: fires its cancellation scope and arranges for the
    /// worker to drop the future at the next scheduling point.
    pub(crate) fn cancel(&self) -> bool {
        match self.0.header.state.cancel() {
            CancelAction::Unreachable => false,
            CancelAction::Claimed { enqueue } => {
                tracing::trace!(task.tid = self.id().as_u64(), "task cancelled");
                self.0.header.cancel.cancel();
                if enqueue {
                    schedule(&self.0);
                }
                true
            }
        }
    }

    /// Stamps the owning worker; the record may only live in that worker's
    /// tables afterwards.
    pub(crate) fn bind_worker(&self, index: usize) {
        self.0.header.worker.store(index + 1, Ordering::Release);
        self.0.header.state.set_scheduled(true);
    }

    /// Clears the owning worker; the back-pointer must not be read after
    /// this.
    pub(crate) fn clear_worker(&self) {
        self.0.header.state.set_scheduled(false);
        self.0.header.worker.store(0, Ordering::Release);
    }

    /// Wakes the `JoinHandle` awaiting this task, if one is registered.
    pub(crate) fn wake_join(&self) {
        let waker = self.0.join_waker.lock().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRef")
            .field("id", &self.id())
            .field("state", &self.0.header.state)
            .finish()
    }
}

// === impl RawTask ===

impl RawTask {
    fn poll_raw(self: &Arc<Self>) -> PollOutcome {
        match self.header.state.start_poll() {
            StartPoll::Poll => {}
            StartPoll::Cancelled => {
                // drop the future without completing it; destructors run at
                // the await point the task was suspended on
                *self.stage.lock() = None;
                return PollOutcome::Ready;
            }
            StartPoll::Skip => {
                tracing::warn!(
                    task.tid = self.header.id.as_u64(),
                    "refused to poll task twice"
                );
                return PollOutcome::Pending;
            }
        }

        let waker = Waker::from(Arc::clone(self));
        let mut cx = Context::from_waker(&waker);
        let _task = CurrentTaskGuard::enter(TaskRef(Arc::clone(self)));
        let _span = self.header.span.clone().entered();

        let completed = {
            let mut stage = self.stage.lock();
            match stage.as_mut() {
                Some(future) => {
                    match std::panic::catch_unwind(AssertUnwindSafe(|| {
                        future.as_mut().poll(&mut cx)
                    })) {
                        Ok(Poll::Pending) => false,
                        Ok(Poll::Ready(())) => {
                            *stage = None;
                            true
                        }
                        Err(payload) => {
                            *stage = None;
                            *self.panic_slot.lock() = Some(payload);
                            true
                        }
                    }
                }
                // stage already consumed; treat as completed
                None => true,
            }
        };

        self.header.state.end_poll(completed)
    }

    pub(crate) fn has_panic(&self) -> bool {
        self.panic_slot.lock().is_some()
    }

    pub(crate) fn take_panic(&self) -> Option<Box<dyn Any + Send>> {
        let payload = self.panic_slot.lock().take();
        if payload.is_some() {
            self.header.state.mark_rethrown();
        }
        payload
    }

    pub(crate) fn take_join_waker(&self) -> Option<Waker> {
        self.join_waker.lock().take()
    }

    pub(crate) fn register_join_waker(&self, waker: &Waker) {
        let mut slot = self.join_waker.lock();
        match &mut *slot {
            Some(existing) if existing.will_wake(waker) => {}
            slot => *slot = Some(waker.clone()),
        }
    }
}

impl Wake for RawTask {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        if self.header.state.wake() {
            schedule(self);
        }
    }
}

impl fmt::Debug for RawTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTask")
            .field("id", &self.header.id)
            .field("state", &self.header.state)
            .finish_non_exhaustive()
    }
}

/// Routes a woken task back onto its owning worker.
///
/// A task without an owner is still in a dispatch queue; its WOKEN bit is
/// enough, the receiving worker polls it anyway.
fn schedule(raw: &Arc<RawTask>) {
    let worker = raw.header.worker.load(Ordering::Acquire);
    if worker == 0 {
        return;
    }
    let task = TaskRef(Arc::clone(raw));
    raw.header.shared.workers()[worker - 1].activate_task(task);
}

pub(crate) fn new_raw(
    id: Id,
    shared: Arc<Shared>,
    core: bool,
    parent: Option<Id>,
    cancel: CancelScope,
    span: tracing::Span,
    future: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> RawTask {
    RawTask {
        header: Header {
            id,
            state: State::new(),
            core,
            worker: AtomicUsize::new(0),
            shared,
            cancel,
            parent,
            locals: spin::Mutex::new(LocalMap::new()),
            span,
        },
        stage: spin::Mutex::new(Some(future)),
        join_waker: spin::Mutex::new(None),
        panic_slot: spin::Mutex::new(None),
    }
}
