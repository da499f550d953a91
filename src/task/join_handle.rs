// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::Parker;
use crate::task::TaskRef;
use core::any::Any;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::Arc;

/// An owned permission to await a spawned task.
///
/// Awaiting the handle yields the task's output, or a [`JoinError`] if the
/// task panicked or was cancelled. Dropping the handle detaches the task; it
/// keeps running to completion on its worker.
#[must_use = "dropping a JoinHandle detaches the task"]
pub struct JoinHandle<T> {
    pub(crate) task: TaskRef,
    /// Typed delivery slot, written at most once by the task's wrapper
    /// future on normal completion.
    pub(crate) output: Arc<spin::Mutex<Option<T>>>,
    consumed: bool,
}

/// Why a joined task produced no output.
pub enum JoinError {
    /// The task was cancelled before completing.
    Cancelled,
    /// The task's future panicked; the payload is carried here and can be
    /// rethrown with [`JoinError::resume_panic`].
    Panicked(Box<dyn Any + Send + 'static>),
}

impl<T> JoinHandle<T> {
    pub(crate) fn new(task: TaskRef, output: Arc<spin::Mutex<Option<T>>>) -> Self {
        Self {
            task,
            output,
            consumed: false,
        }
    }

    /// The id of the task this handle refers to.
    pub fn id(&self) -> super::Id {
        self.task.id()
    }

    /// Whether the task has run to completion (including by cancellation).
    pub fn is_finished(&self) -> bool {
        self.task
            .header()
            .state
            .load(core::sync::atomic::Ordering::Acquire)
            .is_complete()
    }

    /// Whether the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.task
            .header()
            .state
            .load(core::sync::atomic::Ordering::Acquire)
            .is_cancelled()
    }

    /// Cancels the task.
    ///
    /// Fires the task's cancellation scope immediately; the future itself is
    /// dropped at the task's next scheduling point. Returns `true` if this
    /// call claimed the cancellation.
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Detaches the task explicitly. Equivalent to dropping the handle.
    pub fn detach(self) {}

    /// Blocks the current (non-runtime) thread until the task completes.
    ///
    /// This is the synchronous analogue of awaiting the handle; the calling
    /// thread parks on a binary semaphore that the completion path releases.
    pub fn join(mut self) -> Result<T, JoinError> {
        let parker = Parker::new();
        let waker = parker.waker();
        let mut cx = Context::from_waker(&waker);
        loop {
            match Pin::new(&mut self).poll(&mut cx) {
                Poll::Ready(result) => return result,
                Poll::Pending => parker.park(),
            }
        }
    }

    fn take_result(&mut self) -> Result<T, JoinError> {
        assert!(!self.consumed, "JoinHandle polled after completion");
        self.consumed = true;
        if let Some(payload) = self.task.raw().take_panic() {
            return Err(JoinError::Panicked(payload));
        }
        if let Some(value) = self.output.lock().take() {
            return Ok(value);
        }
        Err(JoinError::Cancelled)
    }
}

impl<T> Future for JoinHandle<T> {
    type Output = Result<T, JoinError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let header = this.task.header();
        header.state.mark_await_started();

        if header
            .state
            .load(core::sync::atomic::Ordering::Acquire)
            .is_complete()
        {
            return Poll::Ready(this.take_result());
        }

        this.task.raw().register_join_waker(cx.waker());

        // the task may have completed between the snapshot and the waker
        // registration, in which case its completion path saw no waker
        if header
            .state
            .load(core::sync::atomic::Ordering::Acquire)
            .is_complete()
        {
            this.task.raw().take_join_waker();
            return Poll::Ready(this.take_result());
        }

        Poll::Pending
    }
}

impl<T> Unpin for JoinHandle<T> {}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        self.task.header().state.drop_join_handle();
    }
}

impl<T> fmt::Debug for JoinHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JoinHandle")
            .field("task", &self.task)
            .finish_non_exhaustive()
    }
}

impl JoinError {
    /// Returns `true` for the cancellation variant.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, JoinError::Cancelled)
    }

    /// Returns `true` for the panic variant.
    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// Re-raises the panic that felled the task on the current thread.
    pub fn resume_panic(self) -> ! {
        match self {
            JoinError::Panicked(payload) => std::panic::resume_unwind(payload),
            JoinError::Cancelled => panic!("task was cancelled"),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.pad("Cancelled"),
            JoinError::Panicked(payload) => {
                let msg = payload
                    .downcast_ref::<&'static str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(String::as_str));
                match msg {
                    Some(msg) => write!(f, "Panicked({msg:?})"),
                    None => f.pad("Panicked(..)"),
                }
            }
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Cancelled => f.pad("task was cancelled"),
            JoinError::Panicked(_) => f.pad("task panicked"),
        }
    }
}

impl core::error::Error for JoinError {}
