// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Cancellation scopes.
//!
//! A [`CancelScope`] is a cloneable handle onto a cancellable region of work:
//! an atomic flag, a notifier wait-queue and a LIFO stack of callbacks.
//! Scopes form a tree: [`CancelScope::child`] registers a propagation hook
//! on its parent, so cancelling a scope cancels everything beneath it. Every
//! spawned task owns a scope that is a child of its spawner's, which is what
//! makes [`select`](crate::select) and [`JoinHandle::cancel`] wake sleeping
//! losers.
//!
//! Cancellation is cooperative: nothing is torn down by force. A task
//! observes its scope with [`CancelScope::is_cancelled`], awaits it with
//! [`CancelScope::cancelled`], or wraps a future in
//! [`CancelScope::run_until_cancelled`].
//!
//! [`JoinHandle::cancel`]: crate::task::JoinHandle::cancel

use crate::loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::sync::wait_queue::WaitQueue;
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use pin_project::pin_project;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

/// A handle onto one node of the cancellation tree.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    waiters: WaitQueue,
    callbacks: spin::Mutex<Vec<Callback>>,
    next_callback: AtomicU64,
    /// Keeps the propagation hook on the parent alive for this scope's
    /// lifetime; dropping the scope deregisters it.
    parent: spin::Mutex<Option<(CancelScope, u64)>>,
}

enum Callback {
    User(u64, Box<dyn FnOnce() + Send>),
    Child(u64, Weak<Inner>),
}

impl Callback {
    fn id(&self) -> u64 {
        match self {
            Callback::User(id, _) | Callback::Child(id, _) => *id,
        }
    }
}

/// Deregisters its callback when dropped.
#[must_use = "dropping the guard immediately deregisters the callback"]
pub struct CancelGuard {
    scope: CancelScope,
    id: u64,
}

impl CancelScope {
    /// A fresh, independent scope.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                waiters: WaitQueue::new(),
                callbacks: spin::Mutex::new(Vec::new()),
                next_callback: AtomicU64::new(1),
                parent: spin::Mutex::new(None),
            }),
        }
    }

    /// A scope that is cancelled whenever `self` is cancelled.
    ///
    /// The link is by weak reference: a parent never keeps an otherwise
    /// dropped child alive, and a dropped child removes its hook from the
    /// parent.
    pub fn child(&self) -> CancelScope {
        let child = CancelScope::new();
        if self.is_cancelled() {
            child.cancel();
            return child;
        }
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        self.inner
            .callbacks
            .lock()
            .push(Callback::Child(id, Arc::downgrade(&child.inner)));
        // re-check: a cancel may have drained the callback list while we
        // were pushing
        if self.is_cancelled() {
            child.cancel();
        }
        *child.inner.parent.lock() = Some((self.clone(), id));
        child
    }

    /// Creates a scope that cancels itself after `duration`.
    ///
    /// The timeout is driven by a hidden task that sleeps and then cancels,
    /// so this requires a runtime context.
    pub fn with_timeout(duration: Duration) -> CancelScope {
        let scope = CancelScope::new();
        let armed = scope.clone();
        crate::spawn(async move {
            crate::time::sleep(duration).await;
            if !armed.is_cancelled() {
                armed.cancel();
            }
        })
        .detach();
        scope
    }

    /// Fires the scope: sets the flag, wakes every waiter and runs the
    /// callback stack in LIFO order. Idempotent.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::trace!(scope = ?Arc::as_ptr(&self.inner), "scope cancelled");
        self.inner.waiters.notify_all();
        let callbacks = core::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks.into_iter().rev() {
            match callback {
                Callback::User(_, f) => f(),
                Callback::Child(_, child) => {
                    if let Some(child) = child.upgrade() {
                        CancelScope { inner: child }.cancel();
                    }
                }
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Registers `callback` to run when the scope fires.
    ///
    /// If the scope is already cancelled the callback runs immediately. The
    /// returned guard deregisters the callback when dropped.
    pub fn on_cancel(&self, callback: impl FnOnce() + Send + 'static) -> CancelGuard {
        let id = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        if self.is_cancelled() {
            callback();
            return CancelGuard {
                scope: self.clone(),
                id,
            };
        }
        self.inner
            .callbacks
            .lock()
            .push(Callback::User(id, Box::new(callback)));
        if self.is_cancelled() {
            // raced with cancel; the callback may or may not have been
            // drained, run it ourselves if we can still claim it
            let claimed = {
                let mut callbacks = self.inner.callbacks.lock();
                callbacks
                    .iter()
                    .position(|cb| cb.id() == id)
                    .map(|index| callbacks.remove(index))
            };
            if let Some(Callback::User(_, f)) = claimed {
                f();
            }
        }
        CancelGuard {
            scope: self.clone(),
            id,
        }
    }

    /// Completes once the scope is cancelled; completes immediately if it
    /// already was.
    pub fn cancelled(&self) -> Cancelled {
        Cancelled {
            scope: self.clone(),
            node: None,
            done: false,
        }
    }

    /// Runs `future` until it completes or this scope fires, whichever is
    /// first. Returns `None` on cancellation; the future is dropped at its
    /// current await point.
    pub fn run_until_cancelled<F: Future>(&self, future: F) -> UntilCancelled<F> {
        UntilCancelled {
            future,
            cancelled: self.cancelled(),
        }
    }

    fn remove_callback(&self, id: u64) {
        self.inner
            .callbacks
            .lock()
            .retain(|callback| callback.id() != id);
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some((parent, id)) = self.parent.lock().take() {
            parent.remove_callback(id);
        }
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.scope.remove_callback(self.id);
    }
}

impl fmt::Debug for CancelGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelGuard").field("id", &self.id).finish()
    }
}

/// Future returned by [`CancelScope::cancelled`].
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct Cancelled {
    scope: CancelScope,
    node: Option<Arc<crate::sync::wait_queue::WaitNode>>,
    done: bool,
}

impl Future for Cancelled {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(());
        }
        if this.scope.is_cancelled() {
            this.finish();
            return Poll::Ready(());
        }
        if this.node.is_none() {
            this.node = Some(this.scope.inner.waiters.enqueue_node());
            // `cancel` does not record untriggered notifications, so close
            // the register-vs-cancel race by re-checking the flag
            if this.scope.is_cancelled() {
                this.finish();
                return Poll::Ready(());
            }
        }
        match this.node.as_ref().unwrap().poll_ready(cx) {
            Poll::Ready(()) => {
                this.node = None;
                this.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Cancelled {
    fn finish(&mut self) {
        if let Some(node) = self.node.take() {
            self.scope.inner.waiters.discard_node(&node);
        }
        self.done = true;
    }
}

impl Drop for Cancelled {
    fn drop(&mut self) {
        if !self.done
            && let Some(node) = self.node.take()
        {
            self.scope.inner.waiters.discard_node(&node);
        }
    }
}

impl Unpin for Cancelled {}

impl fmt::Debug for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cancelled").field("done", &self.done).finish()
    }
}

/// Future returned by [`CancelScope::run_until_cancelled`].
#[pin_project]
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub struct UntilCancelled<F> {
    #[pin]
    future: F,
    cancelled: Cancelled,
}

impl<F: Future> Future for UntilCancelled<F> {
    type Output = Option<F::Output>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if Pin::new(this.cancelled).poll(cx).is_ready() {
            return Poll::Ready(None);
        }
        this.future.poll(cx).map(Some)
    }
}

/// The cancellation scope of the currently running task.
///
/// Outside of a task this returns a process-wide root scope that is never
/// cancelled.
pub fn current() -> CancelScope {
    crate::task::with_current(|task| match task {
        Some(task) => task.header().cancel.clone(),
        None => root().clone(),
    })
}

pub(crate) fn root() -> &'static CancelScope {
    static ROOT: OnceLock<CancelScope> = OnceLock::new();
    ROOT.get_or_init(CancelScope::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn cancel_is_idempotent_and_observable() {
        let scope = CancelScope::new();
        assert!(!scope.is_cancelled());
        scope.cancel();
        scope.cancel();
        assert!(scope.is_cancelled());
    }

    #[test]
    fn callbacks_run_in_lifo_order() {
        let scope = CancelScope::new();
        let order = Arc::new(spin::Mutex::new(Vec::new()));

        let first = {
            let order = Arc::clone(&order);
            scope.on_cancel(move || order.lock().push(1))
        };
        let second = {
            let order = Arc::clone(&order);
            scope.on_cancel(move || order.lock().push(2))
        };

        scope.cancel();
        assert_eq!(*order.lock(), vec![2, 1]);
        drop(first);
        drop(second);
    }

    #[test]
    fn dropped_guard_deregisters() {
        let scope = CancelScope::new();
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = Arc::clone(&fired);
            let _guard = scope.on_cancel(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        scope.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn child_scopes_inherit_cancellation() {
        let parent = CancelScope::new();
        let child = parent.child();
        let grandchild = child.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert!(grandchild.is_cancelled());
    }

    #[test]
    fn child_of_cancelled_parent_is_born_cancelled() {
        let parent = CancelScope::new();
        parent.cancel();
        assert!(parent.child().is_cancelled());
    }

    #[test]
    fn registering_on_cancelled_scope_fires_immediately() {
        let scope = CancelScope::new();
        scope.cancel();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = Arc::clone(&fired);
        let _guard = scope.on_cancel(move || {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
