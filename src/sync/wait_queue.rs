// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The generic primitive backing every suspending synchronisation object.
//!
//! A [`WaitQueue`] is a spin-protected FIFO of waiters plus a counter of
//! *untriggered notifications*: notifications that arrived while no waiter
//! was queued. The counter is what lets permit-style primitives (semaphore,
//! mutex unlock tokens, channel sends) notify before anyone waits without
//! losing the wakeup.
//!
//! Waiters are recorded as [`Waker`]s. A task's waker routes its wakeup to
//! `Worker::activate_task` on the task's owning worker, so a queued waker is
//! this runtime's embodiment of the (worker, task-id) pair.
//!
//! Registration is *eager*: [`WaitQueue::wait`] links the node (or consumes a
//! counter token) before the future is first polled. Callers exploit this to
//! close check-then-wait races: register, re-check the guarded condition,
//! then await. Dropping an unfired [`Wait`] unlinks its node; dropping a
//! *notified* but unconsumed one passes the notification on.

use crate::loom::sync::atomic::{AtomicU8, Ordering};
use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};
use std::collections::VecDeque;
use std::sync::Arc;

const WAITING: u8 = 0;
const WOKEN: u8 = 1;

pub(crate) struct WaitQueue {
    inner: spin::Mutex<Inner>,
}

struct Inner {
    waiters: VecDeque<Arc<WaitNode>>,
    untriggered: usize,
}

pub(crate) struct WaitNode {
    state: AtomicU8,
    waker: spin::Mutex<Option<Waker>>,
}

impl WaitNode {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(WAITING),
            waker: spin::Mutex::new(None),
        }
    }

    pub(crate) fn is_woken(&self) -> bool {
        self.state.load(Ordering::Acquire) == WOKEN
    }

    /// Records the caller's waker and reports whether the node has fired.
    ///
    /// Safe against a concurrent notify: the state is re-checked after the
    /// waker store, so a notification that raced the store is still observed.
    pub(crate) fn poll_ready(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.is_woken() {
            return Poll::Ready(());
        }
        {
            let mut slot = self.waker.lock();
            match &mut *slot {
                Some(existing) if existing.will_wake(cx.waker()) => {}
                slot => *slot = Some(cx.waker().clone()),
            }
        }
        if self.is_woken() {
            self.waker.lock().take();
            return Poll::Ready(());
        }
        Poll::Pending
    }
}

/// Future returned by [`WaitQueue::wait`]. Fused after completion.
#[must_use = "futures do nothing unless `.await`ed or `poll`ed"]
pub(crate) struct Wait<'a> {
    queue: &'a WaitQueue,
    /// `None` means an untriggered notification was consumed at registration
    /// and the wait is already satisfied.
    node: Option<Arc<WaitNode>>,
    done: bool,
}

impl WaitQueue {
    pub(crate) const fn new() -> Self {
        Self {
            inner: spin::Mutex::new(Inner {
                waiters: VecDeque::new(),
                untriggered: 0,
            }),
        }
    }

    /// Registers a waiter, consuming an untriggered notification instead if
    /// one is pending.
    pub(crate) fn wait(&self) -> Wait<'_> {
        let mut inner = self.inner.lock();
        if inner.untriggered > 0 {
            inner.untriggered -= 1;
            return Wait {
                queue: self,
                node: None,
                done: false,
            };
        }
        let node = Arc::new(WaitNode::new());
        inner.waiters.push_back(Arc::clone(&node));
        Wait {
            queue: self,
            node: Some(node),
            done: false,
        }
    }

    /// Unconditionally links a fresh waiter node, bypassing the untriggered
    /// counter. Used by owned futures that cannot borrow the queue.
    pub(crate) fn enqueue_node(&self) -> Arc<WaitNode> {
        let node = Arc::new(WaitNode::new());
        self.inner.lock().waiters.push_back(Arc::clone(&node));
        node
    }

    /// Counterpart of [`WaitQueue::enqueue_node`] for abandoned waits: either
    /// unlinks the node or, if it already fired unobserved, passes the
    /// notification on.
    pub(crate) fn discard_node(&self, node: &Arc<WaitNode>) {
        if !self.unlink(node) && node.is_woken() {
            self.notify(1, true);
        }
    }

    /// Consumes one untriggered notification without suspending.
    ///
    /// Fast paths that take a permit without queueing call this so the
    /// counter tracks real capacity instead of growing with every
    /// uncontended release.
    pub(crate) fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.untriggered > 0 {
            inner.untriggered -= 1;
            true
        } else {
            false
        }
    }

    /// Wakes up to `n` waiters in FIFO order.
    ///
    /// If `record_untriggered` is set, any surplus is added to the counter so
    /// a later waiter completes without suspending. Returns the number of
    /// waiters actually woken.
    pub(crate) fn notify(&self, n: usize, record_untriggered: bool) -> usize {
        let mut woken = 0;
        let mut wakers = Vec::new();
        {
            let mut inner = self.inner.lock();
            while woken < n {
                let Some(node) = inner.waiters.pop_front() else {
                    break;
                };
                node.state.store(WOKEN, Ordering::Release);
                // a waiter that has not been polled yet has no waker; its
                // first poll observes WOKEN
                if let Some(waker) = node.waker.lock().take() {
                    wakers.push(waker);
                }
                woken += 1;
            }
            if record_untriggered {
                inner.untriggered = inner.untriggered.saturating_add(n - woken);
            }
        }
        // invoke outside the lock
        for waker in wakers {
            waker.wake();
        }
        woken
    }

    /// Wakes every queued waiter. Never records untriggered notifications.
    pub(crate) fn notify_all(&self) -> usize {
        self.notify(usize::MAX, false)
    }

    fn unlink(&self, node: &Arc<WaitNode>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.waiters.len();
        inner.waiters.retain(|other| !Arc::ptr_eq(other, node));
        inner.waiters.len() != before
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WaitQueue")
            .field("waiters", &inner.waiters.len())
            .field("untriggered", &inner.untriggered)
            .finish()
    }
}

impl Future for Wait<'_> {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(());
        }
        let Some(node) = &this.node else {
            this.done = true;
            return Poll::Ready(());
        };

        match node.poll_ready(cx) {
            Poll::Ready(()) => {
                this.done = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Wait<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        match &self.node {
            Some(node) => self.queue.discard_node(node),
            None => {
                // consumed an untriggered notification without using it
                let mut inner = self.queue.inner.lock();
                inner.untriggered = inner.untriggered.saturating_add(1);
            }
        }
    }
}

impl fmt::Debug for Wait<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wait")
            .field("registered", &self.node.is_some())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Wake, Waker};

    struct CountingWaker(std::sync::atomic::AtomicUsize);
    impl Wake for CountingWaker {
        fn wake(self: Arc<Self>) {
            self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn poll_once(fut: &mut Wait<'_>, waker: &Waker) -> Poll<()> {
        let mut cx = Context::from_waker(waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn untriggered_notification_is_consumed() {
        let queue = WaitQueue::new();
        assert_eq!(queue.notify(1, true), 0);
        assert!(queue.try_wait());
        assert!(!queue.try_wait());
    }

    #[test]
    fn notify_wakes_in_fifo_order() {
        let queue = WaitQueue::new();
        let first = Arc::new(CountingWaker(0.into()));
        let second = Arc::new(CountingWaker(0.into()));

        let mut wait_a = queue.wait();
        let mut wait_b = queue.wait();
        assert!(poll_once(&mut wait_a, &Waker::from(Arc::clone(&first))).is_pending());
        assert!(poll_once(&mut wait_b, &Waker::from(Arc::clone(&second))).is_pending());

        assert_eq!(queue.notify(1, false), 1);
        assert_eq!(first.0.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(second.0.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert!(poll_once(&mut wait_a, &Waker::from(Arc::clone(&first))).is_ready());
        assert!(poll_once(&mut wait_b, &Waker::from(Arc::clone(&second))).is_pending());
    }

    #[test]
    fn dropping_unfired_wait_unlinks() {
        let queue = WaitQueue::new();
        let wait = queue.wait();
        drop(wait);
        // the queue is empty again, so this notification is recorded
        assert_eq!(queue.notify(1, true), 0);
        assert!(queue.try_wait());
    }

    #[test]
    fn dropping_notified_wait_passes_notification_on() {
        let queue = WaitQueue::new();
        let waker = Arc::new(CountingWaker(0.into()));

        let mut wait_a = queue.wait();
        assert!(poll_once(&mut wait_a, &Waker::from(Arc::clone(&waker))).is_pending());
        let wait_b = queue.wait();

        assert_eq!(queue.notify(1, false), 1);
        // a was notified but is dropped before observing it
        drop(wait_a);
        // b inherits the notification
        let mut wait_b = wait_b;
        assert!(poll_once(&mut wait_b, &Waker::from(Arc::clone(&waker))).is_ready());
    }

    #[test]
    fn surplus_is_recorded_only_when_asked() {
        let queue = WaitQueue::new();
        assert_eq!(queue.notify(3, false), 0);
        assert!(!queue.try_wait());
        assert_eq!(queue.notify(3, true), 0);
        assert!(queue.try_wait());
        assert!(queue.try_wait());
        assert!(queue.try_wait());
        assert!(!queue.try_wait());
    }
}
