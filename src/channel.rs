// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An unbounded MPMC channel built on the [continuous queue](crate::queue).
//!
//! Sending never waits for capacity (frames are chained on demand), so
//! [`Sender::send`] only fails by returning the rejected value once the
//! channel is closed. Receivers park on a wait queue whose untriggered
//! counter tracks sends that arrived before any receiver was waiting, so a
//! wakeup is never lost. Closure is communicated by value: `recv` returns
//! `None` exactly when the channel is closed *and* drained.

use crate::queue::{self, PopError};
use crate::sync::wait_queue::WaitQueue;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Creates an unbounded MPMC channel.
///
/// Both halves are cloneable; the channel closes when the last handle of
/// either side is dropped (or [`Sender::stop`]/[`Receiver::stop`] is called
/// explicitly).
pub fn channel<T: Send>() -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = queue::create();
    let shared = Arc::new(Shared {
        recv_waiters: WaitQueue::new(),
        senders: AtomicUsize::new(1),
        receivers: AtomicUsize::new(1),
    });
    (
        Sender {
            queue: tx,
            shared: Arc::clone(&shared),
        },
        Receiver { queue: rx, shared },
    )
}

struct Shared {
    recv_waiters: WaitQueue,
    senders: AtomicUsize,
    receivers: AtomicUsize,
}

/// Error returned by [`Sender::send`] on a closed channel, carrying the
/// undelivered element.
#[derive(Eq, PartialEq)]
pub struct SendError<T>(pub T);

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("SendError(..)")
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("channel closed")
    }
}

impl<T> core::error::Error for SendError<T> {}

/// Reasons a [`Receiver::try_recv`] produced nothing.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TryRecvError {
    /// No element is currently queued; senders are still live.
    Empty,
    /// The channel is closed and fully drained.
    Closed,
}

impl fmt::Display for TryRecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryRecvError::Empty => f.pad("channel empty"),
            TryRecvError::Closed => f.pad("channel closed"),
        }
    }
}

impl core::error::Error for TryRecvError {}

/// The sending half of a channel.
pub struct Sender<T> {
    queue: queue::Sender<T>,
    shared: Arc<Shared>,
}

impl<T: Send> Sender<T> {
    /// Sends `value`, handing it back if the channel is closed.
    ///
    /// Unbounded: never waits for a receiver.
    pub async fn send(&mut self, value: T) -> Result<(), SendError<T>> {
        match self.queue.push(value) {
            Ok(()) => {
                // record the wakeup even with no receiver parked yet
                self.shared.recv_waiters.notify(1, true);
                Ok(())
            }
            Err(value) => Err(SendError(value)),
        }
    }

    /// Closes the whole channel immediately, regardless of other senders.
    pub fn stop(&mut self) {
        self.queue.stop();
        self.shared.recv_waiters.notify_all();
    }

    /// Whether the channel has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.queue.is_stopped()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.shared.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            queue: self.queue.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.shared.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.stop();
            self.shared.recv_waiters.notify_all();
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("channel::Sender")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

/// The receiving half of a channel.
pub struct Receiver<T> {
    queue: queue::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T: Send> Receiver<T> {
    /// Receives the next element, suspending while the channel is empty.
    ///
    /// Returns `None` once the channel is closed and every queued element
    /// has been drained.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.queue.pop() {
                Ok(value) => {
                    // pair the element with its wakeup credit so the counter
                    // tracks queued elements, not historical sends
                    self.shared.recv_waiters.try_wait();
                    return Some(value);
                }
                Err(PopError::Closed) => return None,
                Err(PopError::Empty) => {
                    self.shared.recv_waiters.wait().await;
                }
            }
        }
    }

    /// Receives without suspending, reporting `Empty` or `Closed`.
    pub fn try_recv(&mut self) -> Result<T, TryRecvError> {
        match self.queue.pop() {
            Ok(value) => {
                self.shared.recv_waiters.try_wait();
                Ok(value)
            }
            Err(PopError::Empty) => Err(TryRecvError::Empty),
            Err(PopError::Closed) => Err(TryRecvError::Closed),
        }
    }

    /// Closes the channel from the receiving side; senders get their values
    /// handed back from then on.
    pub fn stop(&mut self) {
        self.queue.stop();
        self.shared.recv_waiters.notify_all();
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        self.shared.receivers.fetch_add(1, Ordering::AcqRel);
        Self {
            queue: self.queue.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        if self.shared.receivers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.stop();
            self.shared.recv_waiters.notify_all();
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("channel::Receiver")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}
