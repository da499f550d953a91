// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::{Arc, Condvar, Mutex};
use std::task::{Wake, Waker};
use std::time::Duration;

/// A binary-semaphore style thread parker.
///
/// Workers block on their parker when both their dispatch queue and their
/// active deque are empty; `unpark` stores a token so that a wakeup arriving
/// just before `park` is never lost.
#[derive(Clone, Debug)]
pub(crate) struct Parker {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    token: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                token: Mutex::new(false),
                cvar: Condvar::new(),
            }),
        }
    }

    /// Blocks the current thread until a token is available, then consumes it.
    pub(crate) fn park(&self) {
        let mut token = self.inner.token.lock().unwrap();
        while !*token {
            token = self.inner.cvar.wait(token).unwrap();
        }
        *token = false;
    }

    /// Like [`Parker::park`] but gives up after `timeout`.
    ///
    /// Returns `true` if a token was consumed.
    pub(crate) fn park_timeout(&self, timeout: Duration) -> bool {
        let mut token = self.inner.token.lock().unwrap();
        if !*token {
            let (guard, _) = self.inner.cvar.wait_timeout(token, timeout).unwrap();
            token = guard;
        }
        let woken = *token;
        *token = false;
        woken
    }

    /// Makes a token available and wakes the parked thread, if any.
    pub(crate) fn unpark(&self) {
        let mut token = self.inner.token.lock().unwrap();
        *token = true;
        self.inner.cvar.notify_one();
    }

    /// A [`Waker`] that unparks this parker, for driving futures from a
    /// non-runtime thread.
    pub(crate) fn waker(&self) -> Waker {
        Waker::from(Arc::clone(&self.inner))
    }
}

impl Wake for Inner {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        let mut token = self.token.lock().unwrap();
        *token = true;
        self.cvar.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::new();
        parker.unpark();
        // must return immediately
        parker.park();
    }

    #[test]
    fn park_timeout_expires() {
        let parker = Parker::new();
        let begin = Instant::now();
        assert!(!parker.park_timeout(Duration::from_millis(20)));
        assert!(begin.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn cross_thread_unpark() {
        let parker = Parker::new();
        let remote = parker.clone();
        let handle = thread::spawn(move || remote.unpark());
        parker.park();
        handle.join().unwrap();
    }
}
