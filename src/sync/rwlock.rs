// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::wait_queue::WaitQueue;
use crate::util::Backoff;
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicUsize, Ordering};

/// Writer-held bit.
const WRITER: usize = 1 << (usize::BITS - 1);
/// Writer-pending bit: blocks new readers so writers cannot starve.
const PENDING: usize = 1 << (usize::BITS - 2);
/// Low bits count active readers.
const READERS: usize = PENDING - 1;

/// An async reader/writer lock biased against reader starvation of writers.
///
/// One state word: a writer-held high bit, a writer-pending bit just below
/// it and a reader count in the rest. An arriving writer announces itself
/// via the pending bit, which stops new readers from entering; once the
/// existing readers drain it swaps the pending bit for the held bit.
pub struct RwLock<T: ?Sized> {
    state: AtomicUsize,
    readers: WaitQueue,
    writers: WaitQueue,
    value: UnsafeCell<T>,
}

// Safety: the state protocol hands out either shared or exclusive access.
unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
// Safety: see above; readers only get `&T`, so `T: Sync` is also required.
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

/// Shared guard returned by [`RwLock::read`].
#[must_use = "dropping a ReadGuard immediately releases the lock"]
pub struct ReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

/// Exclusive guard returned by [`RwLock::write`].
#[must_use = "dropping a WriteGuard immediately releases the lock"]
pub struct WriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
}

impl<T> RwLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            state: AtomicUsize::new(0),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
            value: UnsafeCell::new(value),
        }
    }

    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Acquires shared access. Waits while a writer holds the lock *or* one
    /// is pending.
    pub async fn read(&self) -> ReadGuard<'_, T> {
        let mut backoff = Backoff::new();
        for _ in 0..32 {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            backoff.spin();
        }
        loop {
            if let Some(guard) = self.try_read() {
                return guard;
            }
            let wait = self.readers.wait();
            if let Some(guard) = self.try_read() {
                return guard;
            }
            wait.await;
        }
    }

    pub fn try_read(&self) -> Option<ReadGuard<'_, T>> {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current & (WRITER | PENDING) != 0 {
                return None;
            }
            debug_assert!(current & READERS < READERS, "reader count overflow");
            match self.state.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(ReadGuard { lock: self }),
                Err(actual) => current = actual,
            }
        }
    }

    /// Acquires exclusive access. Announces intent first so that the reader
    /// stream dries up, then takes the lock once the count hits zero.
    pub async fn write(&self) -> WriteGuard<'_, T> {
        let mut backoff = Backoff::new();
        self.state.fetch_or(PENDING, Ordering::AcqRel);
        for _ in 0..32 {
            if let Some(guard) = self.try_write_pending() {
                return guard;
            }
            backoff.spin();
        }
        loop {
            // another writer may have swapped the announcement for the held
            // bit; renew it
            self.state.fetch_or(PENDING, Ordering::AcqRel);
            if let Some(guard) = self.try_write_pending() {
                return guard;
            }
            let wait = self.writers.wait();
            if let Some(guard) = self.try_write_pending() {
                return guard;
            }
            wait.await;
        }
    }

    pub fn try_write(&self) -> Option<WriteGuard<'_, T>> {
        // an opportunistic writer that has not announced itself may take an
        // entirely free lock
        if self
            .state
            .compare_exchange(0, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    /// Swap our pending announcement for the held bit; only possible when no
    /// reader and no other writer is inside.
    fn try_write_pending(&self) -> Option<WriteGuard<'_, T>> {
        if self
            .state
            .compare_exchange(PENDING, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.writers.try_wait();
            Some(WriteGuard { lock: self })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.value.get_mut()
    }

    fn release_read(&self) {
        let prev = self.state.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev & READERS > 0, "released a reader that never held");
        if prev & READERS == 1 && prev & PENDING != 0 {
            // last reader out with a writer waiting
            self.writers.notify(1, true);
        }
    }

    fn release_write(&self) {
        let prev = self.state.fetch_and(!WRITER, Ordering::AcqRel);
        debug_assert!(prev & WRITER != 0, "released a writer that never held");
        // wake a pending writer first; if none takes over, the readers run
        self.writers.notify(1, true);
        self.readers.notify_all();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("RwLock");
        match self.try_read() {
            Some(guard) => s.field("value", &&*guard),
            None => s.field("value", &"<write-locked>"),
        };
        s.finish()
    }
}

impl<T: ?Sized> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the reader count in the state word protects this access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReadGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: ?Sized> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the WRITER bit grants exclusive access.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the WRITER bit grants exclusive access.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for WriteGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_share_writers_exclude() {
        let lock = RwLock::new(7);
        let a = lock.try_read().unwrap();
        let b = lock.try_read().unwrap();
        assert!(lock.try_write().is_none());
        drop(a);
        assert!(lock.try_write().is_none());
        drop(b);
        let mut w = lock.try_write().unwrap();
        *w += 1;
        assert!(lock.try_read().is_none());
        drop(w);
        assert_eq!(*lock.try_read().unwrap(), 8);
    }

    #[test]
    fn pending_writer_blocks_new_readers() {
        let lock = RwLock::new(0);
        let reader = lock.try_read().unwrap();
        // announce a writer
        lock.state.fetch_or(PENDING, Ordering::AcqRel);
        assert!(lock.try_read().is_none());
        drop(reader);
        // pending swaps to held
        assert!(lock.try_write_pending().is_some());
    }
}
