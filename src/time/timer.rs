// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The timer daemon.
//!
//! A dedicated thread owns a two-level, time-ordered index of timer entries:
//! the first level is keyed by whole seconds of expiry, the second by a
//! 128-bit entry id that composes the exact expiry (high 64 bits, nanoseconds
//! since the timer epoch) with a hash salt (low 64 bits). Ids are therefore
//! strictly increasing per expiry and uniquely identify live entries, while
//! the salt keeps ids unique even for identical deadlines.
//!
//! The daemon sleeps until the earliest entry's expiry (or until a
//! registration pokes it), fires every due entry's waker, and removes them.
//! Registration and cancellation are `O(log n)` on the ordered maps, guarded
//! by one spin lock held only briefly.

use crate::loom::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use crate::util::mix64;
use core::task::Waker;
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Identifier of a live timer entry: `(expiry_nanos << 64) | salt`.
pub(crate) type TimerId = u128;

pub(crate) struct Timer {
    core: spin::Mutex<Core>,
    /// Guards the daemon's sleep; registrations acquire it before notifying
    /// so a poke can never slip between "compute next deadline" and "sleep".
    gate: Mutex<()>,
    cond: Condvar,
    running: AtomicBool,
    salt: AtomicU64,
    epoch: Instant,
}

struct Core {
    /// second-of-expiry → entry id → waker
    entries: BTreeMap<u64, BTreeMap<TimerId, Waker>>,
    len: usize,
}

impl Timer {
    pub(crate) fn new() -> Self {
        Self {
            core: spin::Mutex::new(Core {
                entries: BTreeMap::new(),
                len: 0,
            }),
            gate: Mutex::new(()),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            salt: AtomicU64::new(1),
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the timer epoch.
    pub(crate) fn now_nanos(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub(crate) fn deadline_after(&self, duration: Duration) -> u64 {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.now_nanos().saturating_add(nanos)
    }

    /// Registers `waker` to fire at `deadline` (nanoseconds since the
    /// epoch). The salt mixes the caller's task id with a nonce so that
    /// entries sharing a deadline stay distinct.
    pub(crate) fn register(&self, deadline: u64, waker: Waker) -> TimerId {
        let task_bits = crate::task::with_current(|task| {
            task.map(|task| task.id().as_u64()).unwrap_or(0)
        });
        let nonce = self.salt.fetch_add(1, Ordering::Relaxed);
        let id = ((deadline as u128) << 64) | u128::from(mix64(task_bits ^ nonce));

        {
            let mut core = self.core.lock();
            core.entries
                .entry(deadline / NANOS_PER_SEC)
                .or_default()
                .insert(id, waker);
            core.len += 1;
        }

        // poke the daemon so a nearer deadline shortens its sleep
        let _gate = self.gate.lock().unwrap();
        self.cond.notify_one();
        id
    }

    /// Replaces the waker of a live entry. No-op if the entry already fired.
    pub(crate) fn update_waker(&self, id: TimerId, waker: &Waker) {
        let deadline = (id >> 64) as u64;
        let mut core = self.core.lock();
        if let Some(submap) = core.entries.get_mut(&(deadline / NANOS_PER_SEC))
            && let Some(slot) = submap.get_mut(&id)
            && !slot.will_wake(waker)
        {
            *slot = waker.clone();
        }
    }

    /// Removes a live entry. Returns `false` if it already fired.
    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        let deadline = (id >> 64) as u64;
        let second = deadline / NANOS_PER_SEC;
        let mut core = self.core.lock();
        let Some(submap) = core.entries.get_mut(&second) else {
            return false;
        };
        let removed = submap.remove(&id).is_some();
        if removed {
            core.len -= 1;
            if core.entries.get(&second).is_some_and(BTreeMap::is_empty) {
                core.entries.remove(&second);
            }
        }
        removed
    }

    pub(crate) fn len(&self) -> usize {
        self.core.lock().len
    }

    /// The daemon loop.
    pub(crate) fn run(&self) {
        let _span = tracing::debug_span!("timer").entered();
        while self.running.load(Ordering::Acquire) {
            let now = self.now_nanos();
            let due = self.core.lock().collect_due(now);
            for waker in due {
                waker.wake();
            }

            let gate = self.gate.lock().unwrap();
            if !self.running.load(Ordering::Acquire) {
                return;
            }
            // recompute under the gate: a registration that landed after the
            // sweep above now either shows up here or blocks on the gate
            // until we sleep, and then pokes us
            let next = self.core.lock().next_deadline();
            match next {
                Some(deadline) => {
                    let now = self.now_nanos();
                    if deadline > now {
                        let timeout = Duration::from_nanos(deadline - now);
                        let _ = self.cond.wait_timeout(gate, timeout).unwrap();
                    }
                }
                None => {
                    let _gate = self.cond.wait(gate).unwrap();
                }
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
        let _gate = self.gate.lock().unwrap();
        self.cond.notify_one();
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("entries", &self.len())
            .field("running", &self.running)
            .finish()
    }
}

impl Core {
    /// Removes and returns the wakers of every entry due at or before `now`.
    fn collect_due(&mut self, now: u64) -> Vec<Waker> {
        let now_second = now / NANOS_PER_SEC;
        let mut due = Vec::new();
        let mut empty_seconds = Vec::new();

        for (&second, submap) in self.entries.range_mut(..=now_second) {
            // ids order by expiry first, so everything below this key is due
            let split = ((now + 1) as u128) << 64;
            let not_due = submap.split_off(&split);
            let fired = core::mem::replace(submap, not_due);
            self.len -= fired.len();
            due.extend(fired.into_values());
            if submap.is_empty() {
                empty_seconds.push(second);
            }
        }
        for second in empty_seconds {
            self.entries.remove(&second);
        }
        due
    }

    fn next_deadline(&self) -> Option<u64> {
        let submap = self.entries.values().next()?;
        let id = submap.keys().next()?;
        Some((id >> 64) as u64)
    }
}
