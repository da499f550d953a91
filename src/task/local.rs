// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task-local storage.
//!
//! Every task record carries its own typed map; a child task starts with an
//! empty map, and nothing a child stores is ever visible to its parent. Keys
//! are declared with [`task_local!`](crate::task_local) and lazily assigned a
//! process-unique slot id on first use.

use core::any::Any;
use core::sync::atomic::{AtomicU64, Ordering};
use std::collections::HashMap;
use std::sync::OnceLock;

static NEXT_SLOT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Default)]
pub(crate) struct LocalMap {
    slots: HashMap<u64, Box<dyn Any + Send>>,
}

impl LocalMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

/// A key into task-local storage.
///
/// Declare keys with the [`task_local!`](crate::task_local) macro; access
/// them from inside a task with [`set`](LocalKey::set), [`get`](LocalKey::get)
/// and [`with`](LocalKey::with).
pub struct LocalKey<T: 'static> {
    slot: OnceLock<u64>,
    _marker: core::marker::PhantomData<fn() -> T>,
}

impl<T: Send + 'static> LocalKey<T> {
    #[doc(hidden)]
    pub const fn new() -> Self {
        Self {
            slot: OnceLock::new(),
            _marker: core::marker::PhantomData,
        }
    }

    fn slot(&'static self) -> u64 {
        *self
            .slot
            .get_or_init(|| NEXT_SLOT.fetch_add(1, Ordering::Relaxed))
    }

    /// Stores `value` in the current task, replacing any previous value.
    ///
    /// # Panics
    ///
    /// Panics outside of a task.
    pub fn set(&'static self, value: T) {
        let slot = self.slot();
        crate::task::with_current(|task| {
            let task = task.expect("task-local storage accessed outside of a task");
            task.header().locals.lock().slots.insert(slot, Box::new(value));
        });
    }

    /// Removes and returns the current task's value.
    pub fn take(&'static self) -> Option<T> {
        let slot = self.slot();
        crate::task::with_current(|task| {
            let task = task.expect("task-local storage accessed outside of a task");
            task.header()
                .locals
                .lock()
                .slots
                .remove(&slot)
                .map(|boxed| *boxed.downcast::<T>().expect("task-local type mismatch"))
        })
    }

    /// Runs `f` with mutable access to the current task's value.
    ///
    /// Returns `None` if the task has no value for this key.
    pub fn with<R>(&'static self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.slot();
        crate::task::with_current(|task| {
            let task = task.expect("task-local storage accessed outside of a task");
            let mut locals = task.header().locals.lock();
            locals
                .slots
                .get_mut(&slot)
                .map(|boxed| f(boxed.downcast_mut::<T>().expect("task-local type mismatch")))
        })
    }

    /// Clones the current task's value out of storage.
    pub fn get(&'static self) -> Option<T>
    where
        T: Clone,
    {
        self.with(|value| value.clone())
    }
}

impl<T: 'static> core::fmt::Debug for LocalKey<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LocalKey")
            .field("slot", &self.slot.get())
            .finish()
    }
}

/// Declares one or more task-local storage keys.
///
/// ```ignore
/// spindle::task_local! {
///     static REQUEST_ID: u64;
///     static SESSION: String;
/// }
/// ```
#[macro_export]
macro_rules! task_local {
    ($($(#[$meta:meta])* $vis:vis static $name:ident: $ty:ty;)+) => {
        $(
            $(#[$meta])*
            $vis static $name: $crate::task::LocalKey<$ty> =
                $crate::task::LocalKey::new();
        )+
    };
}
