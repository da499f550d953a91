// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime;
use crate::task::JoinHandle;

/// A configurable way to spawn tasks.
///
/// ```ignore
/// let handle = TaskBuilder::new()
///     .name("stats-flusher")
///     .core(true)
///     .spawn(flush_stats());
/// ```
#[derive(Debug, Default)]
pub struct TaskBuilder<'a> {
    name: Option<&'a str>,
    core: bool,
}

impl<'a> TaskBuilder<'a> {
    pub const fn new() -> Self {
        Self {
            name: None,
            core: false,
        }
    }

    /// Names the task for tracing output. Tasks are unnamed by default.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Marks the task compute-bound, inverting the dispatch-queue choice.
    pub fn core(mut self, core: bool) -> Self {
        self.core = core;
        self
    }

    /// Spawns `future` onto the current runtime.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a runtime context.
    #[track_caller]
    pub fn spawn<F>(self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let shared = runtime::current_shared()
            .expect("TaskBuilder::spawn called outside of a spindle runtime context");
        runtime::spawn_inner(shared, future, self.core, self.name)
    }
}
