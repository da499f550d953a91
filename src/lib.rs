// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A multi-threaded cooperative async task runtime.
//!
//! `spindle` schedules stackless tasks across a fixed pool of worker
//! threads pinned to CPU cores, with separate load accounting for I/O-bound
//! and compute-bound work. Tasks run to completion on the worker that
//! adopted them; the only balancing is the choice of dispatch queue at
//! spawn time; there is no work stealing.
//!
//! ```ignore
//! let rt = spindle::runtime::Builder::new().workers(4).build();
//! let sum = rt.block_on(async {
//!     let a = spindle::spawn(async { 2 });
//!     let b = spindle::spawn(async { 3 });
//!     a.await.unwrap() + b.await.unwrap()
//! });
//! assert_eq!(sum, 5);
//! ```
//!
//! The pieces, leaves first:
//!
//! - [`queue`]: the lock-free MPMC continuous queue, the runtime's internal
//!   transport and the substrate of [`channel`].
//! - [`sync`]: semaphore, mutex, rwlock, notify, condvar and barrier, all
//!   built on one wait-queue primitive.
//! - [`task`]: the task record, join handles, task-local storage.
//! - [`time`]: a timer-daemon thread serving sleeps, intervals, timeouts.
//! - [`cancel`]: tree-shaped cancellation scopes.
//! - [`select`]: race futures, cancel the losers.
//! - [`io`]: the submission/completion contract for asynchronous file I/O.

mod loom;
mod park;
mod util;
mod worker;

pub mod cancel;
pub mod channel;
pub mod io;
pub mod queue;
pub mod runtime;
pub mod select;
pub mod sync;
pub mod task;
pub mod time;

pub use runtime::{Runtime, spawn, spawn_core};
pub use select::{Choice2, Choice3, Choice4, select2, select3, select4};
pub use task::{JoinError, JoinHandle, yield_now};
