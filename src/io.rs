// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Asynchronous file I/O.
//!
//! The runtime core treats the platform backend as an external collaborator
//! behind the [`Driver`] trait: submissions in, token-addressed completions
//! out, never blocking a worker. [`BlockingDriver`] is the bundled backend:
//! a small pool of blocking threads fed through the continuous queue.

mod blocking;
mod driver;
mod file;

pub use blocking::BlockingDriver;
pub use driver::{Completion, Driver, FileId, IoError, Op, OpenOptions, Outcome, Token};
pub use file::{File, SeekOutOfBounds, WriteError};
