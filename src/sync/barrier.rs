// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::sync::Semaphore;
use core::fmt;

/// An async barrier of fixed width.
///
/// Arrivals count up modulo a generation; the arrival that completes a
/// generation becomes its leader and releases `width - 1` permits on the
/// underlying counting semaphore, freeing everyone else.
pub struct Barrier {
    width: usize,
    sem: Semaphore,
    inner: spin::Mutex<Arrivals>,
}

#[derive(Debug)]
struct Arrivals {
    count: usize,
    generation: u64,
}

/// Returned by [`Barrier::wait`]; exactly one arrival per generation is the
/// leader.
#[derive(Debug)]
pub struct BarrierWaitResult {
    is_leader: bool,
}

impl BarrierWaitResult {
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

impl Barrier {
    /// A barrier releasing once `width` tasks have arrived. A width of zero
    /// behaves like one.
    pub fn new(width: usize) -> Self {
        let width = width.max(1);
        Self {
            width,
            sem: Semaphore::bounded(width, 0),
            inner: spin::Mutex::new(Arrivals {
                count: 0,
                generation: 0,
            }),
        }
    }

    /// Arrives and waits for the rest of the generation.
    pub async fn wait(&self) -> BarrierWaitResult {
        {
            let mut inner = self.inner.lock();
            inner.count += 1;
            if inner.count == self.width {
                inner.count = 0;
                inner.generation = inner.generation.wrapping_add(1);
                drop(inner);
                self.sem.release(self.width - 1);
                return BarrierWaitResult { is_leader: true };
            }
        }
        self.sem.acquire().await.forget();
        BarrierWaitResult { is_leader: false }
    }

    pub fn width(&self) -> usize {
        self.width
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Barrier")
            .field("width", &self.width)
            .field("arrived", &inner.count)
            .field("generation", &inner.generation)
            .finish()
    }
}
