// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::runtime::{self, Shared};
use crate::time::sleep::sleep_until_nanos;
use core::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A deadline-stepped ticker.
///
/// Each [`Interval::tick`] waits until the next multiple of the period past
/// the creation instant. Ticks that fall behind (because a task was busy for
/// longer than the period) are skipped rather than bunched up.
pub struct Interval {
    shared: Arc<Shared>,
    period_nanos: u64,
    next: u64,
}

/// A ticker firing every `period`, starting one period from now.
///
/// # Panics
///
/// Panics when called outside of a runtime context, or if `period` is zero.
#[track_caller]
pub fn interval(period: Duration) -> Interval {
    assert!(!period.is_zero(), "interval period must be non-zero");
    let shared =
        runtime::current_shared().expect("spindle::time::interval requires a runtime context");
    let period_nanos = u64::try_from(period.as_nanos()).unwrap_or(u64::MAX);
    let next = shared.timer.now_nanos().saturating_add(period_nanos);
    Interval {
        shared,
        period_nanos,
        next,
    }
}

impl Interval {
    /// Completes at the next tick deadline.
    pub async fn tick(&mut self) {
        let deadline = self.next;
        sleep_until_nanos(Arc::clone(&self.shared), deadline).await;

        let now = self.shared.timer.now_nanos();
        self.next = self.next.saturating_add(self.period_nanos);
        while self.next <= now {
            self.next = self.next.saturating_add(self.period_nanos);
        }
    }

    /// The configured period.
    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.period_nanos)
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interval")
            .field("period_nanos", &self.period_nanos)
            .field("next", &self.next)
            .finish()
    }
}
