// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Racing heterogeneous futures: first to complete wins, losers are
//! cancelled.
//!
//! Each branch is spawned as its own task under a shared cancellation
//! scope. The first branch to finish *uncancelled* claims the winner slot
//! with a compare-exchange, cancels the shared scope (which propagates to
//! every branch task's scope, waking sleeps and cancellation-aware waits),
//! and releases the composite. The composite then awaits the winning
//! branch's join handle and wraps its value in the arity's tagged union;
//! losers never run to normal completion and their outcomes are discarded.
//!
//! A panic in the winning branch propagates to the caller; loser panics are
//! suppressed. Requires a runtime context, since branches are real tasks.

use crate::cancel::{self, CancelScope};
use crate::sync::Semaphore;
use core::any::Any;
use core::panic::AssertUnwindSafe;
use core::pin::Pin;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::task::{Context, Poll};
use pin_project::pin_project;
use std::sync::Arc;

const NO_WINNER: usize = usize::MAX;

struct SelectCore {
    winner: AtomicUsize,
    branches: AtomicUsize,
    waiter: Semaphore,
}

impl SelectCore {
    fn new(branches: usize) -> Arc<Self> {
        Arc::new(Self {
            winner: AtomicUsize::new(NO_WINNER),
            branches: AtomicUsize::new(branches),
            waiter: Semaphore::bounded(1, 0),
        })
    }

    /// First-wins barrier.
    fn try_win(&self, index: usize) -> bool {
        self.winner
            .compare_exchange(NO_WINNER, index, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Keeps the composite from waiting forever when every branch dies without
/// a winner (all cancelled from outside, or all panicked).
struct BranchExit {
    core: Arc<SelectCore>,
}

impl Drop for BranchExit {
    fn drop(&mut self) {
        if self.core.branches.fetch_sub(1, Ordering::AcqRel) == 1
            && self.core.winner.load(Ordering::SeqCst) == NO_WINNER
        {
            self.core.waiter.release(1);
        }
    }
}

/// Turns a panicking poll into a value so a branch can still claim the win
/// before rethrowing.
#[pin_project]
struct CatchPanic<F> {
    #[pin]
    future: F,
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match std::panic::catch_unwind(AssertUnwindSafe(|| this.future.poll(cx))) {
            Ok(poll) => poll.map(Ok),
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

async fn branch<F: Future>(
    index: usize,
    core: Arc<SelectCore>,
    scope: CancelScope,
    future: F,
) -> Option<F::Output> {
    let _exit = BranchExit {
        core: Arc::clone(&core),
    };
    // this task's own scope is a child of the select scope, so both external
    // cancellation and a sibling's win are observed here
    let own = cancel::current();
    let outcome = own.run_until_cancelled(CatchPanic { future }).await?;
    if core.try_win(index) {
        scope.cancel();
        core.waiter.release(1);
        match outcome {
            Ok(output) => Some(output),
            // rethrow after winning: the payload lands in this task's panic
            // slot and the composite surfaces it from the join handle
            Err(payload) => std::panic::resume_unwind(payload),
        }
    } else {
        // a loser's value or panic is discarded
        None
    }
}

macro_rules! define_select {
    (
        $(#[$meta:meta])*
        fn $name:ident, enum $choice:ident, $(($idx:tt, $F:ident, $var:ident, $handle:ident)),+
    ) => {
        /// Tagged union carrying the winning branch's payload.
        #[derive(Debug, Clone, Copy, Eq, PartialEq)]
        pub enum $choice<$($F),+> {
            $($var($F)),+
        }

        $(#[$meta])*
        pub async fn $name<$($F),+>($($handle: $F),+) -> $choice<$($F::Output),+>
        where
            $($F: Future + Send + 'static, $F::Output: Send + 'static,)+
        {
            let scope = cancel::current().child();
            let branches = [$($idx),+].len();
            let core = SelectCore::new(branches);

            $(
                let $handle = crate::runtime::spawn_scoped(
                    branch($idx, Arc::clone(&core), scope.clone(), $handle),
                    scope.clone(),
                );
            )+

            core.waiter.acquire().await.forget();

            match core.winner.load(Ordering::SeqCst) {
                $(
                    $idx => match $handle.await {
                        Ok(output) => $choice::$var(
                            output.expect("select winner finished without a value"),
                        ),
                        Err(error) => error.resume_panic(),
                    },
                )+
                NO_WINNER => {
                    // no branch won: every branch ended by panic or outside
                    // cancellation; surface the first panic, if any
                    $(
                        if let Err(error) = $handle.await
                            && error.is_panic()
                        {
                            error.resume_panic();
                        }
                    )+
                    panic!("select: every branch was cancelled");
                }
                other => unreachable!("select recorded invalid winner index {other}"),
            }
        }
    };
}

define_select! {
    /// Races two futures; the loser is cancelled.
    fn select2, enum Choice2,
    (0, A, First, a),
    (1, B, Second, b)
}

define_select! {
    /// Races three futures; the losers are cancelled.
    fn select3, enum Choice3,
    (0, A, First, a),
    (1, B, Second, b),
    (2, C, Third, c)
}

define_select! {
    /// Races four futures; the losers are cancelled.
    fn select4, enum Choice4,
    (0, A, First, a),
    (1, B, Second, b),
    (2, C, Third, c),
    (3, D, Fourth, d)
}
