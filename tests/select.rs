// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::cancel::CancelScope;
use spindle::runtime::Builder;
use spindle::time::sleep;
use spindle::{Choice2, Choice3, select2, select3};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

fn runtime() -> spindle::Runtime {
    Builder::new().workers(4).build()
}

#[test]
fn fastest_branch_wins_and_losers_are_cancelled() {
    let rt = runtime();
    rt.block_on(async {
        let slow_finished = Arc::new(AtomicBool::new(false));
        let armed = CancelScope::new();

        let slow = {
            let slow_finished = Arc::clone(&slow_finished);
            async move {
                sleep(Duration::from_millis(80)).await;
                slow_finished.store(true, Ordering::SeqCst);
                3.14f64
            }
        };
        let fast = async {
            sleep(Duration::from_millis(20)).await;
            42i32
        };
        let never = {
            let armed = armed.clone();
            async move {
                armed.cancelled().await;
                7u8
            }
        };

        let winner = select3(slow, fast, never).await;
        match winner {
            Choice3::Second(value) => assert_eq!(value, 42),
            other => panic!("wrong branch won: {other:?}"),
        }

        // the slow branch must not run to normal completion
        sleep(Duration::from_millis(200)).await;
        assert!(!slow_finished.load(Ordering::SeqCst));
    });
}

#[test]
fn select2_picks_the_ready_branch() {
    let rt = runtime();
    rt.block_on(async {
        let winner = select2(
            async {
                sleep(Duration::from_millis(100)).await;
                "slow"
            },
            async { "immediate" },
        )
        .await;
        assert_eq!(winner, Choice2::Second("immediate"));
    });
}

#[test]
fn a_winning_branch_panic_propagates() {
    let rt = runtime();
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        rt.block_on(async {
            select2(
                async {
                    sleep(Duration::from_millis(5)).await;
                    panic!("winner exploded");
                },
                async {
                    sleep(Duration::from_secs(30)).await;
                },
            )
            .await
        })
    }));
    let payload = result.unwrap_err();
    let message = payload.downcast_ref::<&str>().copied().unwrap_or_default();
    assert_eq!(message, "winner exploded");
}

#[test]
fn losing_branch_panic_is_suppressed() {
    let rt = runtime();
    rt.block_on(async {
        let winner = select2(
            async { 1u32 },
            async {
                sleep(Duration::from_millis(100)).await;
                panic!("loser exploded");
            },
        )
        .await;
        assert!(matches!(winner, Choice2::First(1)));
    });
}
