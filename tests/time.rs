// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::cancel::CancelScope;
use spindle::runtime::Builder;
use spindle::time::{interval, sleep, timeout};
use std::time::{Duration, Instant};

fn runtime() -> spindle::Runtime {
    Builder::new().workers(4).build()
}

#[test]
fn sleep_honours_its_deadline() {
    let rt = runtime();
    rt.block_on(async {
        let begin = Instant::now();
        sleep(Duration::from_millis(50)).await;
        let elapsed = begin.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "woke early: {elapsed:?}");
        // generous ceiling for loaded test machines
        assert!(elapsed < Duration::from_secs(2), "woke far too late: {elapsed:?}");
    });
}

#[test]
fn cancelling_the_scope_interrupts_a_sleep() {
    let rt = runtime();
    rt.block_on(async {
        let scope = CancelScope::new();
        let observer = scope.clone();
        let sleeper = spindle::spawn(async move {
            let begin = Instant::now();
            let outcome = observer.run_until_cancelled(sleep(Duration::from_secs(30))).await;
            (outcome.is_none(), begin.elapsed())
        });

        sleep(Duration::from_millis(50)).await;
        scope.cancel();

        let (cancelled, elapsed) = sleeper.await.unwrap();
        assert!(cancelled, "sleep ran to completion despite cancellation");
        assert!(elapsed < Duration::from_secs(5), "cancellation wasn't prompt");
    });
}

#[test]
fn cancelling_the_task_interrupts_a_sleep() {
    let rt = runtime();
    rt.block_on(async {
        let sleeper = spindle::spawn(async {
            sleep(Duration::from_secs(30)).await;
            "never"
        });

        sleep(Duration::from_millis(30)).await;
        assert!(sleeper.cancel());

        let begin = Instant::now();
        let error = sleeper.await.unwrap_err();
        assert!(error.is_cancelled());
        assert!(begin.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn timeout_returns_the_value_when_in_time() {
    let rt = runtime();
    rt.block_on(async {
        let result = timeout(Duration::from_secs(5), async {
            sleep(Duration::from_millis(10)).await;
            42
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    });
}

#[test]
fn timeout_elapses_on_a_slow_future() {
    let rt = runtime();
    rt.block_on(async {
        let begin = Instant::now();
        let result = timeout(Duration::from_millis(40), sleep(Duration::from_secs(30))).await;
        assert!(result.is_err());
        assert!(begin.elapsed() >= Duration::from_millis(40));
        assert!(begin.elapsed() < Duration::from_secs(5));
    });
}

#[test]
fn with_timeout_scope_fires_on_its_own() {
    let rt = runtime();
    rt.block_on(async {
        let scope = CancelScope::with_timeout(Duration::from_millis(40));
        assert!(!scope.is_cancelled());
        scope.cancelled().await;
        assert!(scope.is_cancelled());
        // awaiting a fired scope completes without further action
        scope.cancelled().await;
    });
}

#[test]
fn interval_ticks_do_not_drift_backwards() {
    let rt = runtime();
    rt.block_on(async {
        let begin = Instant::now();
        let mut ticker = interval(Duration::from_millis(20));
        for _ in 0..5 {
            ticker.tick().await;
        }
        // five ticks of 20ms each
        assert!(begin.elapsed() >= Duration::from_millis(100));
    });
}

#[test]
fn timer_entries_are_cleaned_up_after_cancellation() {
    let rt = runtime();
    rt.block_on(async {
        // dropping a pending sleep must deregister its entry
        {
            let pending = sleep(Duration::from_secs(60));
            let _ = timeout(Duration::from_millis(10), pending).await;
        }
        // give the daemon a beat, then make sure nothing stray fires
        sleep(Duration::from_millis(30)).await;
    });
}
