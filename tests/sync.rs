// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::runtime::Builder;
use spindle::sync::{Barrier, Condvar, Mutex, Notify, Semaphore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn runtime() -> spindle::Runtime {
    Builder::new().workers(4).build()
}

/// Polls `condition` until it holds or a couple of seconds pass.
async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        spindle::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[test]
fn semaphore_wakes_exactly_one_waiter_per_permit() {
    let rt = runtime();
    rt.block_on(async {
        let sem = Arc::new(Semaphore::bounded(1, 0));
        let resumed = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let resumed = Arc::clone(&resumed);
                spindle::spawn(async move {
                    sem.acquire().await.forget();
                    resumed.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        // let both tasks park
        spindle::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(resumed.load(Ordering::SeqCst), 0);

        sem.release(1);
        assert!(eventually(|| resumed.load(Ordering::SeqCst) == 1).await);

        // the second waiter stays blocked
        spindle::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(resumed.load(Ordering::SeqCst), 1);

        sem.release(1);
        assert!(eventually(|| resumed.load(Ordering::SeqCst) == 2).await);

        for waiter in waiters {
            waiter.await.unwrap();
        }
    });
}

#[test]
fn semaphore_timed_acquire_gives_up() {
    let rt = runtime();
    rt.block_on(async {
        let sem = Semaphore::bounded(1, 0);
        let begin = std::time::Instant::now();
        let result = sem.acquire_for(Duration::from_millis(40)).await;
        assert!(result.is_err());
        assert!(begin.elapsed() >= Duration::from_millis(40));

        let deadline = std::time::Instant::now() + Duration::from_millis(30);
        assert!(sem.acquire_until(deadline).await.is_err());

        // permits released after the timeout are not lost
        sem.release(1);
        assert!(sem.acquire_for(Duration::from_millis(500)).await.is_ok());
    });
}

#[test]
fn notify_reaches_only_registered_waiters() {
    let rt = runtime();
    rt.block_on(async {
        let notify = Arc::new(Notify::new());
        // untriggered notifications are not recorded
        assert!(!notify.notify_one());

        let registered = Arc::clone(&notify);
        let waiter = spindle::spawn(async move {
            registered.notified().await;
            5u32
        });

        let mut woken = false;
        for _ in 0..400 {
            if notify.notify_one() {
                woken = true;
                break;
            }
            spindle::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(woken, "waiter never registered");
        assert_eq!(waiter.await.unwrap(), 5);
    });
}

#[test]
fn permits_in_flight_never_exceed_the_bound() {
    const TASKS: usize = 16;
    const BOUND: usize = 3;

    let rt = runtime();
    rt.block_on(async {
        let sem = Arc::new(Semaphore::bounded(BOUND, BOUND));
        let inside = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let sem = Arc::clone(&sem);
                let inside = Arc::clone(&inside);
                let peak = Arc::clone(&peak);
                spindle::spawn(async move {
                    for _ in 0..50 {
                        let permit = sem.acquire().await;
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        spindle::yield_now().await;
                        inside.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= BOUND);
        assert_eq!(inside.load(Ordering::SeqCst), 0);
    });
}

#[test]
fn mutex_serialises_increments() {
    const TASKS: usize = 8;
    const PER_TASK: usize = 1_000;

    let rt = runtime();
    rt.block_on(async {
        let counter = Arc::new(Mutex::new(0usize));
        let tasks: Vec<_> = (0..TASKS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                spindle::spawn(async move {
                    for _ in 0..PER_TASK {
                        let mut guard = counter.lock().await;
                        *guard += 1;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*counter.lock().await, TASKS * PER_TASK);
    });
}

#[test]
fn condvar_wakes_predicate_waiters() {
    let rt = runtime();
    rt.block_on(async {
        let state = Arc::new((Mutex::new(0u32), Condvar::new()));

        let waiter = {
            let state = Arc::clone(&state);
            spindle::spawn(async move {
                let (lock, condvar) = &*state;
                let guard = lock.lock().await;
                let guard = condvar.wait_while(guard, |value| *value < 3).await;
                *guard
            })
        };

        for _ in 0..3 {
            spindle::time::sleep(Duration::from_millis(10)).await;
            let (lock, condvar) = &*state;
            let mut guard = lock.lock().await;
            *guard += 1;
            drop(guard);
            condvar.notify_one();
        }

        assert_eq!(waiter.await.unwrap(), 3);
    });
}

#[test]
fn barrier_releases_a_full_generation_with_one_leader() {
    const WIDTH: usize = 8;

    let rt = runtime();
    rt.block_on(async {
        let barrier = Arc::new(Barrier::new(WIDTH));
        let leaders = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..WIDTH)
            .map(|_| {
                let barrier = Arc::clone(&barrier);
                let leaders = Arc::clone(&leaders);
                spindle::spawn(async move {
                    let result = barrier.wait().await;
                    if result.is_leader() {
                        leaders.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(leaders.load(Ordering::SeqCst), 1);
    });
}
