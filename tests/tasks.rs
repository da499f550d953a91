// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::runtime::Builder;
use spindle::task::TaskBuilder;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn runtime() -> spindle::Runtime {
    Builder::new().workers(4).build()
}

#[test]
fn spawned_tasks_deliver_their_output() {
    let rt = runtime();
    let sum = rt.block_on(async {
        let a = spindle::spawn(async { 2u64 });
        let b = spindle::spawn_core(async { 3u64 });
        a.await.unwrap() + b.await.unwrap()
    });
    assert_eq!(sum, 5);
}

#[test]
fn many_tasks_across_both_queues() {
    const TASKS: usize = 500;

    let rt = runtime();
    let total: u64 = rt.block_on(async {
        let handles: Vec<_> = (0..TASKS)
            .map(|i| {
                let fut = async move {
                    spindle::yield_now().await;
                    i as u64
                };
                if i % 2 == 0 {
                    spindle::spawn(fut)
                } else {
                    spindle::spawn_core(fut)
                }
            })
            .collect();
        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        total
    });
    assert_eq!(total, (0..500u64).sum());
}

#[test]
fn a_panicking_task_surfaces_its_payload() {
    let rt = runtime();
    rt.block_on(async {
        let handle = spindle::spawn(async {
            panic!("boom");
        });
        let error = handle.await.unwrap_err();
        assert!(error.is_panic());
        match error {
            spindle::JoinError::Panicked(payload) => {
                assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "boom");
            }
            other => panic!("expected a panic, got {other:?}"),
        }
    });
}

#[test]
fn a_cancelled_task_reports_cancellation() {
    let rt = runtime();
    rt.block_on(async {
        let handle = spindle::spawn(async {
            spindle::time::sleep(Duration::from_secs(60)).await;
        });
        spindle::time::sleep(Duration::from_millis(20)).await;
        assert!(handle.cancel());
        let error = handle.await.unwrap_err();
        assert!(error.is_cancelled());
    });
}

#[test]
fn cancelling_a_parent_task_reaches_child_scopes() {
    let rt = runtime();
    rt.block_on(async {
        let observed = Arc::new(AtomicUsize::new(0));
        let observed2 = Arc::clone(&observed);

        let parent = spindle::spawn(async move {
            let child = spindle::spawn(async move {
                // a child task's scope is a child of its spawner's scope
                spindle::cancel::current().cancelled().await;
                observed2.fetch_add(1, Ordering::SeqCst);
            });
            let _ = child.await;
        });

        spindle::time::sleep(Duration::from_millis(30)).await;
        assert!(parent.cancel());
        assert!(parent.await.unwrap_err().is_cancelled());

        for _ in 0..200 {
            if observed.load(Ordering::SeqCst) == 1 {
                break;
            }
            spindle::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(observed.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn yield_now_round_robins_the_active_deque() {
    let rt = Builder::new().workers(1).build();
    let order = rt.block_on(async {
        let log = Arc::new(spin::Mutex::new(Vec::new()));
        let gate = Arc::new(spindle::sync::Barrier::new(3));
        let tasks: Vec<_> = (0..3u32)
            .map(|i| {
                let log = Arc::clone(&log);
                let gate = Arc::clone(&gate);
                spindle::spawn(async move {
                    // make sure all three are adopted before the first round
                    gate.wait().await;
                    for _ in 0..3 {
                        log.lock().push(i);
                        spindle::yield_now().await;
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        Arc::try_unwrap(log).unwrap().into_inner()
    });

    // a yielded task goes to the back of the active deque, so no task logs
    // twice in a row while others are runnable
    for window in order.windows(2) {
        assert_ne!(window[0], window[1], "unfair schedule: {order:?}");
    }
}

#[test]
fn named_tasks_via_the_builder() {
    let rt = runtime();
    let value = rt.block_on(async {
        TaskBuilder::new()
            .name("answer")
            .core(true)
            .spawn(async { 41 + 1 })
            .await
            .unwrap()
    });
    assert_eq!(value, 42);
}

#[test]
fn join_blocks_a_non_runtime_thread() {
    let rt = runtime();
    let handle = rt.block_on(async {
        spindle::spawn(async {
            spindle::time::sleep(Duration::from_millis(20)).await;
            13u8
        })
    });
    // the handle is awaited synchronously, off the runtime
    assert_eq!(handle.join().unwrap(), 13);
}

#[test]
fn await_chains_record_spawners() {
    let rt = runtime();
    let (child_id, parent_id, child) = rt.block_on(async {
        let parent = spindle::spawn(async {
            let child = spindle::spawn(async {
                spindle::time::sleep(Duration::from_secs(60)).await;
            });
            (child.id(), spindle::task::current_id().unwrap(), child)
        });
        parent.await.unwrap()
    });

    let chain = rt.await_chain(child_id);
    assert_eq!(chain.first(), Some(&parent_id));

    assert!(child.cancel());
    assert!(child.join().unwrap_err().is_cancelled());
}

#[test]
fn runtime_drop_joins_all_threads() {
    let rt = runtime();
    rt.block_on(async {
        for _ in 0..64 {
            spindle::spawn(async {
                spindle::yield_now().await;
            })
            .detach();
        }
    });
    drop(rt);
}
