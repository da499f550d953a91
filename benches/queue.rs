// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use criterion::{Criterion, criterion_group, criterion_main};
use spindle::queue;
use std::hint::black_box;
use std::thread;

fn spsc_throughput(c: &mut Criterion) {
    c.bench_function("queue/spsc_push_pop_10k", |b| {
        b.iter(|| {
            let (mut tx, mut rx) = queue::create::<u64>();
            for i in 0..10_000u64 {
                tx.push(black_box(i)).unwrap();
            }
            for _ in 0..10_000u64 {
                black_box(rx.pop().unwrap());
            }
        });
    });
}

fn mpmc_contended(c: &mut Criterion) {
    c.bench_function("queue/mpmc_4x4_contended", |b| {
        b.iter(|| {
            const PER_SENDER: u64 = 2_500;
            let (tx, rx) = queue::create::<u64>();
            let mut closer = tx.clone();

            let producers: Vec<_> = (0..4)
                .map(|_| {
                    let mut tx = tx.clone();
                    thread::spawn(move || {
                        for i in 0..PER_SENDER {
                            tx.push(i).unwrap();
                        }
                    })
                })
                .collect();

            let consumers: Vec<_> = (0..4)
                .map(|_| {
                    let mut rx = rx.clone();
                    thread::spawn(move || {
                        let mut popped = 0u64;
                        loop {
                            match rx.pop() {
                                Ok(v) => {
                                    black_box(v);
                                    popped += 1;
                                }
                                Err(queue::PopError::Empty) => thread::yield_now(),
                                Err(queue::PopError::Closed) => return popped,
                            }
                        }
                    })
                })
                .collect();

            for p in producers {
                p.join().unwrap();
            }
            drop(tx);
            drop(rx);
            closer.stop();

            let total: u64 = consumers.into_iter().map(|c| c.join().unwrap()).sum();
            assert_eq!(total, 4 * PER_SENDER);
        });
    });
}

criterion_group!(benches, spsc_throughput, mpmc_contended);
criterion_main!(benches);
