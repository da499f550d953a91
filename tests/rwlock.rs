// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::runtime::Builder;
use spindle::sync::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

const READERS: usize = 16;
const WRITERS: usize = 8;
const WRITES_PER_WRITER: usize = 120;
const READS_PER_READER: usize = 200;

#[test]
fn readers_and_writers_agree() {
    let rt = Builder::new().workers(4).build();
    rt.block_on(async {
        let lock = Arc::new(RwLock::new(0usize));
        let writer_inside = Arc::new(AtomicBool::new(false));
        let violations = Arc::new(AtomicUsize::new(0));

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let writer_inside = Arc::clone(&writer_inside);
                let violations = Arc::clone(&violations);
                spindle::spawn(async move {
                    for _ in 0..WRITES_PER_WRITER {
                        let mut guard = lock.write().await;
                        if writer_inside.swap(true, Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        *guard += 1;
                        spindle::yield_now().await;
                        writer_inside.store(false, Ordering::SeqCst);
                        drop(guard);
                    }
                })
            })
            .collect();

        let readers: Vec<_> = (0..READERS)
            .map(|_| {
                let lock = Arc::clone(&lock);
                let writer_inside = Arc::clone(&writer_inside);
                let violations = Arc::clone(&violations);
                spindle::spawn(async move {
                    let mut last_seen = 0usize;
                    for _ in 0..READS_PER_READER {
                        let guard = lock.read().await;
                        if writer_inside.load(Ordering::SeqCst) {
                            violations.fetch_add(1, Ordering::SeqCst);
                        }
                        let value = *guard;
                        assert!(
                            value >= last_seen,
                            "counter went backwards: {last_seen} then {value}"
                        );
                        last_seen = value;
                        drop(guard);
                        spindle::yield_now().await;
                    }
                })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(violations.load(Ordering::SeqCst), 0);
        assert_eq!(*lock.read().await, WRITERS * WRITES_PER_WRITER);
    });
}
