// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use spindle::runtime::Builder;

spindle::task_local! {
    static COUNTER: u64;
    static LABEL: String;
}

#[test]
fn children_do_not_see_or_disturb_parent_values() {
    let rt = Builder::new().workers(4).build();
    rt.block_on(async {
        let outcome = spindle::spawn(async {
            COUNTER.set(100);

            let child = spindle::spawn(async {
                // a fresh task starts with empty storage
                assert_eq!(COUNTER.get(), None);
                COUNTER.set(200);
                COUNTER.with(|value| *value += 1);
                COUNTER.get().unwrap()
            });

            let child_value = child.await.unwrap();
            (COUNTER.get().unwrap(), child_value)
        })
        .await
        .unwrap();

        assert_eq!(outcome, (100, 201));
    });
}

#[test]
fn values_survive_suspension_points() {
    let rt = Builder::new().workers(2).build();
    rt.block_on(async {
        let value = spindle::spawn(async {
            LABEL.set("before".to_owned());
            spindle::yield_now().await;
            spindle::time::sleep(std::time::Duration::from_millis(10)).await;
            LABEL.with(|label| label.push_str("-after"));
            LABEL.get().unwrap()
        })
        .await
        .unwrap();
        assert_eq!(value, "before-after");
    });
}

#[test]
fn take_removes_the_value() {
    let rt = Builder::new().workers(1).build();
    rt.block_on(async {
        spindle::spawn(async {
            COUNTER.set(7);
            assert_eq!(COUNTER.take(), Some(7));
            assert_eq!(COUNTER.get(), None);
        })
        .await
        .unwrap();
    });
}
