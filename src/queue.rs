// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lock-free MPMC FIFO built from a linked chain of fixed-capacity frames.
//!
//! This queue is the primary intra-runtime transport: the runtime's dispatch
//! queues and the user-facing [channel](crate::channel) are both built on it.
//! It is optimised for low-contention producers and consumers that spend most
//! of their time inside a single frame; crossing a frame boundary is the slow
//! path.
//!
//! Each frame carries three cursors:
//!
//! - `tail` is the producer cursor. A producer reserves a slot by
//!   compare-exchanging `tail` forward; the producer that moves `tail` past
//!   the last slot parks it at a sentinel and becomes responsible for
//!   publishing the next frame.
//! - `released` is the publication watermark. Slot contents are readable iff
//!   the slot index is strictly less than `released`. Producers release
//!   *in reservation order*: a producer busy-waits until `released` reaches
//!   its own index before bumping it. This serialises release without
//!   serialising reservation, and is cheap because every worker thread is
//!   pinned to its own core.
//! - `head` is the consumer cursor, compare-exchanged forward by consumers.
//!   A freshly published frame starts with `head` at the sentinel, meaning
//!   "no receiver has entered this frame yet".
//!
//! Stop flags use sequentially consistent ordering so that both ends agree on
//! closure; cursor updates use acquire/release.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use crate::util::{Backoff, CachePadded};
use core::fmt;
use core::hint;
use core::mem::MaybeUninit;
use std::sync::{Arc, OnceLock};

/// Sentinel cursor value.
///
/// For `tail` it means "producers have advanced to the next frame"; for
/// `head` it means "no receiver has entered this frame yet".
const SENTINEL: usize = usize::MAX;

/// Byte budget for one frame's slot array; a frame is roughly one page.
const FRAME_BYTES: usize = 4096;

static_assertions::const_assert!(FRAME_BYTES.is_power_of_two());
static_assertions::const_assert!(frame_len::<u64>() * size_of::<u64>() <= FRAME_BYTES);
static_assertions::const_assert!(frame_len::<[u8; 512]>() >= 16);

/// Reasons a [`Receiver::pop`] can come back empty-handed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PopError {
    /// The queue holds no object right now, but producers may still push.
    Empty,
    /// The queue is closed and fully drained.
    Closed,
}

impl fmt::Display for PopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PopError::Empty => f.pad("no object"),
            PopError::Closed => f.pad("closed"),
        }
    }
}

impl core::error::Error for PopError {}

struct Frame<T> {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicUsize>,
    released: CachePadded<AtomicUsize>,
    /// Published at most once; later frames are only reachable through this.
    next: OnceLock<Arc<Frame<T>>>,
    sender_stopped: AtomicBool,
    receiver_stopped: AtomicBool,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

// Safety: slots are handed between threads through the cursor protocol; a
// slot is written by exactly one producer before `released` covers it and
// read by exactly one consumer after.
unsafe impl<T: Send> Send for Frame<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Frame<T> {}

/// Number of slots per frame, derived from the element size so that small
/// elements pack cache lines densely while large elements stride whole lines.
const fn frame_len<T>() -> usize {
    let size = if size_of::<T>() == 0 { 1 } else { size_of::<T>() };
    let len = FRAME_BYTES / size;
    if len < 16 {
        16
    } else if len > 1024 {
        1024
    } else {
        len
    }
}

impl<T> Frame<T> {
    const LEN: usize = frame_len::<T>();

    /// A fresh frame with `head` parked at the sentinel.
    fn new() -> Self {
        let mut slots = Vec::with_capacity(Self::LEN);
        slots.resize_with(Self::LEN, || UnsafeCell::new(MaybeUninit::uninit()));

        Self {
            head: CachePadded(AtomicUsize::new(SENTINEL)),
            tail: CachePadded(AtomicUsize::new(0)),
            released: CachePadded(AtomicUsize::new(0)),
            next: OnceLock::new(),
            sender_stopped: AtomicBool::new(false),
            receiver_stopped: AtomicBool::new(false),
            slots: slots.into_boxed_slice(),
        }
    }

    fn stopped(&self) -> bool {
        self.sender_stopped.load(Ordering::SeqCst) || self.receiver_stopped.load(Ordering::SeqCst)
    }

    /// Returns the successor frame, publishing a new one if none exists yet.
    ///
    /// Stop flags are inherited by the successor so that a concurrent `stop`
    /// walk cannot race past a frame that is being born.
    fn next_frame(&self) -> Arc<Frame<T>> {
        Arc::clone(self.next.get_or_init(|| {
            let frame = Frame::new();
            frame
                .sender_stopped
                .store(self.sender_stopped.load(Ordering::SeqCst), Ordering::SeqCst);
            frame.receiver_stopped.store(
                self.receiver_stopped.load(Ordering::SeqCst),
                Ordering::SeqCst,
            );
            Arc::new(frame)
        }))
    }

    /// # Safety
    ///
    /// `index` must be a slot this thread reserved via the `tail` protocol
    /// and must not have been written before.
    unsafe fn write_slot(&self, index: usize, value: T) {
        self.slots[index].with_mut(|slot| {
            // Safety: reservation grants exclusive access to the slot.
            unsafe { (*slot).write(value) };
        });
    }

    /// # Safety
    ///
    /// `index` must be a slot this thread claimed via the `head` protocol,
    /// with `index < released`.
    unsafe fn take_slot(&self, index: usize) -> T {
        self.slots[index].with(|slot| {
            // Safety: the head claim grants exclusive access, and `released`
            // guarantees the slot was initialised.
            unsafe { (*slot).assume_init_read() }
        })
    }
}

impl<T> Drop for Frame<T> {
    fn drop(&mut self) {
        // Elements between the consumer cursor and the release watermark were
        // published but never popped; they are dropped here. All handles are
        // gone by now, so plain loads suffice.
        let released = self.released.load(Ordering::Acquire).min(Self::LEN);
        let head = self.head.load(Ordering::Acquire);
        let start = if head == SENTINEL { 0 } else { head.min(released) };
        for index in start..released {
            self.slots[index].with_mut(|slot| {
                // Safety: `start..released` is exactly the initialised,
                // unconsumed range.
                unsafe { (*slot).assume_init_drop() };
            });
        }

        // Unlink successors iteratively so a long unconsumed chain does not
        // recurse through nested `Arc` drops.
        let mut next = self.next.take();
        while let Some(frame) = next {
            match Arc::try_unwrap(frame) {
                Ok(mut frame) => next = frame.next.take(),
                Err(_) => break,
            }
        }
    }
}

/// The producer half of a continuous queue.
///
/// Cloning a sender yields an independent handle onto the same queue; all
/// clones feed the same consumer-visible order.
pub struct Sender<T> {
    frame: Arc<Frame<T>>,
}

/// The consumer half of a continuous queue.
///
/// Cloning a receiver yields an independent handle; clones race for elements
/// via the shared `head` cursor.
pub struct Receiver<T> {
    frame: Arc<Frame<T>>,
}

/// Creates a connected sender/receiver pair over a fresh frame chain.
pub fn create<T>() -> (Sender<T>, Receiver<T>) {
    let frame = Arc::new(Frame::new());
    // The first frame is born entered.
    frame.head.store(0, Ordering::Release);
    (
        Sender {
            frame: Arc::clone(&frame),
        },
        Receiver { frame },
    )
}

impl<T> Sender<T> {
    /// Pushes `value`, returning it unconsumed if the queue is closed.
    ///
    /// Never blocks on the consumer. The release step busy-waits on earlier
    /// producers within the same frame; this relies on workers being pinned
    /// to distinct cores and is bounded by the cost of a single push.
    pub fn push(&mut self, value: T) -> Result<(), T> {
        loop {
            if self.frame.stopped() {
                return Err(value);
            }

            let frame = &self.frame;
            let mut index = SENTINEL;
            let mut tail = frame.tail.load(Ordering::Acquire);
            while tail != SENTINEL {
                let bumped = if tail + 1 <= Frame::<T>::LEN {
                    tail + 1
                } else {
                    SENTINEL
                };
                match frame
                    .tail
                    .compare_exchange_weak(tail, bumped, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        index = tail;
                        break;
                    }
                    Err(current) => tail = current,
                }
            }

            if index < Frame::<T>::LEN {
                // Safety: the tail CAS reserved this slot for us.
                unsafe { frame.write_slot(index, value) };

                // Serial release: wait for every earlier reservation in this
                // frame to publish, then publish ours.
                let mut spins = 0usize;
                while frame.released.load(Ordering::Acquire) != index {
                    spins += 1;
                    if spins > 10_000 {
                        hint::spin_loop();
                    }
                }
                frame.released.store(index + 1, Ordering::Release);
                return Ok(());
            }

            // Frame exhausted: either we flipped `tail` to the sentinel (and
            // own the advance) or someone else already did. Either way, help
            // publish the next frame and move on.
            let next = frame.next_frame();
            self.frame = next;
        }
    }

    /// Closes the queue from the producer side.
    ///
    /// Walks forward from the current frame so that every frame a consumer
    /// can still reach observes the flag. Elements already released remain
    /// poppable; see [`Receiver::pop`].
    pub fn stop(&mut self) {
        let mut frame = Arc::clone(&self.frame);
        loop {
            frame.sender_stopped.store(true, Ordering::SeqCst);
            let Some(next) = frame.next.get() else { break };
            let next = Arc::clone(next);
            frame = next;
        }
    }

    /// Whether either side has stopped the queue.
    pub fn is_stopped(&self) -> bool {
        self.frame.stopped()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("queue::Sender")
            .field("stopped", &self.frame.stopped())
            .finish_non_exhaustive()
    }
}

impl<T> Receiver<T> {
    /// Pops the oldest released element.
    ///
    /// Distinguishes a queue that is merely empty right now
    /// ([`PopError::Empty`]) from one that is closed and fully drained
    /// ([`PopError::Closed`]). Never blocks.
    pub fn pop(&mut self) -> Result<T, PopError> {
        let mut backoff = Backoff::new();
        loop {
            let frame = &self.frame;
            let head = frame.head.load(Ordering::Acquire);

            if head == SENTINEL {
                // First entry into this frame; only one handle wins the CAS
                // but every loser observes a numeric head afterwards.
                let _ = frame
                    .head
                    .compare_exchange(SENTINEL, 0, Ordering::AcqRel, Ordering::Acquire);
                continue;
            }

            if head < Frame::<T>::LEN {
                if head >= frame.released.load(Ordering::Acquire) {
                    return Err(self.empty_or_closed(head));
                }
                if frame
                    .head
                    .compare_exchange_weak(head, head + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    // Safety: the head CAS claimed this slot, and the
                    // `released` check above proved it was published.
                    return Ok(unsafe { frame.take_slot(head) });
                }
                continue;
            }

            // head == LEN: this frame is fully consumed.
            if let Some(next) = frame.next.get() {
                let next = Arc::clone(next);
                let _ = next
                    .head
                    .compare_exchange(SENTINEL, 0, Ordering::AcqRel, Ordering::Acquire);
                self.frame = next;
                continue;
            }

            let tail = frame.tail.load(Ordering::Acquire);
            if tail == SENTINEL {
                // Producers already advanced; the next frame is about to be
                // published. Spin briefly rather than reporting empty.
                backoff.spin();
                continue;
            }

            return Err(self.empty_or_closed(Frame::<T>::LEN));
        }
    }

    /// Decides between `Empty` and `Closed` for a drained position.
    fn empty_or_closed(&self, head: usize) -> PopError {
        if !self.frame.stopped() {
            return PopError::Empty;
        }
        let tail = self.frame.tail.load(Ordering::Acquire);
        // A reservation past `head` means a producer is still mid-release;
        // report empty so the caller retries rather than missing an element.
        if tail != SENTINEL && tail <= head {
            PopError::Closed
        } else {
            PopError::Empty
        }
    }

    /// Closes the queue from the consumer side. Producers observe the flag on
    /// their next push and get their value handed back.
    pub fn stop(&mut self) {
        let mut frame = Arc::clone(&self.frame);
        loop {
            frame.receiver_stopped.store(true, Ordering::SeqCst);
            let Some(next) = frame.next.get() else { break };
            let next = Arc::clone(next);
            frame = next;
        }
    }

    /// Whether the queue is stopped *and* drained from this handle's view.
    pub fn is_stopped(&self) -> bool {
        let head = self.frame.head.load(Ordering::Acquire);
        let drained = head == SENTINEL || head >= self.frame.released.load(Ordering::Acquire);
        drained && self.frame.stopped() && self.frame.next.get().is_none()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Self {
            frame: Arc::clone(&self.frame),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("queue::Receiver")
            .field("stopped", &self.frame.stopped())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::thread;

    #[test]
    fn spsc_in_order_across_frames() {
        let (mut tx, mut rx) = create::<usize>();
        // enough to cross several frame boundaries
        let count = Frame::<usize>::LEN * 5 + 17;
        for i in 0..count {
            tx.push(i).unwrap();
        }
        for i in 0..count {
            assert_eq!(rx.pop().unwrap(), i);
        }
        assert_eq!(rx.pop().unwrap_err(), PopError::Empty);
    }

    #[test]
    fn stop_then_drain_then_closed() {
        let (mut tx, mut rx) = create::<u32>();
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        tx.stop();
        assert_eq!(tx.push(3).unwrap_err(), 3);
        assert_eq!(rx.pop().unwrap(), 1);
        assert_eq!(rx.pop().unwrap(), 2);
        assert_eq!(rx.pop().unwrap_err(), PopError::Closed);
    }

    #[test]
    fn receiver_stop_rejects_pushes() {
        let (mut tx, mut rx) = create::<u32>();
        rx.stop();
        assert_eq!(tx.push(7).unwrap_err(), 7);
    }

    #[test]
    fn unconsumed_elements_are_dropped() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        #[derive(Debug)]
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let (mut tx, mut rx) = create::<Counted>();
        for _ in 0..10 {
            tx.push(Counted).unwrap();
        }
        drop(rx.pop().unwrap());
        drop(rx.pop().unwrap());
        drop(tx);
        drop(rx);
        assert_eq!(DROPS.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn mpmc_multiset_and_per_sender_fifo() {
        const SENDERS: usize = 4;
        const RECEIVERS: usize = 2;
        const PER_SENDER: usize = 5_000;

        let (tx, rx) = create::<(usize, usize)>();
        let mut closer = tx.clone();

        let producers: Vec<_> = (0..SENDERS)
            .map(|s| {
                let mut tx = tx.clone();
                thread::spawn(move || {
                    for seq in 0..PER_SENDER {
                        tx.push((s, seq)).unwrap();
                    }
                })
            })
            .collect();
        drop(tx);

        let consumers: Vec<_> = (0..RECEIVERS)
            .map(|_| {
                let mut rx = rx.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    let mut last_seen: BTreeMap<usize, usize> = BTreeMap::new();
                    loop {
                        match rx.pop() {
                            Ok((s, seq)) => {
                                // per-sender FIFO as observed by one consumer
                                if let Some(&prev) = last_seen.get(&s) {
                                    assert!(seq > prev, "sender {s} reordered: {prev} then {seq}");
                                }
                                last_seen.insert(s, seq);
                                got.push((s, seq));
                            }
                            Err(PopError::Empty) => thread::yield_now(),
                            Err(PopError::Closed) => break,
                        }
                    }
                    got
                })
            })
            .collect();

        for p in producers {
            p.join().unwrap();
        }
        // close after all producers finished so consumers drain everything
        drop(rx);
        closer.stop();

        let mut all: Vec<(usize, usize)> = consumers
            .into_iter()
            .flat_map(|c| c.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<(usize, usize)> = (0..SENDERS)
            .flat_map(|s| (0..PER_SENDER).map(move |seq| (s, seq)))
            .collect();
        assert_eq!(all, expected);
    }

    proptest::proptest! {
        /// Single-threaded traces agree with a plain FIFO model.
        #[test]
        fn matches_a_fifo_model(ops in proptest::collection::vec(
            proptest::option::of(0u16..), 0..2_000,
        )) {
            let (mut tx, mut rx) = create::<u16>();
            let mut model = std::collections::VecDeque::new();
            for op in ops {
                match op {
                    Some(value) => {
                        tx.push(value).unwrap();
                        model.push_back(value);
                    }
                    None => match (rx.pop(), model.pop_front()) {
                        (Ok(got), Some(want)) => proptest::prop_assert_eq!(got, want),
                        (Err(PopError::Empty), None) => {}
                        (got, want) => {
                            return Err(proptest::test_runner::TestCaseError::fail(
                                format!("queue/model mismatch: {got:?} vs {want:?}"),
                            ));
                        }
                    },
                }
            }
        }
    }

    #[test]
    fn zero_sized_elements() {
        let (mut tx, mut rx) = create::<()>();
        for _ in 0..100 {
            tx.push(()).unwrap();
        }
        for _ in 0..100 {
            rx.pop().unwrap();
        }
        assert_eq!(rx.pop().unwrap_err(), PopError::Empty);
    }
}
