// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Worker threads.
//!
//! A worker is a pinned OS thread running a cooperative single-threaded
//! scheduler. It owns three tables: `tasks` (everything it has adopted, by
//! id), the `active` deque (runnable, FIFO), and the `suspended` map (parked
//! at an await point). Tasks never migrate between workers; they are adopted
//! exactly once from a dispatch queue and stay until completion.
//!
//! One scheduling turn: drain the dispatch queue, pop one active task, poll
//! it, route on the outcome. A worker with nothing to do announces itself on
//! its class's idle queue and parks.

use crate::park::Parker;
use crate::queue::{self, PopError};
use crate::runtime::Shared;
use crate::task::{Id, PollOutcome, TaskRef};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Dispatch class of a worker, fixed at startup from the CPU topology.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum WorkerKind {
    /// Cores without SMT siblings; preferred for I/O-bound tasks.
    Io,
    /// Cores with SMT siblings; preferred for compute-bound tasks.
    Compute,
}

pub(crate) struct Worker {
    pub(crate) id: usize,
    pub(crate) kind: WorkerKind,
    /// This worker's handle onto its class's shared dispatch queue.
    incoming: spin::Mutex<queue::Receiver<TaskRef>>,
    tasks: spin::Mutex<HashMap<Id, TaskRef>>,
    active: spin::Mutex<VecDeque<TaskRef>>,
    suspended: spin::Mutex<HashMap<Id, TaskRef>>,
    pub(crate) parker: Parker,
}

impl Worker {
    pub(crate) fn new(id: usize, kind: WorkerKind, incoming: queue::Receiver<TaskRef>) -> Self {
        Self {
            id,
            kind,
            incoming: spin::Mutex::new(incoming),
            tasks: spin::Mutex::new(HashMap::new()),
            active: spin::Mutex::new(VecDeque::new()),
            suspended: spin::Mutex::new(HashMap::new()),
            parker: Parker::new(),
        }
    }

    /// The scheduling loop. Returns when the dispatch queue closes.
    pub(crate) fn run(&self, shared: &Arc<Shared>) {
        let _span = tracing::debug_span!("worker", worker = self.id, kind = ?self.kind).entered();
        pin_to_cpu(self.id);

        loop {
            // adopt everything the dispatcher has for us
            loop {
                let popped = self.incoming.lock().pop();
                match popped {
                    Ok(task) => self.adopt(task),
                    Err(PopError::Empty) => break,
                    Err(PopError::Closed) => {
                        tracing::debug!(worker = self.id, "dispatch queue closed, shutting down");
                        self.drain(shared);
                        return;
                    }
                }
            }

            let Some(task) = self.active.lock().pop_front() else {
                shared.announce_idle(self.kind, self.id);
                self.parker.park();
                continue;
            };

            self.run_task(shared, task);
        }
    }

    /// Takes ownership of a freshly dispatched task.
    fn adopt(&self, task: TaskRef) {
        tracing::trace!(task.tid = task.id().as_u64(), worker = self.id, "adopt");
        task.bind_worker(self.id);
        self.tasks.lock().insert(task.id(), task.clone());
        self.active.lock().push_back(task);
    }

    fn run_task(&self, shared: &Arc<Shared>, task: TaskRef) {
        let id = task.id();

        // Park the record in the suspended map *before* polling: the moment
        // `end_poll` publishes a Pending outcome, a concurrent waker may call
        // `activate_task`, and it must find the record.
        self.suspend_task(task.clone());

        match task.poll() {
            PollOutcome::Pending => {}
            PollOutcome::PendingSchedule => {
                // woke itself during the poll (e.g. `yield_now`): back of the
                // line
                if let Some(task) = self.suspended.lock().remove(&id) {
                    self.active.lock().push_back(task);
                }
            }
            PollOutcome::Ready => {
                self.suspended.lock().remove(&id);
                self.finalize(shared, &task);
            }
        }
    }

    /// Completion path: unhook the record everywhere, then wake the joiner.
    fn finalize(&self, shared: &Arc<Shared>, task: &TaskRef) {
        let id = task.id();
        tracing::trace!(task.tid = id.as_u64(), worker = self.id, "task finished");
        shared.unregister_task(id);
        shared.load_counter(self.kind).fetch_sub(1, core::sync::atomic::Ordering::AcqRel);
        self.tasks.lock().remove(&id);
        task.clear_worker();
        task.wake_join();
    }

    /// Moves a task from the suspended map to the active deque and wakes the
    /// worker. Called from wakers on arbitrary threads.
    pub(crate) fn activate_task(&self, task: TaskRef) {
        let id = task.id();
        let found = self.suspended.lock().remove(&id);
        match found {
            Some(task) => {
                self.active.lock().push_back(task);
                self.parker.unpark();
            }
            None => {
                // The state machine only routes a wake here when the task is
                // parked; not finding it means it is being shut down.
                tracing::trace!(
                    task.tid = id.as_u64(),
                    worker = self.id,
                    "activation raced shutdown"
                );
            }
        }
    }

    /// Parks a task in the suspended map; its waker is now the only way it
    /// comes back.
    pub(crate) fn suspend_task(&self, task: TaskRef) {
        self.suspended.lock().insert(task.id(), task);
    }

    /// Detaches a suspended task from this worker entirely, clearing its
    /// worker back-pointer. The record may then be re-homed with
    /// [`Worker::move_in_suspended_task`] or dropped.
    pub(crate) fn move_out_suspended_task(&self, id: Id) -> Option<TaskRef> {
        let task = self.suspended.lock().remove(&id)?;
        self.tasks.lock().remove(&id);
        task.clear_worker();
        Some(task)
    }

    /// Adopts a suspended task that was moved out of another worker.
    pub(crate) fn move_in_suspended_task(&self, task: TaskRef) {
        task.bind_worker(self.id);
        self.tasks.lock().insert(task.id(), task.clone());
        self.suspended.lock().insert(task.id(), task);
    }

    /// Shutdown path: move every remaining task out of the tables so records
    /// drop deterministically.
    fn drain(&self, shared: &Arc<Shared>) {
        let suspended: Vec<Id> = self.suspended.lock().keys().copied().collect();
        for id in suspended {
            if let Some(task) = self.move_out_suspended_task(id) {
                shared.unregister_task(id);
                drop(task);
            }
        }
        let active: Vec<TaskRef> = self.active.lock().drain(..).collect();
        for task in active {
            shared.unregister_task(task.id());
            task.clear_worker();
        }
        self.tasks.lock().clear();
    }

    #[cfg(test)]
    pub(crate) fn suspended_len(&self) -> usize {
        self.suspended.lock().len()
    }
}

impl core::fmt::Debug for Worker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tasks", &self.tasks.lock().len())
            .field("active", &self.active.lock().len())
            .field("suspended", &self.suspended.lock().len())
            .finish()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        /// Pins the calling thread to `cpu`. Best-effort: a failure (e.g.
        /// a restricted cpuset) downgrades to a warning, it does not stop
        /// the worker.
        fn pin_to_cpu(cpu: usize) {
            // Safety: cpu_set_t is plain-old-data; the set is local.
            unsafe {
                let mut set: libc::cpu_set_t = core::mem::zeroed();
                libc::CPU_ZERO(&mut set);
                libc::CPU_SET(cpu % libc::CPU_SETSIZE as usize, &mut set);
                if libc::sched_setaffinity(0, core::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                    tracing::warn!(cpu, "failed to pin worker thread");
                }
            }
        }

        /// Classifies a CPU by its SMT topology: cores that share a sibling
        /// run the high-throughput side of the chip and are used as compute
        /// workers; the rest serve I/O.
        pub(crate) fn classify_cpu(cpu: usize) -> WorkerKind {
            let path = format!("/sys/devices/system/cpu/cpu{cpu}/topology/thread_siblings_list");
            match std::fs::read_to_string(path) {
                Ok(list) => {
                    let siblings = list.trim();
                    if siblings.contains(',') || siblings.contains('-') {
                        WorkerKind::Compute
                    } else {
                        WorkerKind::Io
                    }
                }
                Err(_) => WorkerKind::Io,
            }
        }
    } else {
        fn pin_to_cpu(_cpu: usize) {}

        pub(crate) fn classify_cpu(_cpu: usize) -> WorkerKind {
            WorkerKind::Io
        }
    }
}
