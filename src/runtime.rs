// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The process-wide runtime: worker threads, dispatch queues, the global
//! task registry, load accounting and the timer daemon.
//!
//! New tasks enter one of two dispatch queues (I/O or compute) chosen by a
//! coarse load ratio; because tasks run to completion on a single worker,
//! this is the only balancing the runtime does; there is no work stealing.

use crate::cancel::CancelScope;
use crate::loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use crate::park::Parker;
use crate::queue;
use crate::task::{self, Id, JoinHandle, TaskRef};
use crate::time::timer::Timer;
use crate::worker::{self, Worker, WorkerKind};
use core::cell::RefCell;
use core::pin::pin;
use core::task::Context;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;

/// Configures and constructs a [`Runtime`].
#[derive(Debug)]
pub struct Builder {
    workers: Option<usize>,
    thread_name: String,
}

impl Builder {
    pub fn new() -> Self {
        Self {
            workers: None,
            thread_name: "spindle-worker".to_owned(),
        }
    }

    /// Number of worker threads. Defaults to the hardware concurrency.
    pub fn workers(mut self, workers: usize) -> Self {
        assert!(workers > 0, "a runtime needs at least one worker");
        self.workers = Some(workers);
        self
    }

    /// Prefix for worker thread names.
    pub fn thread_name(mut self, prefix: &str) -> Self {
        self.thread_name = prefix.to_owned();
        self
    }

    pub fn build(self) -> Runtime {
        let count = self.workers.unwrap_or_else(|| {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
        });

        let (io_tx, io_rx) = queue::create::<TaskRef>();
        let (compute_tx, compute_rx) = queue::create::<TaskRef>();

        let kinds: Vec<WorkerKind> = (0..count).map(worker::classify_cpu).collect();
        let io_count = kinds.iter().filter(|k| **k == WorkerKind::Io).count();
        let compute_count = count - io_count;

        let workers: Vec<Arc<Worker>> = kinds
            .iter()
            .enumerate()
            .map(|(id, kind)| {
                let incoming = match kind {
                    WorkerKind::Io => io_rx.clone(),
                    WorkerKind::Compute => compute_rx.clone(),
                };
                Arc::new(Worker::new(id, *kind, incoming))
            })
            .collect();

        let shared = Arc::new(Shared {
            workers,
            io_tx: spin::Mutex::new(io_tx),
            compute_tx: spin::Mutex::new(compute_tx),
            io_idle: spin::Mutex::new(VecDeque::new()),
            compute_idle: spin::Mutex::new(VecDeque::new()),
            io_count,
            compute_count,
            io_load: AtomicUsize::new(0),
            compute_load: AtomicUsize::new(0),
            registry: spin::RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            timer: Timer::new(),
        });

        let mut threads = Vec::with_capacity(count + 1);
        for id in 0..count {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{id}", self.thread_name))
                .spawn(move || {
                    let _enter = enter(Arc::clone(&shared));
                    let worker = Arc::clone(&shared.workers[id]);
                    worker.run(&shared);
                })
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("spindle-timer".to_owned())
                .spawn(move || shared.timer.run())
                .expect("failed to spawn timer thread");
            threads.push(handle);
        }

        tracing::debug!(
            workers = count,
            io = io_count,
            compute = compute_count,
            "runtime started"
        );

        Runtime { shared, threads }
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle that owns the worker pool and the timer daemon.
///
/// Dropping the runtime closes the dispatch queues, drains every worker and
/// joins all threads.
#[derive(Debug)]
pub struct Runtime {
    shared: Arc<Shared>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl Runtime {
    /// A runtime with default configuration.
    pub fn new() -> Self {
        Builder::new().build()
    }

    /// Spawns an I/O-preferring task onto this runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_inner(Arc::clone(&self.shared), future, false, None)
    }

    /// Spawns a compute-preferring task onto this runtime.
    pub fn spawn_core<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        spawn_inner(Arc::clone(&self.shared), future, true, None)
    }

    /// Drives `future` on the calling thread until it completes.
    ///
    /// The calling thread is not a worker: it parks on a binary semaphore
    /// between polls while spawned tasks make progress on the pool. Inside
    /// the closure the runtime is current, so [`crate::spawn`] and the timer
    /// work.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _enter = enter(Arc::clone(&self.shared));
        let parker = Parker::new();
        let waker = parker.waker();
        let mut cx = Context::from_waker(&waker);
        let mut future = pin!(future);
        loop {
            match future.as_mut().poll(&mut cx) {
                core::task::Poll::Ready(value) => return value,
                core::task::Poll::Pending => parker.park(),
            }
        }
    }

    /// Number of live (registered, not yet completed) tasks.
    pub fn task_count(&self) -> usize {
        self.shared.registry.read().len()
    }

    /// The chain of spawner ids above `id`, nearest spawner first.
    ///
    /// Purely diagnostic: ids of already-completed spawners terminate the
    /// walk but still appear in the chain.
    pub fn await_chain(&self, id: Id) -> Vec<Id> {
        self.shared.await_chain(id)
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        tracing::debug!("runtime shutting down");
        self.shared.io_tx.lock().stop();
        self.shared.compute_tx.lock().stop();
        self.shared.timer.stop();
        self.shared.awake_all();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.shared.registry.write().clear();
    }
}

pub(crate) struct Shared {
    pub(crate) workers: Vec<Arc<Worker>>,
    io_tx: spin::Mutex<queue::Sender<TaskRef>>,
    compute_tx: spin::Mutex<queue::Sender<TaskRef>>,
    io_idle: spin::Mutex<VecDeque<usize>>,
    compute_idle: spin::Mutex<VecDeque<usize>>,
    io_count: usize,
    compute_count: usize,
    io_load: AtomicUsize,
    compute_load: AtomicUsize,
    registry: spin::RwLock<HashMap<Id, TaskRef>>,
    next_id: AtomicU64,
    pub(crate) timer: Timer,
}

impl Shared {
    pub(crate) fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    pub(crate) fn alloc_task_id(&self) -> Id {
        Id::from_u64(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn register_task(&self, task: TaskRef) {
        self.registry.write().insert(task.id(), task);
    }

    pub(crate) fn unregister_task(&self, id: Id) {
        self.registry.write().remove(&id);
    }

    /// The chain of spawner ids above `id`, nearest first. Diagnostic only.
    pub(crate) fn await_chain(&self, id: Id) -> Vec<Id> {
        let registry = self.registry.read();
        let mut chain = Vec::new();
        let mut current = registry.get(&id).and_then(|task| task.header().parent);
        while let Some(parent) = current {
            chain.push(parent);
            current = registry.get(&parent).and_then(|task| task.header().parent);
        }
        chain
    }

    pub(crate) fn load_counter(&self, kind: WorkerKind) -> &AtomicUsize {
        match kind {
            WorkerKind::Io => &self.io_load,
            WorkerKind::Compute => &self.compute_load,
        }
    }

    /// Dispatches a registered task onto the lighter queue; the `core` flag
    /// inverts the tie-break.
    pub(crate) fn dispatch(&self, task: TaskRef) {
        let io_load = self.io_load.load(Ordering::Acquire);
        let compute_load = self.compute_load.load(Ordering::Acquire);

        let to_compute = if self.compute_count == 0 {
            false
        } else if self.io_count == 0 {
            true
        } else if task.header().core {
            // compute-preferring: only yield to I/O when the I/O side is no
            // more loaded per worker
            self.compute_count * io_load > self.io_count * compute_load
        } else {
            // I/O-preferring: yield to compute when that side is no more
            // loaded per worker
            self.io_count * compute_load <= self.compute_count * io_load
        };

        if to_compute {
            self.compute_load.fetch_add(1, Ordering::AcqRel);
            if self.compute_tx.lock().push(task).is_err() {
                panic!("runtime compute dispatch queue unexpectedly closed");
            }
            self.awake_compute_worker_once();
        } else {
            self.io_load.fetch_add(1, Ordering::AcqRel);
            if self.io_tx.lock().push(task).is_err() {
                panic!("runtime io dispatch queue unexpectedly closed");
            }
            self.awake_io_worker_once();
        }
    }

    pub(crate) fn announce_idle(&self, kind: WorkerKind, id: usize) {
        match kind {
            WorkerKind::Io => self.io_idle.lock().push_back(id),
            WorkerKind::Compute => self.compute_idle.lock().push_back(id),
        }
    }

    pub(crate) fn awake_io_worker_once(&self) {
        let id = self.io_idle.lock().pop_front();
        match id {
            Some(id) => self.workers[id].parker.unpark(),
            None => self.awake_all(),
        }
    }

    pub(crate) fn awake_compute_worker_once(&self) {
        let id = self.compute_idle.lock().pop_front();
        match id {
            Some(id) => self.workers[id].parker.unpark(),
            None => self.awake_all(),
        }
    }

    pub(crate) fn awake_all(&self) {
        for worker in &self.workers {
            worker.parker.unpark();
        }
    }
}

impl core::fmt::Debug for Shared {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Shared")
            .field("io_count", &self.io_count)
            .field("compute_count", &self.compute_count)
            .field("io_load", &self.io_load)
            .field("compute_load", &self.compute_load)
            .field("tasks", &self.registry.read().len())
            .finish_non_exhaustive()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// The runtime the current thread is operating in, if any.
pub(crate) fn current_shared() -> Option<Arc<Shared>> {
    CURRENT.with(|current| current.borrow().clone())
}

pub(crate) struct EnterGuard {
    prev: Option<Arc<Shared>>,
}

pub(crate) fn enter(shared: Arc<Shared>) -> EnterGuard {
    let prev = CURRENT.with(|current| current.borrow_mut().replace(shared));
    EnterGuard { prev }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT.with(|current| *current.borrow_mut() = prev);
    }
}

/// Erases `future`, registers the record and dispatches it.
pub(crate) fn spawn_inner<F>(
    shared: Arc<Shared>,
    future: F,
    core: bool,
    name: Option<&str>,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    spawn_with_scope(shared, future, core, name, None)
}

/// Spawns a task whose cancellation scope is a child of `parent` instead of
/// the spawning task's own scope. Used by `select` to tie every branch to
/// one shared scope.
pub(crate) fn spawn_scoped<F>(future: F, parent: CancelScope) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let shared = current_shared().expect("spawn_scoped called outside of a runtime context");
    spawn_with_scope(shared, future, false, None, Some(parent))
}

fn spawn_with_scope<F>(
    shared: Arc<Shared>,
    future: F,
    core: bool,
    name: Option<&str>,
    scope_parent: Option<CancelScope>,
) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let id = shared.alloc_task_id();

    let (parent, parent_scope) = task::with_current(|current| match current {
        Some(task) => (Some(task.id()), Some(task.header().cancel.clone())),
        None => (None, None),
    });
    let cancel = match scope_parent.as_ref().or(parent_scope.as_ref()) {
        Some(parent) => parent.child(),
        None => CancelScope::new(),
    };

    let span = tracing::trace_span!(
        "task",
        task.tid = id.as_u64(),
        task.name = name.unwrap_or(""),
        task.core = core,
    );

    let output = Arc::new(spin::Mutex::new(None));
    let slot = Arc::clone(&output);
    let wrapped = Box::pin(async move {
        let value = future.await;
        *slot.lock() = Some(value);
    });

    let raw = task::new_raw(id, Arc::clone(&shared), core, parent, cancel, span, wrapped);
    let task = TaskRef::new(raw);
    shared.register_task(task.clone());
    let handle = JoinHandle::new(task.clone(), output);
    shared.dispatch(task);
    handle
}

/// Spawns an I/O-preferring task onto the current runtime.
///
/// # Panics
///
/// Panics when called outside of a runtime context (a worker thread or a
/// [`Runtime::block_on`] closure).
#[track_caller]
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let shared = current_shared().expect("spindle::spawn called outside of a runtime context");
    spawn_inner(shared, future, false, None)
}

/// Spawns a compute-preferring task onto the current runtime.
///
/// # Panics
///
/// Panics when called outside of a runtime context.
#[track_caller]
pub fn spawn_core<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let shared = current_shared().expect("spindle::spawn_core called outside of a runtime context");
    spawn_inner(shared, future, true, None)
}
