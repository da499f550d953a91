// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The bundled I/O backend: a small pool of blocking threads fed through a
//! continuous queue.
//!
//! Submissions are pushed onto the queue and executed with ordinary
//! synchronous file I/O on the pool; completions land in a token-indexed
//! table that wakes the registered waker. Worker threads of the runtime
//! never block; only these dedicated I/O threads do.

use crate::io::driver::{Completion, Driver, FileId, Op, OpenOptions, Outcome, IoError, Token};
use crate::loom::sync::atomic::{AtomicU64, Ordering};
use crate::park::Parker;
use crate::queue::{self, PopError};
use core::task::{Context, Poll, Waker};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::thread;

enum Slot {
    Waiting(Option<Waker>),
    Done(Completion),
}

struct Pool {
    completions: spin::Mutex<HashMap<Token, Slot>>,
    files: spin::Mutex<HashMap<FileId, Arc<Mutex<fs::File>>>>,
    idle: spin::Mutex<VecDeque<usize>>,
    parkers: Vec<Parker>,
    next_token: AtomicU64,
    next_file: AtomicU64,
}

/// A [`Driver`] backed by blocking threads.
pub struct BlockingDriver {
    pool: Arc<Pool>,
    ops: spin::Mutex<queue::Sender<(Token, Op)>>,
    threads: Vec<thread::JoinHandle<()>>,
}

impl BlockingDriver {
    /// A driver with `threads` blocking executor threads.
    pub fn new(threads: usize) -> Arc<Self> {
        let threads = threads.max(1);
        let (ops_tx, ops_rx) = queue::create::<(Token, Op)>();

        let pool = Arc::new(Pool {
            completions: spin::Mutex::new(HashMap::new()),
            files: spin::Mutex::new(HashMap::new()),
            idle: spin::Mutex::new(VecDeque::new()),
            parkers: (0..threads).map(|_| Parker::new()).collect(),
            next_token: AtomicU64::new(1),
            next_file: AtomicU64::new(1),
        });

        let handles = (0..threads)
            .map(|id| {
                let pool = Arc::clone(&pool);
                let mut ops = ops_rx.clone();
                thread::Builder::new()
                    .name(format!("spindle-io-{id}"))
                    .spawn(move || {
                        loop {
                            match ops.pop() {
                                Ok((token, op)) => {
                                    let completion = pool.execute(op);
                                    pool.complete(token, completion);
                                }
                                Err(PopError::Empty) => {
                                    pool.idle.lock().push_back(id);
                                    pool.parkers[id].park();
                                }
                                Err(PopError::Closed) => return,
                            }
                        }
                    })
                    .expect("failed to spawn io thread")
            })
            .collect();

        Arc::new(Self {
            pool,
            ops: spin::Mutex::new(ops_tx),
            threads: handles,
        })
    }
}

impl Driver for BlockingDriver {
    fn submit(&self, op: Op) -> Token {
        let token = self.pool.next_token.fetch_add(1, Ordering::Relaxed);
        self.pool
            .completions
            .lock()
            .insert(token, Slot::Waiting(None));
        if self.ops.lock().push((token, op)).is_err() {
            self.pool.complete(token, Err(IoError::Stale));
            return token;
        }
        let idle = self.pool.idle.lock().pop_front();
        match idle {
            Some(id) => self.pool.parkers[id].unpark(),
            None => {
                for parker in &self.pool.parkers {
                    parker.unpark();
                }
            }
        }
        token
    }

    fn poll_completion(&self, token: Token, cx: &mut Context<'_>) -> Poll<Completion> {
        let mut completions = self.pool.completions.lock();
        match completions.get_mut(&token) {
            Some(Slot::Waiting(waker)) => {
                match waker {
                    Some(existing) if existing.will_wake(cx.waker()) => {}
                    slot => *slot = Some(cx.waker().clone()),
                }
                Poll::Pending
            }
            Some(Slot::Done(_)) => {
                let Some(Slot::Done(completion)) = completions.remove(&token) else {
                    unreachable!()
                };
                Poll::Ready(completion)
            }
            None => Poll::Ready(Err(IoError::Stale)),
        }
    }
}

impl Drop for BlockingDriver {
    fn drop(&mut self) {
        self.ops.lock().stop();
        for parker in &self.pool.parkers {
            parker.unpark();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl core::fmt::Debug for BlockingDriver {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BlockingDriver")
            .field("threads", &self.threads.len())
            .field("open_files", &self.pool.files.lock().len())
            .finish()
    }
}

impl Pool {
    fn complete(&self, token: Token, completion: Completion) {
        let waker = {
            let mut completions = self.completions.lock();
            match completions.insert(token, Slot::Done(completion)) {
                Some(Slot::Waiting(waker)) => waker,
                // submission table entry vanished: the future was dropped
                _ => None,
            }
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn execute(&self, op: Op) -> Completion {
        match op {
            Op::Open { path, options } => self.open(&path, options),
            Op::Close { file } => match self.files.lock().remove(&file) {
                Some(_) => Ok(Outcome::Closed),
                None => Err(IoError::Stale),
            },
            Op::ReadAt { file, offset, len } => self.read_at(file, offset, len),
            Op::WriteAt { file, offset, data } => self.write_at(file, offset, data),
        }
    }

    fn open(&self, path: &std::path::Path, options: OpenOptions) -> Completion {
        let file = fs::OpenOptions::new()
            .read(options.read)
            .write(options.write)
            .create(options.create)
            .truncate(options.truncate)
            .open(path)
            .map_err(translate)?;
        let size = file.metadata().map_err(translate)?.len();
        let id = FileId(self.next_file.fetch_add(1, Ordering::Relaxed));
        self.files.lock().insert(id, Arc::new(Mutex::new(file)));
        Ok(Outcome::Opened { file: id, size })
    }

    fn checkout(&self, id: FileId) -> Result<Arc<Mutex<fs::File>>, IoError> {
        self.files.lock().get(&id).cloned().ok_or(IoError::Stale)
    }

    fn read_at(&self, id: FileId, offset: u64, len: usize) -> Completion {
        let file = self.checkout(id)?;
        let mut file = file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).map_err(translate)?;
        let mut data = vec![0u8; len];
        let read = file.read(&mut data).map_err(translate)?;
        if read == 0 && len > 0 {
            return Err(IoError::Eof);
        }
        data.truncate(read);
        Ok(Outcome::Read { data })
    }

    fn write_at(&self, id: FileId, offset: u64, data: Vec<u8>) -> Completion {
        let file = self.checkout(id)?;
        let mut file = file.lock().unwrap();
        file.seek(SeekFrom::Start(offset)).map_err(translate)?;
        let written = file.write(&data).map_err(translate)?;
        Ok(Outcome::Wrote { written, data })
    }
}

fn translate(error: std::io::Error) -> IoError {
    use std::io::ErrorKind;
    match error.kind() {
        ErrorKind::WouldBlock => IoError::Again,
        ErrorKind::Interrupted => IoError::Interrupted,
        ErrorKind::NotFound => IoError::NotFound,
        ErrorKind::PermissionDenied => IoError::PermissionDenied,
        ErrorKind::UnexpectedEof => IoError::Eof,
        _ => IoError::Os(error.raw_os_error().unwrap_or(-1)),
    }
}
