// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The submission/completion contract between the runtime core and a
//! platform I/O backend.
//!
//! The core only requires two things of a backend: accept an [`Op`] and
//! return a submission [`Token`], and answer completion polls by token
//! without ever blocking the calling worker thread. Wakers registered
//! through [`Driver::poll_completion`] must fire when the result lands.

use core::fmt;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::path::PathBuf;

/// Identifies one submitted request.
pub type Token = u64;

/// Backend handle for an open file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FileId(pub(crate) u64);

/// How to open a file; mirrors the usual platform flags.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenOptions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            ..Self::default()
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            ..Self::default()
        }
    }
}

/// A submission: one request against the backend.
#[derive(Debug)]
pub enum Op {
    Open {
        path: PathBuf,
        options: OpenOptions,
    },
    Close {
        file: FileId,
    },
    /// Positioned read into a freshly allocated buffer of at most `len`
    /// bytes.
    ReadAt {
        file: FileId,
        offset: u64,
        len: usize,
    },
    /// Positioned write; may complete partially.
    WriteAt {
        file: FileId,
        offset: u64,
        data: Vec<u8>,
    },
}

/// Successful completion payloads, one per [`Op`] variant.
#[derive(Debug)]
pub enum Outcome {
    Opened { file: FileId, size: u64 },
    Closed,
    /// May be shorter than requested.
    Read { data: Vec<u8> },
    /// Hands the buffer back so the caller can retry the unwritten tail.
    Wrote { written: usize, data: Vec<u8> },
}

/// I/O failures, with the retryable conditions surfaced distinctly so that
/// adaptive buffering can retry.
#[derive(Debug, Eq, PartialEq)]
pub enum IoError {
    /// End of file: a read at or past the file's size.
    Eof,
    /// The backend would have had to block; try again.
    Again,
    /// The operation was interrupted before transferring anything.
    Interrupted,
    NotFound,
    PermissionDenied,
    /// The file handle is unknown to the backend (already closed).
    Stale,
    /// Any other OS error, by errno.
    Os(i32),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Eof => f.pad("end of file"),
            IoError::Again => f.pad("operation would block"),
            IoError::Interrupted => f.pad("operation interrupted"),
            IoError::NotFound => f.pad("file not found"),
            IoError::PermissionDenied => f.pad("permission denied"),
            IoError::Stale => f.pad("stale file handle"),
            IoError::Os(errno) => write!(f, "os error {errno}"),
        }
    }
}

impl core::error::Error for IoError {}

/// Result of one completed submission.
pub type Completion = Result<Outcome, IoError>;

/// A platform I/O backend.
pub trait Driver: Send + Sync + 'static {
    /// Accepts a request for asynchronous execution.
    fn submit(&self, op: Op) -> Token;

    /// Polls the completion for `token`.
    ///
    /// Must not block; when the completion is not ready the implementation
    /// registers `cx`'s waker and fires it once the result lands. A token
    /// is consumed by the first `Ready` it returns.
    fn poll_completion(&self, token: Token, cx: &mut Context<'_>) -> Poll<Completion>;
}

/// Future over one submitted request.
pub(crate) struct Submission<'a> {
    driver: &'a dyn Driver,
    token: Token,
}

impl<'a> Submission<'a> {
    pub(crate) fn new(driver: &'a dyn Driver, op: Op) -> Self {
        let token = driver.submit(op);
        Self { driver, token }
    }
}

impl Future for Submission<'_> {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.driver.poll_completion(self.token, cx)
    }
}

impl fmt::Debug for Submission<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}
