// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::io::driver::{Driver, FileId, IoError, Op, OpenOptions, Outcome, Submission};
use core::fmt;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

/// An asynchronous file over a [`Driver`].
///
/// The file keeps independent read and write cursors (`seek_read` and
/// `seek_write` move them separately) and tracks the file size for
/// bound-checked seeks. Reads may return fewer bytes than asked for; writes
/// may complete partially and hand back the unwritten remainder.
pub struct File {
    driver: Arc<dyn Driver>,
    id: FileId,
    read_pos: u64,
    write_pos: u64,
    size: u64,
    closed: bool,
}

/// Error returned by [`File::write`].
#[derive(Debug)]
pub enum WriteError {
    /// Only a prefix was written; `remainder` holds the unwritten tail and
    /// the write cursor sits right before it.
    Partial { remainder: Vec<u8> },
    Io(IoError),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Partial { remainder } => {
                write!(f, "short write, {} bytes remaining", remainder.len())
            }
            WriteError::Io(error) => error.fmt(f),
        }
    }
}

impl core::error::Error for WriteError {}

/// Error returned by the seek family when the target lies outside the file.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SeekOutOfBounds {
    pub target: i128,
    pub size: u64,
}

impl fmt::Display for SeekOutOfBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "seek target {} outside of file of {} bytes",
            self.target, self.size
        )
    }
}

impl core::error::Error for SeekOutOfBounds {}

impl File {
    /// Opens `path` through `driver`.
    pub async fn open(
        driver: Arc<dyn Driver>,
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<File, IoError> {
        let op = Op::Open {
            path: path.as_ref().to_owned(),
            options,
        };
        match Submission::new(&*driver, op).await? {
            Outcome::Opened { file, size } => Ok(File {
                driver: Arc::clone(&driver),
                id: file,
                read_pos: 0,
                write_pos: 0,
                size,
                closed: false,
            }),
            other => unreachable!("open completed with {other:?}"),
        }
    }

    /// Reads up to `max` bytes at the read cursor, advancing it by the
    /// amount actually read.
    ///
    /// `Eof`, `Again` and `Interrupted` are surfaced distinctly; the latter
    /// two transferred nothing and may simply be retried.
    pub async fn read(&mut self, max: usize) -> Result<Vec<u8>, IoError> {
        let op = Op::ReadAt {
            file: self.id,
            offset: self.read_pos,
            len: max,
        };
        match Submission::new(&*self.driver, op).await? {
            Outcome::Read { data } => {
                self.read_pos += data.len() as u64;
                Ok(data)
            }
            other => unreachable!("read completed with {other:?}"),
        }
    }

    /// Writes `data` at the write cursor.
    ///
    /// On a partial completion the cursor advances past the written prefix
    /// and the unwritten remainder comes back in the error.
    pub async fn write(&mut self, data: Vec<u8>) -> Result<(), WriteError> {
        let len = data.len();
        let op = Op::WriteAt {
            file: self.id,
            offset: self.write_pos,
            data,
        };
        match Submission::new(&*self.driver, op).await {
            Ok(Outcome::Wrote { written, mut data }) => {
                self.write_pos += written as u64;
                self.size = self.size.max(self.write_pos);
                if written == len {
                    Ok(())
                } else {
                    Err(WriteError::Partial {
                        remainder: data.split_off(written),
                    })
                }
            }
            Ok(other) => unreachable!("write completed with {other:?}"),
            Err(error) => Err(WriteError::Io(error)),
        }
    }

    /// Moves the read cursor; the target is bound-checked against the
    /// current file size.
    pub fn seek_read(&mut self, pos: SeekFrom) -> Result<u64, SeekOutOfBounds> {
        self.read_pos = self.resolve(pos, self.read_pos)?;
        Ok(self.read_pos)
    }

    /// Moves the write cursor; the target is bound-checked against the
    /// current file size.
    pub fn seek_write(&mut self, pos: SeekFrom) -> Result<u64, SeekOutOfBounds> {
        self.write_pos = self.resolve(pos, self.write_pos)?;
        Ok(self.write_pos)
    }

    /// The read cursor's position.
    pub fn pos_read(&self) -> u64 {
        self.read_pos
    }

    /// The write cursor's position.
    pub fn pos_write(&self) -> u64 {
        self.write_pos
    }

    /// The tracked file size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Closes the file, reporting backend errors.
    pub async fn close(mut self) -> Result<(), IoError> {
        self.closed = true;
        match Submission::new(&*self.driver, Op::Close { file: self.id }).await? {
            Outcome::Closed => Ok(()),
            other => unreachable!("close completed with {other:?}"),
        }
    }

    fn resolve(&self, pos: SeekFrom, current: u64) -> Result<u64, SeekOutOfBounds> {
        let target: i128 = match pos {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::End(delta) => i128::from(self.size) + i128::from(delta),
            SeekFrom::Current(delta) => i128::from(current) + i128::from(delta),
        };
        if target < 0 || target > i128::from(self.size) {
            return Err(SeekOutOfBounds {
                target,
                size: self.size,
            });
        }
        Ok(target as u64)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if !self.closed {
            // fire-and-forget close; the completion is never polled
            let _ = self.driver.submit(Op::Close { file: self.id });
        }
    }
}

impl fmt::Debug for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("File")
            .field("id", &self.id)
            .field("read_pos", &self.read_pos)
            .field("write_pos", &self.write_pos)
            .field("size", &self.size)
            .finish()
    }
}
