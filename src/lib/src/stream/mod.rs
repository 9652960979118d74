//! Byte stream abstraction for certificate store files
//!
//! The store never touches a filesystem directly. Everything it needs from
//! storage is expressed by [`ByteStream`]: open, seek to an absolute offset,
//! read into a caller-owned buffer, write, close. Any backend offering these
//! operations can hold the index or the archive:
//!
//! - [`FileStream`] - a file on a regular filesystem (host, development)
//! - [`BlockStream`] - a file laid over a raw [`BlockDevice`] (flash, SD card)
//! - [`MemoryStream`] - an in-RAM buffer (tests, compiled-in images)
//!
//! # Contract
//!
//! - `read` returns the number of bytes placed in `buf`, `0` at end of stream.
//!   A short count is legal; callers loop.
//! - The callee never reads or writes past `buf.len()`.
//! - [`CSError::WouldBlock`] is the only error a caller may retry.
//! - `close` is idempotent and releases the handle. Pending writes must be
//!   pushed with [`ByteStream::flush`] first if the caller wants to observe
//!   write errors.
//! - No buffering is promised. The store works with none.

mod block;
mod file;
mod memory;

pub use block::{BlockDevice, BlockStream, MemoryBlockDevice};
pub use file::FileStream;
pub use memory::MemoryStream;

use crate::error::CSError;

/// Consecutive [`CSError::WouldBlock`] results [`ByteStream::write_all`] tolerates.
pub const DEFAULT_WRITE_RETRIES: u32 = 3;

/// How a stream is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access to existing content
    Read,
    /// Create or truncate, then write
    Write,
}

/// A named, seekable byte sequence.
pub trait ByteStream {
    /// Open the stream. Re-opening an open stream resets it.
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError>;

    /// Move to an absolute byte offset.
    fn seek(&mut self, offset: u64) -> Result<(), CSError>;

    /// Read up to `buf.len()` bytes. Returns `0` at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError>;

    /// Write up to `buf.len()` bytes. Returns `0` when the medium is full.
    fn write(&mut self, buf: &[u8]) -> Result<usize, CSError>;

    /// Release the handle. Calling it twice is harmless.
    fn close(&mut self);

    /// Total length of the stream in bytes.
    fn len(&mut self) -> Result<u64, CSError>;

    /// Push buffered writes to the medium.
    fn flush(&mut self) -> Result<(), CSError> {
        Ok(())
    }

    /// Human-readable name, used in log messages.
    fn name(&self) -> &str;

    /// Write the whole buffer or fail.
    fn write_all(&mut self, buf: &[u8]) -> Result<(), CSError> {
        self.write_all_with_retries(buf, DEFAULT_WRITE_RETRIES)
    }

    /// Write the whole buffer, retrying [`CSError::WouldBlock`] up to
    /// `retries` times in a row.
    fn write_all_with_retries(&mut self, mut buf: &[u8], retries: u32) -> Result<(), CSError> {
        let mut busy = 0;
        while !buf.is_empty() {
            match self.write(buf) {
                Ok(0) => {
                    return Err(CSError::IOError(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("no space left on '{}'", self.name()),
                    )))
                }
                Ok(n) => {
                    buf = &buf[n..];
                    busy = 0;
                }
                Err(CSError::WouldBlock) if busy < retries => {
                    busy += 1;
                    log::trace!("'{}' busy while writing, retry {}", self.name(), busy);
                    std::thread::yield_now();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError> {
        (**self).open(mode)
    }

    fn seek(&mut self, offset: u64) -> Result<(), CSError> {
        (**self).seek(offset)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError> {
        (**self).read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, CSError> {
        (**self).write(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn len(&mut self) -> Result<u64, CSError> {
        (**self).len()
    }

    fn flush(&mut self) -> Result<(), CSError> {
        (**self).flush()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
