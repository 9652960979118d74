//! Reads single certificates out of the archive
//!
//! The archive is raw concatenated DER with no delimiters. It is only ever
//! addressed through an [`IndexRecord`], never scanned.

use crate::error::CSError;
use crate::index::IndexRecord;
use crate::stream::ByteStream;

/// Fill `buf` from `offset`, looping over short reads.
///
/// A zero-length read before `buf` is full is a [`CSError::ShortRead`].
/// [`CSError::WouldBlock`] is retried up to `retries` times in a row.
pub fn read_exact_at<S: ByteStream + ?Sized>(
    stream: &mut S,
    offset: u64,
    buf: &mut [u8],
    retries: u32,
) -> Result<(), CSError> {
    stream.seek(offset)?;
    let mut filled = 0;
    let mut busy = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(CSError::ShortRead {
                    expected: buf.len(),
                    actual: filled,
                })
            }
            Ok(n) => {
                filled += n;
                busy = 0;
            }
            Err(CSError::WouldBlock) if busy < retries => {
                busy += 1;
                log::trace!("'{}' busy at offset {}, retry {}", stream.name(), offset, busy);
                std::thread::yield_now();
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Borrowed view of the archive stream for one lookup.
pub struct ArchiveReader<'a, A: ByteStream + ?Sized> {
    archive: &'a mut A,
    archive_len: u64,
    read_retries: u32,
}

impl<'a, A: ByteStream + ?Sized> ArchiveReader<'a, A> {
    /// `archive_len` is the stream length observed when the store was opened.
    pub fn new(archive: &'a mut A, archive_len: u64, read_retries: u32) -> Self {
        Self {
            archive,
            archive_len,
            read_retries,
        }
    }

    /// Read the certificate `record` points at into the front of `scratch`.
    ///
    /// Exactly `record.length` bytes are read, starting at
    /// `record.archive_offset`. Nothing outside that range is touched.
    pub fn read_certificate<'s>(
        &mut self,
        record: &IndexRecord,
        scratch: &'s mut [u8],
    ) -> Result<&'s [u8], CSError> {
        let length = record.length as usize;
        if length > scratch.len() {
            return Err(CSError::CertificateTooLarge {
                length,
                max: scratch.len(),
            });
        }
        if record.archive_end() > self.archive_len {
            return Err(CSError::Corrupt(format!(
                "record [{}, {}) lies outside the {}-byte archive '{}'",
                record.archive_offset,
                record.archive_end(),
                self.archive_len,
                self.archive.name()
            )));
        }

        let buf = &mut scratch[..length];
        read_exact_at(
            &mut *self.archive,
            record.archive_offset as u64,
            buf,
            self.read_retries,
        )?;
        Ok(buf)
    }
}
