use super::{ByteStream, OpenMode};
use crate::error::CSError;
use std::ops::Range;

/// An in-memory stream.
///
/// Useful for compiled-in stores (`include_bytes!`) and for tests, which can
/// inject faults and, with [`MemoryStream::with_access_log`], inspect exactly
/// which byte ranges were read. Without the log the stream holds nothing
/// beyond its data, however many reads it serves.
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    name: String,
    data: Vec<u8>,
    pos: u64,
    mode: Option<OpenMode>,
    fail_open: bool,
    fail_reads_after: Option<usize>,
    max_chunk: Option<usize>,
    would_block_every: Option<usize>,
    fail_writes_after: Option<usize>,
    busy_writes: bool,
    read_calls: usize,
    write_calls: usize,
    access_log: Option<Vec<Range<u64>>>,
}

impl MemoryStream {
    /// Create a stream holding `data`.
    pub fn new(name: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            data,
            ..Self::default()
        }
    }

    /// Create an empty stream, typically to be written by the builder.
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Make every `open` fail.
    pub fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Let `n` read calls succeed, then fail every following one.
    pub fn with_failing_reads_after(mut self, n: usize) -> Self {
        self.fail_reads_after = Some(n);
        self
    }

    /// Return at most `n` bytes per read call.
    pub fn with_short_reads(mut self, n: usize) -> Self {
        self.max_chunk = Some(n.max(1));
        self
    }

    /// Report [`CSError::WouldBlock`] on every `n`-th read call.
    pub fn with_would_block_every(mut self, n: usize) -> Self {
        self.would_block_every = Some(n.max(1));
        self
    }

    /// Let `n` write calls succeed, then fail every following one.
    pub fn with_failing_writes_after(mut self, n: usize) -> Self {
        self.fail_writes_after = Some(n);
        self
    }

    /// Report [`CSError::WouldBlock`] on every write call.
    pub fn with_busy_writes(mut self) -> Self {
        self.busy_writes = true;
        self
    }

    /// Record the byte range of every read.
    pub fn with_access_log(mut self) -> Self {
        self.access_log = Some(Vec::new());
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    /// Byte ranges returned by read calls since the last [`Self::clear_access_log`].
    ///
    /// Always empty unless the stream was built [`Self::with_access_log`].
    pub fn access_log(&self) -> &[Range<u64>] {
        self.access_log.as_deref().unwrap_or(&[])
    }

    pub fn clear_access_log(&mut self) {
        if let Some(log) = self.access_log.as_mut() {
            log.clear();
        }
    }

    /// Heap bytes owned by the stream: data, name and access log.
    pub fn heap_bytes(&self) -> usize {
        self.data.capacity()
            + self.name.capacity()
            + self
                .access_log
                .as_ref()
                .map_or(0, |log| log.capacity() * std::mem::size_of::<Range<u64>>())
    }

    /// Number of read calls served so far, including failed ones.
    pub fn read_calls(&self) -> usize {
        self.read_calls
    }

    /// Number of write calls made so far, including failed ones.
    pub fn write_calls(&self) -> usize {
        self.write_calls
    }

    pub fn is_open(&self) -> bool {
        self.mode.is_some()
    }
}

impl ByteStream for MemoryStream {
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError> {
        if self.fail_open {
            return Err(CSError::IOError(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("'{}' cannot be opened", self.name),
            )));
        }
        if mode == OpenMode::Write {
            self.data.clear();
        }
        self.pos = 0;
        self.mode = Some(mode);
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), CSError> {
        if self.mode.is_none() {
            return Err(CSError::NotOpen);
        }
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError> {
        if self.mode.is_none() {
            return Err(CSError::NotOpen);
        }
        self.read_calls += 1;
        if let Some(limit) = self.fail_reads_after {
            if self.read_calls > limit {
                return Err(CSError::IOError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected read failure on '{}'", self.name),
                )));
            }
        }
        if let Some(every) = self.would_block_every {
            if self.read_calls % every == 0 {
                return Err(CSError::WouldBlock);
            }
        }

        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let available = (len - self.pos) as usize;
        let mut n = buf.len().min(available);
        if let Some(chunk) = self.max_chunk {
            n = n.min(chunk);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        if let Some(log) = self.access_log.as_mut() {
            log.push(self.pos..self.pos + n as u64);
        }
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, CSError> {
        match self.mode {
            None => return Err(CSError::NotOpen),
            Some(OpenMode::Read) => {
                return Err(CSError::InvalidArgument(format!(
                    "'{}' is not open for writing",
                    self.name
                )))
            }
            Some(OpenMode::Write) => {}
        }
        self.write_calls += 1;
        if let Some(limit) = self.fail_writes_after {
            if self.write_calls > limit {
                return Err(CSError::IOError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("injected write failure on '{}'", self.name),
                )));
            }
        }
        if self.busy_writes {
            return Err(CSError::WouldBlock);
        }
        let start = self.pos as usize;
        let end = start + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.mode = None;
    }

    fn len(&mut self) -> Result<u64, CSError> {
        if self.mode.is_none() {
            return Err(CSError::NotOpen);
        }
        Ok(self.data.len() as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
