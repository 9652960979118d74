//! Streams laid over raw block storage
//!
//! Flash chips and SD cards expose fixed-size blocks rather than files. A
//! [`BlockStream`] carves a contiguous run of blocks out of a
//! [`BlockDevice`] and presents it as one byte stream:
//!
//! ```text
//! block first_block      : superblock  "CABS" | u64 LE length
//! block first_block + 1  : data bytes 0 .. block_size
//! block first_block + 2  : data bytes block_size .. 2 * block_size
//! ...
//! ```
//!
//! Exactly one block is cached in RAM, so the stream adds `block_size`
//! bytes to the memory footprint regardless of how large the file is.

use super::{ByteStream, OpenMode};
use crate::error::CSError;

const SUPERBLOCK_MAGIC: [u8; 4] = *b"CABS";
const SUPERBLOCK_LEN: usize = 12;

/// Raw block storage.
pub trait BlockDevice {
    /// Size of one block in bytes
    fn block_size(&self) -> usize;

    /// Number of blocks on the device
    fn block_count(&self) -> u64;

    /// Read block `index` into `buf` (`buf.len() == block_size()`)
    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<(), CSError>;

    /// Write `buf` (`buf.len() == block_size()`) to block `index`
    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<(), CSError>;
}

/// RAM-backed block device for tests and prebuilt flash images.
#[derive(Debug, Clone)]
pub struct MemoryBlockDevice {
    block_size: usize,
    data: Vec<u8>,
    block_reads: usize,
}

impl MemoryBlockDevice {
    /// Create a zeroed device.
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            data: vec![0u8; block_size * block_count as usize],
            block_reads: 0,
        }
    }

    /// Wrap an existing image. Trailing bytes that do not fill a block are ignored.
    pub fn from_image(block_size: usize, image: Vec<u8>) -> Self {
        Self {
            block_size,
            data: image,
            block_reads: 0,
        }
    }

    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    /// Number of block reads served so far
    pub fn block_reads(&self) -> usize {
        self.block_reads
    }

    fn range(&self, index: u64) -> Result<std::ops::Range<usize>, CSError> {
        if self.block_size == 0 || index >= self.block_count() {
            return Err(CSError::InvalidArgument(format!(
                "block {} out of range",
                index
            )));
        }
        let start = index as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockDevice for MemoryBlockDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        if self.block_size == 0 {
            return 0;
        }
        (self.data.len() / self.block_size) as u64
    }

    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> Result<(), CSError> {
        let range = self.range(index)?;
        buf.copy_from_slice(&self.data[range]);
        self.block_reads += 1;
        Ok(())
    }

    fn write_block(&mut self, index: u64, buf: &[u8]) -> Result<(), CSError> {
        let range = self.range(index)?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }
}

/// A byte stream stored in a run of blocks on a [`BlockDevice`].
#[derive(Debug)]
pub struct BlockStream<D: BlockDevice> {
    device: D,
    name: String,
    first_block: u64,
    region_blocks: u64,
    mode: Option<OpenMode>,
    len: u64,
    pos: u64,
    cache: Vec<u8>,
    cached_block: Option<u64>,
    dirty: bool,
}

impl<D: BlockDevice> BlockStream<D> {
    /// Use blocks `first_block .. first_block + region_blocks` of `device`.
    ///
    /// The first block of the region holds the superblock, the rest hold data.
    pub fn new(device: D, first_block: u64, region_blocks: u64, name: impl Into<String>) -> Self {
        let block_size = device.block_size();
        Self {
            device,
            name: name.into(),
            first_block,
            region_blocks,
            mode: None,
            len: 0,
            pos: 0,
            cache: vec![0u8; block_size],
            cached_block: None,
            dirty: false,
        }
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Close the stream and hand back the device.
    pub fn into_device(mut self) -> D {
        self.close();
        self.device
    }

    fn block_size(&self) -> usize {
        self.cache.len()
    }

    /// Bytes available for data in this region.
    pub fn capacity(&self) -> u64 {
        self.region_blocks.saturating_sub(1) * self.block_size() as u64
    }

    fn check_geometry(&self) -> Result<(), CSError> {
        if self.block_size() < SUPERBLOCK_LEN {
            return Err(CSError::InvalidArgument(format!(
                "block size {} too small for '{}'",
                self.block_size(),
                self.name
            )));
        }
        if self.region_blocks == 0
            || self.first_block.saturating_add(self.region_blocks) > self.device.block_count()
        {
            return Err(CSError::InvalidArgument(format!(
                "region for '{}' does not fit on the device",
                self.name
            )));
        }
        Ok(())
    }

    fn flush_cache(&mut self) -> Result<(), CSError> {
        if let (true, Some(block)) = (self.dirty, self.cached_block) {
            self.device
                .write_block(self.first_block + 1 + block, &self.cache)?;
            self.dirty = false;
        }
        Ok(())
    }

    fn load_block(&mut self, block: u64) -> Result<(), CSError> {
        if self.cached_block == Some(block) {
            return Ok(());
        }
        self.flush_cache()?;
        self.cached_block = None;
        let block_start = block * self.block_size() as u64;
        if self.mode == Some(OpenMode::Write) && block_start >= self.len {
            self.cache.fill(0);
        } else {
            self.device
                .read_block(self.first_block + 1 + block, &mut self.cache)?;
        }
        self.cached_block = Some(block);
        Ok(())
    }

    fn write_superblock(&mut self) -> Result<(), CSError> {
        let mut block = vec![0u8; self.block_size()];
        block[..4].copy_from_slice(&SUPERBLOCK_MAGIC);
        block[4..SUPERBLOCK_LEN].copy_from_slice(&self.len.to_le_bytes());
        self.device.write_block(self.first_block, &block)
    }

    fn read_superblock(&mut self) -> Result<u64, CSError> {
        self.device.read_block(self.first_block, &mut self.cache)?;
        if self.cache[..4] != SUPERBLOCK_MAGIC {
            return Err(CSError::Corrupt(format!(
                "'{}' has no valid superblock",
                self.name
            )));
        }
        let mut len = [0u8; 8];
        len.copy_from_slice(&self.cache[4..SUPERBLOCK_LEN]);
        let len = u64::from_le_bytes(len);
        if len > self.capacity() {
            return Err(CSError::Corrupt(format!(
                "'{}' claims {} bytes but the region holds {}",
                self.name,
                len,
                self.capacity()
            )));
        }
        Ok(len)
    }
}

impl<D: BlockDevice> ByteStream for BlockStream<D> {
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError> {
        self.close();
        self.check_geometry()?;
        self.cached_block = None;
        self.dirty = false;
        self.pos = 0;
        self.len = match mode {
            OpenMode::Read => self.read_superblock()?,
            OpenMode::Write => 0,
        };
        self.mode = Some(mode);
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), CSError> {
        let limit = match self.mode {
            None => return Err(CSError::NotOpen),
            Some(OpenMode::Read) => self.len,
            Some(OpenMode::Write) => self.capacity(),
        };
        if offset > limit {
            return Err(CSError::InvalidArgument(format!(
                "seek to {} past end of '{}' ({})",
                offset, self.name, limit
            )));
        }
        self.pos = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError> {
        if self.mode.is_none() {
            return Err(CSError::NotOpen);
        }
        if buf.is_empty() || self.pos >= self.len {
            return Ok(0);
        }
        let block_size = self.block_size() as u64;
        let block = self.pos / block_size;
        let within = (self.pos % block_size) as usize;
        let n = buf
            .len()
            .min((self.len - self.pos) as usize)
            .min(self.block_size() - within);
        self.load_block(block)?;
        buf[..n].copy_from_slice(&self.cache[within..within + n]);
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
        if buf.is_empty() || self.pos >= self.capacity() {
            return Ok(0);
        }
        let block_size = self.block_size() as u64;
        let block = self.pos / block_size;
        let within = (self.pos % block_size) as usize;
        let n = buf
            .len()
            .min((self.capacity() - self.pos) as usize)
            .min(self.block_size() - within);
        self.load_block(block)?;
        self.cache[within..within + n].copy_from_slice(&buf[..n]);
        self.dirty = true;
        self.pos += n as u64;
        self.len = self.len.max(self.pos);
        Ok(n)
    }

    fn close(&mut self) {
        if self.mode == Some(OpenMode::Write) {
            if let Err(e) = self.flush() {
                log::warn!("Failed to flush '{}' on close: {}", self.name, e);
            }
        }
        self.mode = None;
        self.cached_block = None;
        self.dirty = false;
    }

    fn len(&mut self) -> Result<u64, CSError> {
        if self.mode.is_none() {
            return Err(CSError::NotOpen);
        }
        Ok(self.len)
    }

    fn flush(&mut self) -> Result<(), CSError> {
        if self.mode == Some(OpenMode::Write) {
            self.flush_cache()?;
            self.write_superblock()?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
