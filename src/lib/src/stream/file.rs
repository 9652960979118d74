use super::{ByteStream, OpenMode};
use crate::error::CSError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A stream backed by a file on a regular filesystem.
#[derive(Debug)]
pub struct FileStream {
    path: PathBuf,
    name: String,
    file: Option<File>,
    mode: Option<OpenMode>,
}

impl FileStream {
    /// Create a stream for `path`. Nothing is opened until [`ByteStream::open`].
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let name = path.display().to_string();
        Self {
            path,
            name,
            file: None,
            mode: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file(&mut self) -> Result<&mut File, CSError> {
        self.file.as_mut().ok_or(CSError::NotOpen)
    }
}

fn map_io(err: io::Error) -> CSError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => CSError::WouldBlock,
        _ => CSError::IOError(err),
    }
}

impl ByteStream for FileStream {
    fn open(&mut self, mode: OpenMode) -> Result<(), CSError> {
        self.close();
        let file = match mode {
            OpenMode::Read => File::open(&self.path),
            OpenMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&self.path),
        }
        .map_err(|e| {
            log::debug!("Failed to open '{}': {}", self.name, e);
            CSError::IOError(e)
        })?;
        self.file = Some(file);
        self.mode = Some(mode);
        Ok(())
    }

    fn seek(&mut self, offset: u64) -> Result<(), CSError> {
        self.file()?.seek(SeekFrom::Start(offset)).map_err(map_io)?;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, CSError> {
        self.file()?.read(buf).map_err(map_io)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, CSError> {
        if self.mode != Some(OpenMode::Write) {
            return Err(CSError::InvalidArgument(format!(
                "'{}' is not open for writing",
                self.name
            )));
        }
        self.file()?.write(buf).map_err(map_io)
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if self.mode == Some(OpenMode::Write) {
                if let Err(e) = file.sync_all() {
                    log::warn!("Failed to sync '{}' on close: {}", self.name, e);
                }
            }
        }
        self.mode = None;
    }

    fn len(&mut self) -> Result<u64, CSError> {
        Ok(self.file()?.metadata()?.len())
    }

    fn flush(&mut self) -> Result<(), CSError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            if self.mode == Some(OpenMode::Write) {
                file.sync_data()?;
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        self.close();
    }
}
