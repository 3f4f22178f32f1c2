//! File-backed storage region for a shared file.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use bytes::BytesMut;
use shoal_core::geometry::ByteRange;
use shoal_core::{StorageBackend, StorageError};

/// A whole file on disk used as the durable block region.
#[derive(Debug)]
pub struct FileBackend {
    file: File,
    len: u64,
}

impl FileBackend {
    /// Open an existing file for seeding. Length is taken from the file.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }

    /// Create (or reuse) the download target and size it to `len`. Existing bytes are kept.
    pub fn create(path: &Path, len: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len(len)?;
        Ok(Self { file, len })
    }

    fn check(&self, range: ByteRange) -> Result<(), StorageError> {
        if range.end() > self.len {
            return Err(StorageError::OutOfBounds {
                offset: range.offset,
                len: range.len,
                size: self.len,
            });
        }
        Ok(())
    }
}

impl StorageBackend for FileBackend {
    fn len(&self) -> u64 {
        self.len
    }

    fn read(&self, range: ByteRange) -> Result<bytes::Bytes, StorageError> {
        self.check(range)?;
        let mut buf = BytesMut::zeroed(range.len as usize);
        let mut f = &self.file;
        f.seek(SeekFrom::Start(range.offset))?;
        f.read_exact(&mut buf)?;
        Ok(buf.freeze())
    }

    fn write(&mut self, range: ByteRange, data: &[u8]) -> Result<(), StorageError> {
        self.check(range)?;
        if data.len() as u64 != range.len {
            return Err(StorageError::OutOfBounds {
                offset: range.offset,
                len: data.len() as u64,
                size: range.len,
            });
        }
        self.file.seek(SeekFrom::Start(range.offset))?;
        self.file.write_all(data)?;
        Ok(())
    }
}
