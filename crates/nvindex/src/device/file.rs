//! File-backed block device.
//!
//! Uses positioned I/O (`pread`/`pwrite` semantics) so concurrent callers
//! never share a seek position.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{BlockDevice, block_offset};
use crate::{IndexError, Result};

/// Block device backed by a file or device node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    path: PathBuf,
    block_size: usize,
    block_count: u64,
}

impl FileDevice {
    /// Create (or truncate) a zero-filled image of `block_count` blocks.
    pub fn create(path: impl AsRef<Path>, block_size: usize, block_count: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(block_count * block_size as u64)?;

        debug!(
            "Created device image {} ({} blocks of {} bytes)",
            path.display(),
            block_count,
            block_size
        );

        Ok(Self {
            file,
            path,
            block_size,
            block_count,
        })
    }

    /// Open an existing image. Its length must be a whole number of blocks.
    pub fn open(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();

        if block_size == 0 || !len.is_multiple_of(block_size as u64) {
            return Err(IndexError::Format(format!(
                "{} is {len} bytes, not a multiple of block size {block_size}",
                path.display()
            )));
        }

        Ok(Self {
            file,
            path,
            block_size,
            block_count: len / block_size as u64,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush written blocks to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn read_block(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let offset = block_offset(addr, buf.len(), self.block_size, self.block_count)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_block(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let offset = block_offset(addr, buf.len(), self.block_size, self.block_count)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}
