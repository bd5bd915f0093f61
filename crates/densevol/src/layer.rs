// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Synchronous 4 KiB block access to the metadata partitions.
//!
//! The journals and the super block read and write whole blocks through this
//! trait; the engine never touches the backing store any other way. Two
//! backends are provided: a Vec-backed [`MemoryLayer`] (the test default) and
//! a file-backed [`FileLayer`].

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::status::{Error, Result};
use crate::types::{BlockCount, PhysicalBlockNumber, BLOCK_SIZE};

/// Block-granular access to the physical backing store.
pub trait MetadataLayer: Send + Sync {
    /// Total number of addressable blocks.
    fn block_count(&self) -> BlockCount;

    /// Read the block at `pbn` into `block` (which must be `BLOCK_SIZE` long).
    fn read_block(&self, pbn: PhysicalBlockNumber, block: &mut [u8]) -> Result<()>;

    /// Write `block` (which must be `BLOCK_SIZE` long) at `pbn`.
    fn write_block(&self, pbn: PhysicalBlockNumber, block: &[u8]) -> Result<()>;

    /// Persist all completed writes.
    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

fn check_bounds(pbn: PhysicalBlockNumber, limit: BlockCount, len: usize) -> Result<()> {
    if len != BLOCK_SIZE {
        return Err(Error::BadConfiguration(format!(
            "block buffer must be {BLOCK_SIZE} bytes, got {len}"
        )));
    }
    if pbn >= limit {
        return Err(Error::VolumeOverflow { pbn, limit });
    }
    Ok(())
}

/// In-memory backing store. Blocks start zeroed, like a freshly discarded
/// device.
pub struct MemoryLayer {
    block_count: BlockCount,
    data: Mutex<Vec<u8>>,
}

impl MemoryLayer {
    pub fn new(block_count: BlockCount) -> Self {
        MemoryLayer {
            block_count,
            data: Mutex::new(vec![0u8; (block_count as usize) * BLOCK_SIZE]),
        }
    }
}

impl MetadataLayer for MemoryLayer {
    fn block_count(&self) -> BlockCount {
        self.block_count
    }

    fn read_block(&self, pbn: PhysicalBlockNumber, block: &mut [u8]) -> Result<()> {
        check_bounds(pbn, self.block_count, block.len())?;
        let data = self.data.lock();
        let offset = (pbn as usize) * BLOCK_SIZE;
        block.copy_from_slice(&data[offset..offset + BLOCK_SIZE]);
        Ok(())
    }

    fn write_block(&self, pbn: PhysicalBlockNumber, block: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count, block.len())?;
        let mut data = self.data.lock();
        let offset = (pbn as usize) * BLOCK_SIZE;
        data[offset..offset + BLOCK_SIZE].copy_from_slice(block);
        Ok(())
    }
}

/// File-backed store. The file is preallocated to its full size so partial
/// reads never occur.
pub struct FileLayer {
    block_count: BlockCount,
    file: Mutex<File>,
}

impl FileLayer {
    /// Create (or truncate) a backing file of `block_count` blocks.
    pub fn create(path: &Path, block_count: BlockCount) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(block_count * BLOCK_SIZE as u64)?;
        Ok(FileLayer {
            block_count,
            file: Mutex::new(file),
        })
    }

    /// Open an existing backing file, deriving the block count from its size.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        Ok(FileLayer {
            block_count: len / BLOCK_SIZE as u64,
            file: Mutex::new(file),
        })
    }
}

impl MetadataLayer for FileLayer {
    fn block_count(&self) -> BlockCount {
        self.block_count
    }

    fn read_block(&self, pbn: PhysicalBlockNumber, block: &mut [u8]) -> Result<()> {
        check_bounds(pbn, self.block_count, block.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        file.read_exact(block)?;
        Ok(())
    }

    fn write_block(&self, pbn: PhysicalBlockNumber, block: &[u8]) -> Result<()> {
        check_bounds(pbn, self.block_count, block.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pbn * BLOCK_SIZE as u64))?;
        file.write_all(block)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}
