//! Logical/physical offset arithmetic
//!
//! A backing file is a run of physical blocks of `block_size` bytes, each
//! holding `block_size - OVERHEAD` plaintext bytes. Only the last block may be
//! shorter, and it always holds at least one plaintext byte.

use crate::config::MAX_BLOCK_SIZE;
use crate::crypto::OVERHEAD;
use crate::error::{Error, Result};

/// Largest physical offset a backing file can address (`off_t` is signed)
pub const MAX_PHYSICAL_OFFSET: u64 = i64::MAX as u64;

/// Block geometry for one mount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    block_size: u64,
}

impl BlockLayout {
    /// Create a layout for the given physical block size
    pub fn new(block_size: usize) -> Result<Self> {
        if block_size <= OVERHEAD || block_size > MAX_BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "Block size {} outside ({}, {}]",
                block_size, OVERHEAD, MAX_BLOCK_SIZE
            )));
        }

        Ok(BlockLayout {
            block_size: block_size as u64,
        })
    }

    /// Physical block size
    pub fn block_size(&self) -> usize {
        self.block_size as usize
    }

    /// Plaintext bytes carried by a full block
    pub fn plaintext_block_size(&self) -> usize {
        self.block_size as usize - OVERHEAD
    }

    /// Fixed per-block overhead
    pub fn overhead(&self) -> usize {
        OVERHEAD
    }

    /// Block index and intra-block delta for a logical offset
    pub fn locate(&self, logical_offset: u64) -> (u64, usize) {
        let p = self.plaintext_block_size() as u64;
        (logical_offset / p, (logical_offset % p) as usize)
    }

    /// Logical offset of the first plaintext byte of a block
    pub fn logical_block_start(&self, index: u64) -> Result<u64> {
        index
            .checked_mul(self.plaintext_block_size() as u64)
            .ok_or_else(|| out_of_range("block", index))
    }

    /// Physical offset of a block
    pub fn block_start(&self, index: u64) -> Result<u64> {
        index
            .checked_mul(self.block_size)
            .filter(|&start| start <= MAX_PHYSICAL_OFFSET)
            .ok_or_else(|| out_of_range("block", index))
    }

    /// Logical size of a backing file of the given physical size.
    ///
    /// A trailing fragment shorter than the overhead counts as empty.
    pub fn logical_size(&self, physical_size: u64) -> u64 {
        let full = physical_size / self.block_size;
        let tail = physical_size % self.block_size;

        full * self.plaintext_block_size() as u64 + tail.saturating_sub(OVERHEAD as u64)
    }

    /// Physical size the write path produces for a logical size.
    ///
    /// Fails for logical sizes whose backing file would exceed
    /// [`MAX_PHYSICAL_OFFSET`].
    pub fn physical_size(&self, logical_size: u64) -> Result<u64> {
        let (full, tail) = self.locate(logical_size);
        let tail_bytes = if tail > 0 { (tail + OVERHEAD) as u64 } else { 0 };

        full.checked_mul(self.block_size)
            .and_then(|bytes| bytes.checked_add(tail_bytes))
            .filter(|&bytes| bytes <= MAX_PHYSICAL_OFFSET)
            .ok_or_else(|| out_of_range("logical size", logical_size))
    }

    /// Number of physical blocks backing a logical size
    pub fn block_count(&self, logical_size: u64) -> u64 {
        let p = self.plaintext_block_size() as u64;
        logical_size.div_ceil(p)
    }
}

fn out_of_range(what: &str, value: u64) -> Error {
    Error::InvalidArgument(format!("{} {} beyond addressable range", what, value))
}

impl Default for BlockLayout {
    fn default() -> Self {
        BlockLayout { block_size: 4096 }
    }
}
