//! Immutable format-time geometry and the layout derived from it.

use byte_unit::Byte;
use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::fs::inode::INODE_RECORD_SIZE;
use crate::fs::{NUM_DIRECT_PTRS, PTR_SIZE};

/// Smallest supported block size; the superblock record must fit in one block.
pub const MIN_BLOCK_SIZE: u32 = 64;

/// Geometry chosen at format time. Every derived offset below is a pure
/// function of these four numbers, so a mounted image never needs more
/// than the superblock to find its structures.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Bytes per block; a power of two, at least [`MIN_BLOCK_SIZE`].
    pub block_size: u32,
    /// Bytes per inode-table slot; at least [`INODE_RECORD_SIZE`].
    pub inode_size: u32,
    /// Data-region blocks. Index 0 is reserved as the null pointer.
    pub num_blocks: u32,
    /// Inode-table slots. Inode 0 is reserved; the root is inode 1.
    pub num_inodes: u32,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.block_size < MIN_BLOCK_SIZE || !self.block_size.is_power_of_two() {
            return Err(FsError::Format(format!(
                "block_size {} must be a power of two of at least {}",
                self.block_size, MIN_BLOCK_SIZE
            )));
        }
        if (self.inode_size as usize) < INODE_RECORD_SIZE {
            return Err(FsError::Format(format!(
                "inode_size {} cannot hold a {}-byte inode record",
                self.inode_size, INODE_RECORD_SIZE
            )));
        }
        // One slot for the reserved index, one for something usable.
        if self.num_inodes < 2 {
            return Err(FsError::Format(format!(
                "num_inodes {} leaves no usable inode",
                self.num_inodes
            )));
        }
        if self.num_blocks < 2 {
            return Err(FsError::Format(format!(
                "num_blocks {} leaves no usable data block",
                self.num_blocks
            )));
        }
        Ok(())
    }

    /// Pointer fan-out of one indirect block.
    pub fn ptrs_per_block(&self) -> u64 {
        (self.block_size as usize / PTR_SIZE) as u64
    }

    /// Number of logical blocks one inode can address:
    /// 12 direct plus one single, double and triple indirect tree.
    pub fn max_file_blocks(&self) -> u64 {
        let n = self.ptrs_per_block();
        let single = n;
        let double = n.saturating_mul(n);
        let triple = double.saturating_mul(n);
        (NUM_DIRECT_PTRS as u64)
            .saturating_add(single)
            .saturating_add(double)
            .saturating_add(triple)
    }

    /// Byte ceiling for a single file.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_blocks().saturating_mul(self.block_size as u64)
    }

    // Region layout, in device blocks. Order is fixed: superblock,
    // inode bitmap, data bitmap, inode table, data blocks.

    pub fn inode_bitmap_start(&self) -> u64 {
        1
    }

    pub fn inode_bitmap_blocks(&self) -> u64 {
        self.bitmap_blocks(self.num_inodes)
    }

    pub fn data_bitmap_start(&self) -> u64 {
        self.inode_bitmap_start() + self.inode_bitmap_blocks()
    }

    pub fn data_bitmap_blocks(&self) -> u64 {
        self.bitmap_blocks(self.num_blocks)
    }

    pub fn inode_table_start(&self) -> u64 {
        self.data_bitmap_start() + self.data_bitmap_blocks()
    }

    pub fn inode_table_blocks(&self) -> u64 {
        let table_bytes = self.num_inodes as u64 * self.inode_size as u64;
        table_bytes.div_ceil(self.block_size as u64)
    }

    /// First data-region block; data pointer `p` lives at device block
    /// `data_start() + p`.
    pub fn data_start(&self) -> u64 {
        self.inode_table_start() + self.inode_table_blocks()
    }

    /// Device blocks needed for the whole image, metadata included.
    pub fn total_blocks(&self) -> u64 {
        self.data_start() + self.num_blocks as u64
    }

    /// Image size in bytes, before any backend header.
    pub fn disk_size(&self) -> u64 {
        self.total_blocks() * self.block_size as u64
    }

    fn bitmap_blocks(&self, bits: u32) -> u64 {
        let bytes = (bits as u64).div_ceil(8);
        bytes.div_ceil(self.block_size as u64)
    }
}

/// Human-readable byte count for error messages.
pub(crate) fn pretty_bytes(n: u64) -> String {
    Byte::from_bytes(n as u128).get_appropriate_unit(true).to_string()
}
