//! Mapping from a file's logical block index to a data-block pointer:
//! twelve direct slots, then single, double and triple indirect trees
//! with fan-out `block_size / 4`.
//!
//! Reads never allocate; a zero anywhere on the path means "hole".
//! Write paths allocate and zero missing interior and leaf blocks
//! before descending. Truncation releases leaves past the cut, then
//! any interior block left without children, children first.

use crate::error::{FsError, Result};
use crate::fs::filesystem::FsCore;
use crate::fs::inode::Inode;
use crate::fs::{NUM_DIRECT_PTRS, PTR_SIZE};

impl FsCore {
    /// Resolves `lblock` without allocating. Zero means the block was
    /// never written; the caller reads zeroes.
    pub(crate) fn locate_block(&self, inode: &Inode, lblock: u64) -> Result<u32> {
        let n = self.config.ptrs_per_block();
        if lblock >= self.config.max_file_blocks() {
            return Err(FsError::FileTooLarge);
        }
        if lblock < NUM_DIRECT_PTRS as u64 {
            return Ok(inode.direct[lblock as usize]);
        }
        let mut index = lblock - NUM_DIRECT_PTRS as u64;
        if index < n {
            return self.lookup_indirect(inode.indirect, index, 1);
        }
        index -= n;
        if index < n * n {
            return self.lookup_indirect(inode.double_indirect, index, 2);
        }
        index -= n * n;
        self.lookup_indirect(inode.triple_indirect, index, 3)
    }

    /// Resolves `lblock`, allocating zeroed blocks along the way.
    pub(crate) fn ensure_block(&mut self, inode: &mut Inode, lblock: u64) -> Result<u32> {
        let n = self.config.ptrs_per_block();
        if lblock >= self.config.max_file_blocks() {
            return Err(FsError::FileTooLarge);
        }
        if lblock < NUM_DIRECT_PTRS as u64 {
            let slot = lblock as usize;
            if inode.direct[slot] == 0 {
                inode.direct[slot] = self.alloc_zeroed_block()?;
            }
            return Ok(inode.direct[slot]);
        }
        let mut index = lblock - NUM_DIRECT_PTRS as u64;
        if index < n {
            let root = self.ensure_root(&mut inode.indirect)?;
            return self.ensure_indirect(root, index, 1);
        }
        index -= n;
        if index < n * n {
            let root = self.ensure_root(&mut inode.double_indirect)?;
            return self.ensure_indirect(root, index, 2);
        }
        index -= n * n;
        let root = self.ensure_root(&mut inode.triple_indirect)?;
        self.ensure_indirect(root, index, 3)
    }

    /// Frees every data and interior block at or above logical block
    /// `keep`, clearing the freed pointers.
    pub(crate) fn shrink_blocks(&mut self, inode: &mut Inode, keep: u64) -> Result<()> {
        let n = self.config.ptrs_per_block();
        for slot in keep.min(NUM_DIRECT_PTRS as u64) as usize..NUM_DIRECT_PTRS {
            if inode.direct[slot] != 0 {
                self.free_data_block(inode.direct[slot])?;
                inode.direct[slot] = 0;
            }
        }
        let single_base = NUM_DIRECT_PTRS as u64;
        let double_base = single_base + n;
        let triple_base = double_base + n * n;
        inode.indirect =
            self.shrink_root(inode.indirect, keep.saturating_sub(single_base), n, 1)?;
        inode.double_indirect =
            self.shrink_root(inode.double_indirect, keep.saturating_sub(double_base), n * n, 2)?;
        inode.triple_indirect = self.shrink_root(
            inode.triple_indirect,
            keep.saturating_sub(triple_base),
            n * n * n,
            3,
        )?;
        Ok(())
    }

    fn lookup_indirect(&self, root: u32, index: u64, level: u32) -> Result<u32> {
        if root == 0 {
            return Ok(0);
        }
        if level == 1 {
            return self.read_ptr(root, index);
        }
        let child_cap = self.config.ptrs_per_block().pow(level - 1);
        let child = self.read_ptr(root, index / child_cap)?;
        self.lookup_indirect(child, index % child_cap, level - 1)
    }

    fn ensure_root(&mut self, root: &mut u32) -> Result<u32> {
        if *root == 0 {
            *root = self.alloc_zeroed_block()?;
        }
        Ok(*root)
    }

    fn ensure_indirect(&mut self, block: u32, index: u64, level: u32) -> Result<u32> {
        if level == 1 {
            let mut leaf = self.read_ptr(block, index)?;
            if leaf == 0 {
                leaf = self.alloc_zeroed_block()?;
                self.write_ptr(block, index, leaf)?;
            }
            return Ok(leaf);
        }
        let child_cap = self.config.ptrs_per_block().pow(level - 1);
        let slot = index / child_cap;
        let mut child = self.read_ptr(block, slot)?;
        if child == 0 {
            child = self.alloc_zeroed_block()?;
            self.write_ptr(block, slot, child)?;
        }
        self.ensure_indirect(child, index % child_cap, level - 1)
    }

    /// Shrinks one indirect tree. `keep` is relative to the tree's own
    /// range; returns the (possibly cleared) root pointer.
    fn shrink_root(&mut self, root: u32, keep: u64, capacity: u64, level: u32) -> Result<u32> {
        if root == 0 {
            return Ok(0);
        }
        if keep == 0 {
            self.free_subtree(root, level)?;
            return Ok(0);
        }
        if keep < capacity {
            self.shrink_indirect(root, keep, level)?;
        }
        Ok(root)
    }

    fn shrink_indirect(&mut self, block: u32, keep: u64, level: u32) -> Result<()> {
        let n = self.config.ptrs_per_block();
        let child_cap = n.pow(level - 1);
        for slot in 0..n {
            let covered = slot * child_cap;
            if covered + child_cap <= keep {
                continue;
            }
            let child = self.read_ptr(block, slot)?;
            if child == 0 {
                continue;
            }
            if keep <= covered {
                if level == 1 {
                    self.free_data_block(child)?;
                } else {
                    self.free_subtree(child, level - 1)?;
                }
                self.write_ptr(block, slot, 0)?;
            } else {
                // Only an interior child can straddle the cut.
                self.shrink_indirect(child, keep - covered, level - 1)?;
            }
        }
        Ok(())
    }

    /// Frees an indirect block and everything below it, children first.
    fn free_subtree(&mut self, block: u32, level: u32) -> Result<()> {
        let n = self.config.ptrs_per_block();
        for slot in 0..n {
            let child = self.read_ptr(block, slot)?;
            if child == 0 {
                continue;
            }
            if level == 1 {
                self.free_data_block(child)?;
            } else {
                self.free_subtree(child, level - 1)?;
            }
        }
        self.free_data_block(block)
    }

    fn read_ptr(&self, block: u32, slot: u64) -> Result<u32> {
        let bytes = self.read_data_block(block)?;
        let off = slot as usize * PTR_SIZE;
        Ok(u32::from_le_bytes(bytes[off..off + PTR_SIZE].try_into().unwrap()))
    }

    fn write_ptr(&mut self, block: u32, slot: u64, value: u32) -> Result<()> {
        let mut bytes = self.read_data_block(block)?;
        let off = slot as usize * PTR_SIZE;
        bytes[off..off + PTR_SIZE].copy_from_slice(&value.to_le_bytes());
        self.write_data_block(block, &bytes)
    }
}
