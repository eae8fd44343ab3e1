//! Byte-addressed reads, writes and truncation over the block map.
//! Partial blocks are read-modify-write; holes read as zeroes.

use crate::error::{FsError, Result};
use crate::fs::filesystem::FsCore;
use crate::fs::inode::Inode;

impl FsCore {
    /// Reads up to `want` bytes at `pos`, short only at end of file.
    pub(crate) fn read_at(&self, inode: &Inode, pos: u64, want: usize) -> Result<Vec<u8>> {
        if pos >= inode.size {
            return Ok(Vec::new());
        }
        let block_size = self.config.block_size as u64;
        let len = want.min((inode.size - pos) as usize);
        let mut out = vec![0u8; len];
        let mut done = 0usize;
        while done < len {
            let at = pos + done as u64;
            let lblock = at / block_size;
            let offset = (at % block_size) as usize;
            let take = (block_size as usize - offset).min(len - done);
            let ptr = self.locate_block(inode, lblock)?;
            if ptr != 0 {
                let block = self.read_data_block(ptr)?;
                out[done..done + take].copy_from_slice(&block[offset..offset + take]);
            }
            done += take;
        }
        Ok(out)
    }

    /// Writes all of `data` at `pos`, allocating as needed. A position
    /// past the end first materializes the gap as zero-filled blocks.
    /// `size` grows with the bytes actually written, so an allocation
    /// failure partway leaves the inode describing exactly what landed.
    pub(crate) fn write_at(&mut self, inode: &mut Inode, pos: u64, data: &[u8]) -> Result<usize> {
        let end = pos
            .checked_add(data.len() as u64)
            .ok_or(FsError::FileTooLarge)?;
        if end > self.config.max_file_size() {
            return Err(FsError::FileTooLarge);
        }
        if pos > inode.size {
            self.fill_gap(inode, pos)?;
        }
        let block_size = self.config.block_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let at = pos + done as u64;
            let lblock = at / block_size;
            let offset = (at % block_size) as usize;
            let take = (block_size as usize - offset).min(data.len() - done);
            let ptr = self.ensure_block(inode, lblock)?;
            if take == block_size as usize {
                self.write_data_block(ptr, &data[done..done + take])?;
            } else {
                let mut block = self.read_data_block(ptr)?;
                block[offset..offset + take].copy_from_slice(&data[done..done + take]);
                self.write_data_block(ptr, &block)?;
            }
            done += take;
            let written_end = pos + done as u64;
            if written_end > inode.size {
                inode.size = written_end;
            }
        }
        inode.touch_mtime();
        Ok(done)
    }

    /// Shrinking frees now-unreachable blocks and zeroes the stale tail
    /// of the last kept block; growing only moves `size` (reads of the
    /// new range see zeroes).
    pub(crate) fn truncate_to(&mut self, inode: &mut Inode, new_size: u64) -> Result<()> {
        if new_size > self.config.max_file_size() {
            return Err(FsError::FileTooLarge);
        }
        let block_size = self.config.block_size as u64;
        if new_size < inode.size {
            let keep = new_size.div_ceil(block_size);
            self.shrink_blocks(inode, keep)?;
            let tail = (new_size % block_size) as usize;
            if tail != 0 {
                let ptr = self.locate_block(inode, new_size / block_size)?;
                if ptr != 0 {
                    let mut block = self.read_data_block(ptr)?;
                    block[tail..].fill(0);
                    self.write_data_block(ptr, &block)?;
                }
            }
        }
        inode.size = new_size;
        inode.touch_mtime();
        Ok(())
    }

    /// Materializes the hole `[inode.size, to)` as allocated zero
    /// blocks. Fresh allocations are already zeroed, and the byte range
    /// below `size` in the last block is kept zero by `truncate_to`, so
    /// coverage is all that is needed.
    fn fill_gap(&mut self, inode: &mut Inode, to: u64) -> Result<()> {
        let block_size = self.config.block_size as u64;
        let first = inode.size.div_ceil(block_size);
        let last = (to - 1) / block_size;
        for lblock in first..=last {
            self.ensure_block(inode, lblock)?;
            // Keep size current so a failure leaves no untracked gap.
            inode.size = ((lblock + 1) * block_size).min(to);
        }
        inode.size = to;
        Ok(())
    }
}
