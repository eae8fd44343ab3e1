//! Heap-backed device, the baseline backend and the test workhorse.

use std::sync::Mutex;

use crate::device::{check_block_io, BlockDevice};
use crate::error::Result;

pub struct MemBlockDevice {
    data: Mutex<Vec<u8>>,
    block_size: usize,
    num_blocks: u64,
}

impl MemBlockDevice {
    /// A zero-filled device of `num_blocks` blocks.
    pub fn new(block_size: usize, num_blocks: u64) -> Self {
        MemBlockDevice {
            data: Mutex::new(vec![0u8; block_size * num_blocks as usize]),
            block_size,
            num_blocks,
        }
    }

    fn range(&self, block: u64) -> std::ops::Range<usize> {
        let start = block as usize * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for MemBlockDevice {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let data = self.data.lock().unwrap();
        buf.copy_from_slice(&data[self.range(block)]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let mut data = self.data.lock().unwrap();
        data[self.range(block)].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;

    #[test]
    fn test_read_write_round_trip() {
        let device = MemBlockDevice::new(512, 8);
        let payload = vec![0xA5u8; 512];
        device.write_block(3, &payload).unwrap();
        let mut back = vec![0u8; 512];
        device.read_block(3, &mut back).unwrap();
        assert_eq!(back, payload);
        // Neighbours stay zero.
        device.read_block(2, &mut back).unwrap();
        assert!(back.iter().all(|b| *b == 0));
    }

    #[test]
    fn test_out_of_range() {
        let device = MemBlockDevice::new(512, 8);
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            device.read_block(8, &mut buf),
            Err(FsError::OutOfRange { block: 8, limit: 8 })
        ));
    }

    #[test]
    fn test_bad_size() {
        let device = MemBlockDevice::new(512, 8);
        assert!(matches!(
            device.write_block(0, &[0u8; 100]),
            Err(FsError::BadSize { expected: 512, found: 100 })
        ));
    }
}
