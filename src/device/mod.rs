//! Pluggable block storage. A device is a flat array of fixed-size
//! blocks; which bytes back it (heap, host file, encrypted host file)
//! is chosen at format or mount time.

mod crypto;
mod encrypted;
mod file;
mod memory;

pub use encrypted::EncryptedBlockDevice;
pub use file::FileBlockDevice;
pub use memory::MemBlockDevice;

pub(crate) use file::ImageFile;

use crate::error::{FsError, Result};

/// Capability set of a backing store. Implementations use interior
/// mutability so a device can be shared as `Arc<dyn BlockDevice>`
/// between the filesystem core and its caller.
pub trait BlockDevice: Send + Sync {
    /// Total logical blocks, metadata regions included.
    fn num_blocks(&self) -> u64;

    fn block_size(&self) -> usize;

    /// Reads block `block` into `buf`; `buf.len()` must equal the block size.
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes block `block` from `buf`; `buf.len()` must equal the block size.
    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()>;

    /// Pushes buffered writes down to the host.
    fn flush(&self) -> Result<()>;

    /// Finalizes the device. Idempotent; also run on drop by backends
    /// that need it.
    fn close(&self) -> Result<()>;
}

/// Argument check shared by every backend.
pub(crate) fn check_block_io(
    num_blocks: u64,
    block_size: usize,
    block: u64,
    buf_len: usize,
) -> Result<()> {
    if block >= num_blocks {
        return Err(FsError::OutOfRange { block, limit: num_blocks });
    }
    if buf_len != block_size {
        return Err(FsError::BadSize { expected: block_size, found: buf_len });
    }
    Ok(())
}
