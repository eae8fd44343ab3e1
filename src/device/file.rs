//! Host-file backend. Block `n` lives at byte offset
//! `header_len + n * block_size` of a memory-mapped image file; an
//! advisory `flock` keeps a second process from mounting the same image.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use log::debug;
use memmap2::MmapMut;

use crate::device::{check_block_io, BlockDevice};
use crate::error::{FsError, Result};

/// A locked, memory-mapped image file.
pub(crate) struct ImageFile {
    // Held only for the advisory lock; unlocked when the device drops.
    _file: File,
    map: MmapMut,
}

impl ImageFile {
    /// Creates a fresh zero-filled image of exactly `len` bytes.
    /// Refuses to clobber an existing file.
    pub(crate) fn create(path: &Path, len: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(map_open_error)?;
        lock_exclusive(&file)?;
        file.set_len(len)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("created image {} ({len} bytes)", path.display());
        Ok(ImageFile { _file: file, map })
    }

    pub(crate) fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(map_open_error)?;
        lock_exclusive(&file)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        debug!("opened image {} ({} bytes)", path.display(), map.len());
        Ok(ImageFile { _file: file, map })
    }

    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub(crate) fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

fn map_open_error(e: std::io::Error) -> FsError {
    match e.kind() {
        std::io::ErrorKind::NotFound => FsError::NotFound,
        std::io::ErrorKind::AlreadyExists => FsError::Exists,
        _ => FsError::Io(e),
    }
}

fn lock_exclusive(file: &File) -> Result<()> {
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Err(FsError::AlreadyMounted)
    } else {
        Err(FsError::Io(err))
    }
}

/// Plain (unencrypted) file-backed block device.
pub struct FileBlockDevice {
    image: Mutex<ImageFile>,
    block_size: usize,
    num_blocks: u64,
}

impl FileBlockDevice {
    pub fn create<P: AsRef<Path>>(path: P, block_size: usize, num_blocks: u64) -> Result<Self> {
        let image = ImageFile::create(path.as_ref(), block_size as u64 * num_blocks)?;
        Ok(Self::from_image(image, block_size, num_blocks))
    }

    /// Opens an existing image whose geometry the caller has already
    /// read from its superblock.
    pub fn open<P: AsRef<Path>>(path: P, block_size: usize, num_blocks: u64) -> Result<Self> {
        let image = ImageFile::open(path.as_ref())?;
        if image.len() != block_size as u64 * num_blocks {
            return Err(FsError::Format(format!(
                "image is {} bytes, geometry says {}",
                image.len(),
                block_size as u64 * num_blocks
            )));
        }
        Ok(Self::from_image(image, block_size, num_blocks))
    }

    pub(crate) fn from_image(image: ImageFile, block_size: usize, num_blocks: u64) -> Self {
        FileBlockDevice { image: Mutex::new(image), block_size, num_blocks }
    }

    fn range(&self, block: u64) -> std::ops::Range<usize> {
        let start = block as usize * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for FileBlockDevice {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let image = self.image.lock().unwrap();
        buf.copy_from_slice(&image.bytes()[self.range(block)]);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let mut image = self.image.lock().unwrap();
        let range = self.range(block);
        image.bytes_mut()[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.image.lock().unwrap().flush()
    }

    fn close(&self) -> Result<()> {
        self.flush()
    }
}
