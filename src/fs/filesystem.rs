//! Mount/format lifecycle and everything the other layers borrow:
//! the device, the superblock, both bitmaps and the inode table.

use std::path::Path;
use std::sync::{Arc, Mutex};

use log::info;

use crate::config::{pretty_bytes, Config};
use crate::device::{
    BlockDevice, EncryptedBlockDevice, FileBlockDevice, ImageFile, MemBlockDevice,
};
use crate::error::{FsError, Result};
use crate::fs::bitmap::Bitmap;
use crate::fs::directory::Directory;
use crate::fs::inode::{Inode, InodeKind};
use crate::fs::superblock::{SuperBlock, SUPERBLOCK_ENCODED_LEN};
use crate::fs::ROOT_INODE;

/// Space accounting for a mounted filesystem. Block counts cover the
/// data region only; metadata blocks are not charged to anyone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub total_inodes: u64,
    pub used_inodes: u64,
}

/// A mount that observed `Integrity` or `DoubleFree` is unusable; the
/// kind is replayed on every later call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Poison {
    Integrity,
    DoubleFree(u32),
}

impl Poison {
    fn to_error(self) -> FsError {
        match self {
            Poison::Integrity => FsError::Integrity,
            Poison::DoubleFree(index) => FsError::DoubleFree(index),
        }
    }
}

/// Single owner of all mounted state. Handles reference it through an
/// `Arc<Mutex<..>>` and carry indices, never pointers into it.
pub(crate) struct FsCore {
    pub(crate) device: Arc<dyn BlockDevice>,
    pub(crate) config: Config,
    superblock: SuperBlock,
    pub(crate) inode_bitmap: Bitmap,
    pub(crate) data_bitmap: Bitmap,
    poison: Option<Poison>,
    closed: bool,
}

/// Runs one operation against the core: poison and closed checks on the
/// way in, poison capture on the way out.
pub(crate) fn with_core<T>(
    core: &Arc<Mutex<FsCore>>,
    op: impl FnOnce(&mut FsCore) -> Result<T>,
) -> Result<T> {
    let mut core = core.lock().unwrap();
    if let Some(poison) = core.poison {
        return Err(poison.to_error());
    }
    if core.closed {
        return Err(FsError::BadMode);
    }
    let result = op(&mut core);
    if let Err(e) = &result {
        core.note_poison(e);
    }
    result
}

impl FsCore {
    fn note_poison(&mut self, error: &FsError) {
        match error {
            FsError::Integrity => self.poison = Some(Poison::Integrity),
            FsError::DoubleFree(index) => self.poison = Some(Poison::DoubleFree(*index)),
            _ => {}
        }
    }

    // ---- whole-block device access ----

    pub(crate) fn read_device_block(&self, block: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.config.block_size as usize];
        self.device.read_block(block, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn write_device_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        self.device.write_block(block, buf)
    }

    /// Data pointer `p` lives at device block `data_start + p`.
    pub(crate) fn read_data_block(&self, ptr: u32) -> Result<Vec<u8>> {
        self.read_device_block(self.config.data_start() + ptr as u64)
    }

    pub(crate) fn write_data_block(&self, ptr: u32, buf: &[u8]) -> Result<()> {
        self.write_device_block(self.config.data_start() + ptr as u64, buf)
    }

    pub(crate) fn alloc_zeroed_block(&mut self) -> Result<u32> {
        let ptr = self.data_bitmap.alloc()?;
        self.write_data_block(ptr, &vec![0u8; self.config.block_size as usize])?;
        Ok(ptr)
    }

    pub(crate) fn free_data_block(&mut self, ptr: u32) -> Result<()> {
        self.data_bitmap.free(ptr)
    }

    // ---- byte-addressed metadata access (inode table slots may
    //      straddle block boundaries) ----

    fn read_bytes(&self, mut pos: u64, buf: &mut [u8]) -> Result<()> {
        let block_size = self.config.block_size as u64;
        let mut done = 0usize;
        while done < buf.len() {
            let offset = (pos % block_size) as usize;
            let take = (block_size as usize - offset).min(buf.len() - done);
            let block = self.read_device_block(pos / block_size)?;
            buf[done..done + take].copy_from_slice(&block[offset..offset + take]);
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    fn write_bytes(&self, mut pos: u64, data: &[u8]) -> Result<()> {
        let block_size = self.config.block_size as u64;
        let mut done = 0usize;
        while done < data.len() {
            let offset = (pos % block_size) as usize;
            let take = (block_size as usize - offset).min(data.len() - done);
            if take == block_size as usize {
                self.write_device_block(pos / block_size, &data[done..done + take])?;
            } else {
                let mut block = self.read_device_block(pos / block_size)?;
                block[offset..offset + take].copy_from_slice(&data[done..done + take]);
                self.write_device_block(pos / block_size, &block)?;
            }
            done += take;
            pos += take as u64;
        }
        Ok(())
    }

    // ---- inode table ----

    fn inode_slot_pos(&self, index: u32) -> u64 {
        self.config.inode_table_start() * self.config.block_size as u64
            + index as u64 * self.config.inode_size as u64
    }

    pub(crate) fn load_inode(&self, index: u32) -> Result<Inode> {
        if !self.inode_bitmap.is_set(index) {
            return Err(FsError::NotFound);
        }
        let mut slot = vec![0u8; self.config.inode_size as usize];
        self.read_bytes(self.inode_slot_pos(index), &mut slot)?;
        Inode::decode(&slot)
    }

    pub(crate) fn store_inode(&mut self, index: u32, inode: &Inode) -> Result<()> {
        let slot = inode.encode(self.config.inode_size)?;
        self.write_bytes(self.inode_slot_pos(index), &slot)
    }

    pub(crate) fn alloc_inode(&mut self, kind: InodeKind) -> Result<(u32, Inode)> {
        let index = self.inode_bitmap.alloc()?;
        let inode = Inode::new(kind);
        self.store_inode(index, &inode)?;
        Ok((index, inode))
    }

    /// Releases the whole pointer tree (children before parents), then
    /// zeroes the slot, then clears the allocator bit.
    pub(crate) fn free_inode(&mut self, index: u32) -> Result<()> {
        let mut inode = self.load_inode(index)?;
        self.shrink_blocks(&mut inode, 0)?;
        self.write_bytes(
            self.inode_slot_pos(index),
            &vec![0u8; self.config.inode_size as usize],
        )?;
        self.inode_bitmap.free(index)
    }

    // ---- persisted metadata ----

    fn write_superblock(&self) -> Result<()> {
        let block = self.superblock.encode(self.config.block_size)?;
        self.write_device_block(0, &block)
    }

    fn bitmap_region(&self, which: BitmapKind) -> (u64, usize) {
        match which {
            BitmapKind::Inode => {
                (self.config.inode_bitmap_start(), self.config.num_inodes as usize)
            }
            BitmapKind::Data => (self.config.data_bitmap_start(), self.config.num_blocks as usize),
        }
    }

    fn write_bitmap(&self, which: BitmapKind) -> Result<()> {
        let (start_block, _) = self.bitmap_region(which);
        let bitmap = match which {
            BitmapKind::Inode => &self.inode_bitmap,
            BitmapKind::Data => &self.data_bitmap,
        };
        self.write_bytes(start_block * self.config.block_size as u64, bitmap.as_raw_bytes())
    }

    fn load_bitmap(&self, which: BitmapKind) -> Result<Bitmap> {
        let (start_block, bits) = self.bitmap_region(which);
        let mut bytes = vec![0u8; bits.div_ceil(8)];
        self.read_bytes(start_block * self.config.block_size as u64, &mut bytes)?;
        let resource = match which {
            BitmapKind::Inode => "inodes",
            BitmapKind::Data => "data blocks",
        };
        Ok(Bitmap::from_bytes(&bytes, bits, resource))
    }

    pub(crate) fn flush_metadata(&mut self) -> Result<()> {
        self.write_bitmap(BitmapKind::Inode)?;
        self.write_bitmap(BitmapKind::Data)?;
        self.write_superblock()?;
        self.device.flush()
    }

    fn stats(&self) -> FsStats {
        FsStats {
            total_blocks: self.config.num_blocks as u64,
            used_blocks: self.data_bitmap.count_set() as u64,
            total_inodes: self.config.num_inodes as u64,
            used_inodes: self.inode_bitmap.count_set() as u64,
        }
    }
}

#[derive(Clone, Copy)]
enum BitmapKind {
    Inode,
    Data,
}

/// A mounted (or freshly formatted) filesystem.
pub struct FileSystem {
    core: Arc<Mutex<FsCore>>,
}

impl FileSystem {
    /// Writes a fresh filesystem onto `device`: superblock, zeroed
    /// bitmaps and inode table, and the empty root directory at
    /// inode 1.
    pub fn format(device: Arc<dyn BlockDevice>, config: Config) -> Result<FileSystem> {
        config.validate()?;
        check_geometry(device.as_ref(), &config)?;
        let mut core = FsCore {
            superblock: SuperBlock::new(config),
            inode_bitmap: Bitmap::new(config.num_inodes as usize, "inodes"),
            data_bitmap: Bitmap::new(config.num_blocks as usize, "data blocks"),
            device,
            config,
            poison: None,
            closed: false,
        };

        // Metadata region starts from a known state even when the
        // device is a recycled buffer.
        let zero_block = vec![0u8; config.block_size as usize];
        for block in config.inode_bitmap_start()..config.data_start() {
            core.write_device_block(block, &zero_block)?;
        }

        let (root_index, _) = core.alloc_inode(InodeKind::Directory)?;
        if root_index != ROOT_INODE {
            return Err(FsError::Format(format!(
                "root inode must be {ROOT_INODE}, allocator produced {root_index}"
            )));
        }
        core.flush_metadata()?;
        info!(
            "formatted filesystem: {} data blocks of {}, {} inodes",
            config.num_blocks, config.block_size, config.num_inodes
        );
        Ok(FileSystem { core: Arc::new(Mutex::new(core)) })
    }

    /// Validates the superblock and loads the allocation state.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<FileSystem> {
        let mut block = vec![0u8; device.block_size()];
        device.read_block(0, &mut block)?;
        let superblock = SuperBlock::decode(&block)?;
        let config = superblock.config;
        config.validate()?;
        check_geometry(device.as_ref(), &config)?;

        let mut core = FsCore {
            inode_bitmap: Bitmap::new(0, "inodes"),
            data_bitmap: Bitmap::new(0, "data blocks"),
            device,
            config,
            superblock,
            poison: None,
            closed: false,
        };
        core.inode_bitmap = core.load_bitmap(BitmapKind::Inode)?;
        core.data_bitmap = core.load_bitmap(BitmapKind::Data)?;

        let root = core.load_inode(ROOT_INODE).map_err(|_| {
            FsError::Format("image has no root inode".into())
        })?;
        if !root.is_dir() {
            return Err(FsError::Format("root inode is not a directory".into()));
        }
        info!(
            "mounted filesystem: {}/{} data blocks used, {}/{} inodes used",
            core.data_bitmap.count_set(),
            config.num_blocks,
            core.inode_bitmap.count_set(),
            config.num_inodes
        );
        Ok(FileSystem { core: Arc::new(Mutex::new(core)) })
    }

    /// Handle on the root directory (inode 1).
    pub fn root(&self) -> Directory {
        Directory::from_parts(Arc::clone(&self.core), ROOT_INODE)
    }

    pub fn stats(&self) -> Result<FsStats> {
        with_core(&self.core, |core| Ok(core.stats()))
    }

    /// Persists bitmaps and superblock without ending the mount.
    pub fn flush(&self) -> Result<()> {
        with_core(&self.core, |core| core.flush_metadata())
    }

    /// Flushes all metadata and finalizes the device. Further
    /// operations on this handle (or any directory or file handle
    /// derived from it) fail.
    pub fn close(&self) -> Result<()> {
        with_core(&self.core, |core| {
            core.flush_metadata()?;
            core.device.close()?;
            core.closed = true;
            info!("filesystem closed");
            Ok(())
        })
    }

    /// The backing device, e.g. for remounting an in-memory image
    /// after `close`.
    pub fn device(&self) -> Arc<dyn BlockDevice> {
        Arc::clone(&self.core.lock().unwrap().device)
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn check_geometry(device: &dyn BlockDevice, config: &Config) -> Result<()> {
    if device.block_size() != config.block_size as usize {
        return Err(FsError::Format(format!(
            "device block size {} does not match configured {}",
            device.block_size(),
            config.block_size
        )));
    }
    if device.num_blocks() < config.total_blocks() {
        return Err(FsError::Format(format!(
            "device holds {}, layout needs {}",
            pretty_bytes(device.num_blocks() * config.block_size as u64),
            pretty_bytes(config.disk_size()),
        )));
    }
    Ok(())
}

// ---- convenience constructors, one per backend ----

pub fn format_in_memory(config: Config) -> Result<FileSystem> {
    config.validate()?;
    let device = MemBlockDevice::new(config.block_size as usize, config.total_blocks());
    FileSystem::format(Arc::new(device), config)
}

pub fn format_in_file<P: AsRef<Path>>(path: P, config: Config) -> Result<FileSystem> {
    config.validate()?;
    let device =
        FileBlockDevice::create(path, config.block_size as usize, config.total_blocks())?;
    FileSystem::format(Arc::new(device), config)
}

pub fn format_in_file_encrypted<P: AsRef<Path>>(
    path: P,
    config: Config,
    password: &[u8],
) -> Result<FileSystem> {
    config.validate()?;
    let device = EncryptedBlockDevice::create(
        path,
        config.block_size as usize,
        config.total_blocks(),
        password,
    )?;
    FileSystem::format(Arc::new(device), config)
}

/// Reopens a plain image, discovering the geometry from the raw
/// superblock prefix before the block device exists.
pub fn mount_in_file<P: AsRef<Path>>(path: P) -> Result<FileSystem> {
    let image = ImageFile::open(path.as_ref())?;
    if image.len() < SUPERBLOCK_ENCODED_LEN as u64 {
        return Err(FsError::Format("image too short for a superblock".into()));
    }
    let superblock = SuperBlock::decode(&image.bytes()[..SUPERBLOCK_ENCODED_LEN])?;
    let config = superblock.config;
    config.validate()?;
    if image.len() != config.disk_size() {
        return Err(FsError::Format(format!(
            "image is {}, geometry says {}",
            pretty_bytes(image.len()),
            pretty_bytes(config.disk_size()),
        )));
    }
    let device = FileBlockDevice::from_image(
        image,
        config.block_size as usize,
        config.total_blocks(),
    );
    FileSystem::mount(Arc::new(device))
}

pub fn mount_in_file_encrypted<P: AsRef<Path>>(path: P, password: &[u8]) -> Result<FileSystem> {
    let device = EncryptedBlockDevice::open(path, password)?;
    FileSystem::mount(Arc::new(device))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> Config {
        Config { block_size: 512, inode_size: 128, num_blocks: 128, num_inodes: 32 }
    }

    fn tmp_path(name: &str) -> PathBuf {
        let path = PathBuf::from(format!("/tmp/vaultfs_fs_{name}.img"));
        if path.exists() {
            std::fs::remove_file(&path).unwrap();
        }
        path
    }

    #[test]
    fn test_format_installs_empty_root() {
        let fs = format_in_memory(config()).unwrap();
        let stats = fs.stats().unwrap();
        assert_eq!(stats.used_inodes, 1); // the root
        assert_eq!(stats.used_blocks, 0); // empty body owns no blocks
        assert!(fs.root().listdir().unwrap().is_empty());
    }

    #[test]
    fn test_mount_round_trip_in_memory() {
        let fs = format_in_memory(config()).unwrap();
        fs.root().mkdir(b"a").unwrap();
        let device = fs.device();
        fs.close().unwrap();

        let fs = FileSystem::mount(device).unwrap();
        assert_eq!(fs.root().listdir().unwrap(), vec![b"a".to_vec()]);
        assert_eq!(fs.root().lookup(b"a").unwrap(), 2);
    }

    #[test]
    fn test_mount_rejects_blank_device() {
        let device = Arc::new(MemBlockDevice::new(512, 64));
        assert!(matches!(
            FileSystem::mount(device),
            Err(FsError::Format(_))
        ));
    }

    #[test]
    fn test_format_rejects_undersized_device() {
        let device = Arc::new(MemBlockDevice::new(512, 16));
        assert!(matches!(
            FileSystem::format(device, config()),
            Err(FsError::Format(_))
        ));
    }

    #[test]
    fn test_operations_after_close_fail() {
        let fs = format_in_memory(config()).unwrap();
        let root = fs.root();
        fs.close().unwrap();
        assert!(matches!(root.listdir(), Err(FsError::BadMode)));
        assert!(matches!(fs.stats(), Err(FsError::BadMode)));
    }

    #[test]
    fn test_file_backend_round_trip() {
        let path = tmp_path("roundtrip");
        {
            let fs = format_in_file(&path, config()).unwrap();
            fs.root().mkdir(b"docs").unwrap();
            fs.close().unwrap();
        }
        {
            let fs = mount_in_file(&path).unwrap();
            assert_eq!(fs.root().listdir().unwrap(), vec![b"docs".to_vec()]);
            fs.close().unwrap();
        }
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_second_mount_of_file_image_is_rejected() {
        let path = tmp_path("contend");
        let fs = format_in_file(&path, config()).unwrap();
        assert!(matches!(mount_in_file(&path), Err(FsError::AlreadyMounted)));
        fs.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_inode_slots_may_straddle_blocks() {
        // 96-byte slots in 512-byte blocks: slot 5 spans two blocks.
        let config =
            Config { block_size: 512, inode_size: 96, num_blocks: 64, num_inodes: 16 };
        let fs = format_in_memory(config).unwrap();
        let root = fs.root();
        for i in 0u8..8 {
            root.mkdir(&[b'd', b'0' + i]).unwrap();
        }
        let device = fs.device();
        fs.close().unwrap();

        let fs = FileSystem::mount(device).unwrap();
        assert_eq!(fs.root().listdir().unwrap().len(), 8);
        let sub = fs.root().opendir(b"d5").unwrap();
        assert!(sub.listdir().unwrap().is_empty());
    }

    #[test]
    fn test_stats_track_allocation() {
        let fs = format_in_memory(config()).unwrap();
        let root = fs.root();
        let mut file = root
            .open(b"f", crate::fs::file::OpenMode::CREATE | crate::fs::file::OpenMode::WRITE)
            .unwrap();
        file.write(&vec![0xAB; 512 * 3]).unwrap();
        file.close().unwrap();
        let stats = fs.stats().unwrap();
        assert_eq!(stats.used_blocks, 3 + 1); // file data plus the root body
        assert_eq!(stats.used_inodes, 2);

        root.unlink(b"f").unwrap();
        let stats = fs.stats().unwrap();
        assert_eq!(stats.used_blocks, 0);
        assert_eq!(stats.used_inodes, 1);
    }
}
