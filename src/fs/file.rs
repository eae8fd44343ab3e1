//! Byte cursor over one file inode.

use std::io::SeekFrom;
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use crate::error::{FsError, Result};
use crate::fs::filesystem::{with_core, FsCore};
use crate::fs::inode::Inode;

bitflags! {
    /// Open-mode flags, combined with `|`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenMode: u8 {
        const READ      = 1 << 0;
        /// Write at the cursor.
        const WRITE     = 1 << 1;
        /// Create the file when missing (needs WRITE or APPEND).
        const CREATE    = 1 << 2;
        /// Drop existing contents on open.
        const TRUNCATE  = 1 << 3;
        /// Every write lands at end of file, wherever the cursor is.
        const APPEND    = 1 << 4;
        /// With CREATE: fail instead of reusing an existing file.
        const EXCLUSIVE = 1 << 5;
    }
}

/// An open file. The inode record is cached in the handle and written
/// back on `flush`/`close`; two handles on the same inode are legal but
/// unsynchronized, so the last one flushed wins.
pub struct FileHandle {
    core: Arc<Mutex<FsCore>>,
    ino: u32,
    inode: Inode,
    pos: u64,
    mode: OpenMode,
    closed: bool,
}

impl FileHandle {
    pub(crate) fn from_parts(
        core: Arc<Mutex<FsCore>>,
        ino: u32,
        inode: Inode,
        mode: OpenMode,
    ) -> Self {
        let pos = if mode.contains(OpenMode::APPEND) { inode.size } else { 0 };
        FileHandle { core, ino, inode, pos, mode, closed: false }
    }

    pub fn inode_number(&self) -> u32 {
        self.ino
    }

    /// Current size as this handle sees it (unflushed writes included).
    pub fn size(&self) -> u64 {
        self.inode.size
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(FsError::BadMode);
        }
        Ok(())
    }

    fn check_readable(&self) -> Result<()> {
        self.check_open()?;
        if !self.mode.contains(OpenMode::READ) {
            return Err(FsError::BadMode);
        }
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if !self.mode.intersects(OpenMode::WRITE | OpenMode::APPEND) {
            return Err(FsError::BadMode);
        }
        Ok(())
    }

    /// Reads up to `n` bytes from the cursor, fewer only at end of
    /// file. Holes read as zeroes.
    pub fn read(&mut self, n: usize) -> Result<Vec<u8>> {
        self.check_readable()?;
        let core = Arc::clone(&self.core);
        let data = with_core(&core, |core| core.read_at(&self.inode, self.pos, n))?;
        self.pos += data.len() as u64;
        self.inode.touch_atime();
        Ok(data)
    }

    /// Reads from the cursor to end of file.
    pub fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let remaining = self.inode.size.saturating_sub(self.pos) as usize;
        self.read(remaining)
    }

    /// Writes the whole buffer at the cursor (or at end of file under
    /// APPEND), growing the file as needed.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.check_writable()?;
        if self.mode.contains(OpenMode::APPEND) {
            self.pos = self.inode.size;
        }
        let core = Arc::clone(&self.core);
        let pos = self.pos;
        let written = with_core(&core, |core| core.write_at(&mut self.inode, pos, data))?;
        self.pos += written as u64;
        Ok(written)
    }

    /// Moves the cursor; seeking past end of file is allowed and the
    /// hole materializes on the next write.
    pub fn seek(&mut self, target: SeekFrom) -> Result<u64> {
        self.check_open()?;
        let next = match target {
            SeekFrom::Start(offset) => i128::from(offset),
            SeekFrom::Current(delta) => i128::from(self.pos) + i128::from(delta),
            SeekFrom::End(delta) => i128::from(self.inode.size) + i128::from(delta),
        };
        if next < 0 || next > i128::from(u64::MAX) {
            return Err(FsError::BadOffset(next.clamp(i64::MIN as i128, i64::MAX as i128) as i64));
        }
        self.pos = next as u64;
        Ok(self.pos)
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Shrinks or grows the file; shrinking frees unreachable blocks,
    /// growing exposes zeroes. A cursor past the new end is pulled back.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.check_writable()?;
        let core = Arc::clone(&self.core);
        with_core(&core, |core| {
            core.truncate_to(&mut self.inode, new_size)?;
            core.store_inode(self.ino, &self.inode)
        })?;
        if self.pos > self.inode.size {
            self.pos = self.inode.size;
        }
        Ok(())
    }

    /// Persists the cached inode and pushes device buffers down.
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        let core = Arc::clone(&self.core);
        with_core(&core, |core| {
            core.store_inode(self.ino, &self.inode)?;
            core.device.flush()
        })
    }

    /// Persists and invalidates the handle. Also run on drop.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let core = Arc::clone(&self.core);
        let result = with_core(&core, |core| core.store_inode(self.ino, &self.inode));
        self.closed = true;
        result
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fs::filesystem::{format_in_memory, FileSystem};

    fn fs() -> FileSystem {
        format_in_memory(Config {
            block_size: 512,
            inode_size: 128,
            num_blocks: 512,
            num_inodes: 32,
        })
        .unwrap()
    }

    #[test]
    fn test_write_then_read_back() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        let payload = vec![0xAB; 10_000];
        assert_eq!(file.write(&payload).unwrap(), 10_000);
        assert_eq!(file.size(), 10_000);
        file.close().unwrap();

        let mut file = root.open(b"f", OpenMode::READ).unwrap();
        assert_eq!(file.read(20_000).unwrap(), payload);
        assert_eq!(file.read(1).unwrap(), b"");
    }

    #[test]
    fn test_mode_gating() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.write(b"data").unwrap();
        assert!(matches!(file.read(4), Err(FsError::BadMode)));
        file.close().unwrap();

        let mut file = root.open(b"f", OpenMode::READ).unwrap();
        assert!(matches!(file.write(b"x"), Err(FsError::BadMode)));
        assert!(matches!(file.truncate(0), Err(FsError::BadMode)));
        file.close().unwrap();

        assert!(matches!(root.open(b"f", OpenMode::empty()), Err(FsError::BadMode)));
        assert!(matches!(
            root.open(b"new", OpenMode::CREATE | OpenMode::READ),
            Err(FsError::BadMode)
        ));
    }

    #[test]
    fn test_use_after_close() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.close().unwrap();
        assert!(matches!(file.write(b"x"), Err(FsError::BadMode)));
        assert!(file.close().is_ok()); // close stays idempotent
    }

    #[test]
    fn test_seek_write_creates_hole() {
        let fs = fs();
        let root = fs.root();
        let mut file =
            root.open(b"f", OpenMode::CREATE | OpenMode::READ | OpenMode::WRITE).unwrap();
        file.seek(SeekFrom::Start(2000)).unwrap();
        file.write(b"x").unwrap();
        assert_eq!(file.size(), 2001);
        file.seek(SeekFrom::Start(0)).unwrap();
        let data = file.read(2001).unwrap();
        assert_eq!(data.len(), 2001);
        assert!(data[..2000].iter().all(|b| *b == 0));
        assert_eq!(data[2000], b'x');
    }

    #[test]
    fn test_seek_whences_and_negative_target() {
        let fs = fs();
        let root = fs.root();
        let mut file =
            root.open(b"f", OpenMode::CREATE | OpenMode::READ | OpenMode::WRITE).unwrap();
        file.write(b"0123456789").unwrap();
        assert_eq!(file.seek(SeekFrom::End(-4)).unwrap(), 6);
        assert_eq!(file.read(10).unwrap(), b"6789");
        assert_eq!(file.seek(SeekFrom::Current(-2)).unwrap(), 8);
        assert_eq!(file.tell(), 8);
        assert!(matches!(file.seek(SeekFrom::End(-11)), Err(FsError::BadOffset(_))));
    }

    #[test]
    fn test_append_ignores_cursor() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"log", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.write(b"first").unwrap();
        file.close().unwrap();

        let mut file = root.open(b"log", OpenMode::APPEND).unwrap();
        assert_eq!(file.tell(), 5);
        file.seek(SeekFrom::Start(0)).unwrap();
        file.write(b"+second").unwrap();
        file.close().unwrap();

        let mut file = root.open(b"log", OpenMode::READ).unwrap();
        assert_eq!(file.read(64).unwrap(), b"first+second");
    }

    #[test]
    fn test_truncate_shrink_and_grow() {
        let fs = fs();
        let root = fs.root();
        let mut file =
            root.open(b"f", OpenMode::CREATE | OpenMode::READ | OpenMode::WRITE).unwrap();
        file.write(&vec![7u8; 1500]).unwrap();
        file.truncate(100).unwrap();
        assert_eq!(file.size(), 100);
        assert_eq!(file.tell(), 100); // cursor pulled back from 1500
        file.truncate(100).unwrap(); // idempotent
        assert_eq!(file.size(), 100);

        file.truncate(300).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let data = file.read(400).unwrap();
        assert_eq!(data.len(), 300);
        assert!(data[..100].iter().all(|b| *b == 7));
        assert!(data[100..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_truncate_frees_blocks() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.write(&vec![1u8; 512 * 20]).unwrap();
        file.flush().unwrap();
        let used_before = fs.stats().unwrap().used_blocks;
        file.truncate(512).unwrap();
        file.flush().unwrap();
        let used_after = fs.stats().unwrap().used_blocks;
        assert!(used_after < used_before);
        assert_eq!(used_after, 1 + 1); // one data block plus the root body
    }

    #[test]
    fn test_exclusive_create() {
        let fs = fs();
        let root = fs.root();
        let mut file = root
            .open(b"f", OpenMode::CREATE | OpenMode::EXCLUSIVE | OpenMode::WRITE)
            .unwrap();
        file.close().unwrap();
        assert!(matches!(
            root.open(b"f", OpenMode::CREATE | OpenMode::EXCLUSIVE | OpenMode::WRITE),
            Err(FsError::Exists)
        ));
        // CREATE without EXCLUSIVE reuses the file.
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.close().unwrap();
    }

    #[test]
    fn test_truncate_on_open() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        file.write(&vec![9u8; 4096]).unwrap();
        file.close().unwrap();

        let mut file = root
            .open(b"f", OpenMode::WRITE | OpenMode::TRUNCATE)
            .unwrap();
        assert_eq!(file.size(), 0);
        file.close().unwrap();
        assert_eq!(fs.stats().unwrap().used_blocks, 1); // only the root body
    }

    #[test]
    fn test_two_handles_last_flush_wins() {
        let fs = fs();
        let root = fs.root();
        let mut first = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        first.write(b"aaaa").unwrap();
        first.flush().unwrap();

        let mut second = root.open(b"f", OpenMode::READ | OpenMode::WRITE).unwrap();
        second.write(b"bb").unwrap();
        first.close().unwrap();
        second.close().unwrap();

        let mut reader = root.open(b"f", OpenMode::READ).unwrap();
        assert_eq!(reader.read(16).unwrap(), b"bbaa");
    }

    #[test]
    fn test_mtime_moves_forward_on_write() {
        let fs = fs();
        let root = fs.root();
        let mut file = root.open(b"f", OpenMode::CREATE | OpenMode::WRITE).unwrap();
        let created = file.inode.mtime;
        file.write(b"x").unwrap();
        assert!(file.inode.mtime >= created);
    }
}
