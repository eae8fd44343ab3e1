//! The on-disk inode record.

use serde::{Deserialize, Serialize};

use crate::error::{FsError, Result};
use crate::fs::{unix_now, NUM_DIRECT_PTRS};

/// Encoded size of [`Inode`] under `bincode::config::legacy()`:
/// `mode:u16 | flags:u16 | size:u64 | ctime:u64 | mtime:u64 | atime:u64 |
/// direct:[u32;12] | indirect:u32 | double_indirect:u32 | triple_indirect:u32`.
pub const INODE_RECORD_SIZE: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeKind {
    File,
    Directory,
}

const MODE_FILE: u16 = 1;
const MODE_DIRECTORY: u16 = 2;

/// Metadata record for one file or directory. Fixed-width little-endian
/// on disk, zero-padded to the configured `inode_size`. Unused pointer
/// slots hold the zero sentinel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub mode: u16,
    /// Reserved, always zero.
    pub flags: u16,
    /// Bytes, rounded up to the highest written byte.
    pub size: u64,
    pub ctime: u64,
    pub mtime: u64,
    pub atime: u64,
    pub direct: [u32; NUM_DIRECT_PTRS],
    pub indirect: u32,
    pub double_indirect: u32,
    pub triple_indirect: u32,
}

impl Inode {
    pub fn new(kind: InodeKind) -> Self {
        let now = unix_now();
        Inode {
            mode: match kind {
                InodeKind::File => MODE_FILE,
                InodeKind::Directory => MODE_DIRECTORY,
            },
            flags: 0,
            size: 0,
            ctime: now,
            mtime: now,
            atime: now,
            direct: [0; NUM_DIRECT_PTRS],
            indirect: 0,
            double_indirect: 0,
            triple_indirect: 0,
        }
    }

    pub fn kind(&self) -> Result<InodeKind> {
        match self.mode {
            MODE_FILE => Ok(InodeKind::File),
            MODE_DIRECTORY => Ok(InodeKind::Directory),
            other => Err(FsError::Format(format!("bad inode mode {other}"))),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode == MODE_DIRECTORY
    }

    pub fn is_file(&self) -> bool {
        self.mode == MODE_FILE
    }

    /// Hard links are out of scope, so every live inode has exactly one.
    pub fn nlink(&self) -> u32 {
        1
    }

    /// Writes must never move `mtime` backwards, even when the wall
    /// clock does.
    pub fn touch_mtime(&mut self) {
        self.mtime = self.mtime.max(unix_now());
    }

    pub fn touch_atime(&mut self) {
        self.atime = self.atime.max(unix_now());
    }
}

/// Serialization into and out of an inode-table slot.
impl Inode {
    pub fn encode(&self, inode_size: u32) -> Result<Vec<u8>> {
        let mut bytes = bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| FsError::Format(format!("inode encode: {e}")))?;
        debug_assert_eq!(bytes.len(), INODE_RECORD_SIZE);
        bytes.resize(inode_size as usize, 0);
        Ok(bytes)
    }

    pub fn decode(slot: &[u8]) -> Result<Self> {
        let (inode, _) = bincode::serde::decode_from_slice(slot, bincode::config::legacy())
            .map_err(|e| FsError::Format(format!("inode decode: {e}")))?;
        Ok(inode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_is_fixed() {
        let inode = Inode::new(InodeKind::File);
        let bytes = bincode::serde::encode_to_vec(&inode, bincode::config::legacy()).unwrap();
        assert_eq!(bytes.len(), INODE_RECORD_SIZE);
    }

    #[test]
    fn test_encode_pads_to_slot_size() {
        let inode = Inode::new(InodeKind::Directory);
        let slot = inode.encode(128).unwrap();
        assert_eq!(slot.len(), 128);
        assert!(slot[INODE_RECORD_SIZE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_round_trip() {
        let mut inode = Inode::new(InodeKind::File);
        inode.size = 10_000;
        inode.direct[0] = 7;
        inode.direct[11] = 99;
        inode.triple_indirect = 123_456;
        let slot = inode.encode(256).unwrap();
        let back = Inode::decode(&slot).unwrap();
        assert_eq!(back, inode);
    }

    #[test]
    fn test_mtime_is_monotonic() {
        let mut inode = Inode::new(InodeKind::File);
        inode.mtime = u64::MAX - 1;
        inode.touch_mtime();
        assert_eq!(inode.mtime, u64::MAX - 1);
    }

    #[test]
    fn test_kind_rejects_garbage() {
        let mut inode = Inode::new(InodeKind::File);
        inode.mode = 9;
        assert!(matches!(inode.kind(), Err(FsError::Format(_))));
    }
}
