//! Directories: a regular inode whose body is a packed entry table
//! `(name_len:u16 | inode:u32 | name)`, plus the namespace operations
//! built on top of it.

use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{FsError, Result};
use crate::fs::file::{FileHandle, OpenMode};
use crate::fs::filesystem::{with_core, FsCore};
use crate::fs::inode::{Inode, InodeKind};

const ENTRY_HEADER_LEN: usize = 6;

/// One live directory entry. Tombstones (`inode == 0`) are dropped at
/// parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawDirEntry {
    pub name: Vec<u8>,
    pub ino: u32,
}

pub(crate) fn parse_dir_entries(body: &[u8]) -> Result<Vec<RawDirEntry>> {
    let mut entries = Vec::new();
    let mut offset = 0usize;
    while offset < body.len() {
        if offset + ENTRY_HEADER_LEN > body.len() {
            return Err(FsError::Format("truncated directory entry header".into()));
        }
        let name_len =
            u16::from_le_bytes(body[offset..offset + 2].try_into().unwrap()) as usize;
        let ino = u32::from_le_bytes(body[offset + 2..offset + 6].try_into().unwrap());
        let start = offset + ENTRY_HEADER_LEN;
        let end = start + name_len;
        if end > body.len() {
            return Err(FsError::Format("directory entry name runs past the body".into()));
        }
        if ino != 0 {
            entries.push(RawDirEntry { name: body[start..end].to_vec(), ino });
        }
        offset = end;
    }
    Ok(entries)
}

pub(crate) fn encode_dir_entry(name: &[u8], ino: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + name.len());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(&ino.to_le_bytes());
    out.extend_from_slice(name);
    out
}

/// Names are arbitrary byte strings minus the separator, the NUL byte
/// and the empty string.
pub(crate) fn validate_name(name: &[u8]) -> Result<()> {
    if name.is_empty() {
        return Err(FsError::InvalidName("empty name".into()));
    }
    if name.len() > u16::MAX as usize {
        return Err(FsError::InvalidName(format!("name of {} bytes", name.len())));
    }
    if name.contains(&b'/') || name.contains(&0) {
        return Err(FsError::InvalidName(
            String::from_utf8_lossy(name).into_owned(),
        ));
    }
    Ok(())
}

/// Directory internals live on the core so each public operation runs
/// under a single lock acquisition.
impl FsCore {
    fn load_dir_inode(&self, ino: u32) -> Result<Inode> {
        let inode = self.load_inode(ino)?;
        if !inode.is_dir() {
            return Err(FsError::NotDir);
        }
        Ok(inode)
    }

    pub(crate) fn dir_entries(&self, ino: u32) -> Result<Vec<RawDirEntry>> {
        let inode = self.load_dir_inode(ino)?;
        let body = self.read_at(&inode, 0, inode.size as usize)?;
        parse_dir_entries(&body)
    }

    pub(crate) fn dir_lookup(&self, ino: u32, name: &[u8]) -> Result<Option<u32>> {
        Ok(self
            .dir_entries(ino)?
            .into_iter()
            .find(|entry| entry.name == name)
            .map(|entry| entry.ino))
    }

    fn dir_add_entry(&mut self, dir_ino: u32, name: &[u8], child: u32) -> Result<()> {
        let mut inode = self.load_dir_inode(dir_ino)?;
        let entry = encode_dir_entry(name, child);
        let old_size = inode.size;
        if let Err(e) = self.write_at(&mut inode, old_size, &entry) {
            // An append that ran out of space mid-entry would leave a
            // torn record; cut the body back to the last whole entry.
            let _ = self.truncate_to(&mut inode, old_size);
            let _ = self.store_inode(dir_ino, &inode);
            return Err(e);
        }
        self.store_inode(dir_ino, &inode)
    }

    /// Removes one entry and compacts the body so no tombstone remains.
    fn dir_remove_entry(&mut self, dir_ino: u32, name: &[u8]) -> Result<u32> {
        let entries = self.dir_entries(dir_ino)?;
        let removed = entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or(FsError::NotFound)?
            .ino;
        let mut body = Vec::new();
        for entry in entries.iter().filter(|entry| entry.name != name) {
            body.extend_from_slice(&encode_dir_entry(&entry.name, entry.ino));
        }
        let mut inode = self.load_dir_inode(dir_ino)?;
        if !body.is_empty() {
            self.write_at(&mut inode, 0, &body)?;
        }
        self.truncate_to(&mut inode, body.len() as u64)?;
        self.store_inode(dir_ino, &inode)?;
        Ok(removed)
    }

    /// Depth-first walk testing whether `target` lives anywhere under
    /// the directory `root`.
    fn subtree_contains(&self, root: u32, target: u32) -> Result<bool> {
        let mut pending = vec![root];
        while let Some(dir) = pending.pop() {
            for entry in self.dir_entries(dir)? {
                if entry.ino == target {
                    return Ok(true);
                }
                if self.load_inode(entry.ino)?.is_dir() {
                    pending.push(entry.ino);
                }
            }
        }
        Ok(false)
    }
}

/// Handle on one directory inode. Holds an index, not state: every
/// operation re-reads the inode, so handles survive concurrent renames
/// and report `NotFound` once the directory is gone.
pub struct Directory {
    core: Arc<Mutex<FsCore>>,
    ino: u32,
}

impl Directory {
    pub(crate) fn from_parts(core: Arc<Mutex<FsCore>>, ino: u32) -> Self {
        Directory { core, ino }
    }

    pub fn inode_number(&self) -> u32 {
        self.ino
    }

    /// Entry names in stored order, tombstones skipped.
    pub fn listdir(&self) -> Result<Vec<Vec<u8>>> {
        let ino = self.ino;
        with_core(&self.core, |core| {
            Ok(core.dir_entries(ino)?.into_iter().map(|entry| entry.name).collect())
        })
    }

    pub fn lookup(&self, name: &[u8]) -> Result<u32> {
        validate_name(name)?;
        let ino = self.ino;
        with_core(&self.core, |core| core.dir_lookup(ino, name)?.ok_or(FsError::NotFound))
    }

    /// Descends into an existing child directory.
    pub fn opendir(&self, name: &[u8]) -> Result<Directory> {
        validate_name(name)?;
        let ino = self.ino;
        let child = with_core(&self.core, |core| {
            let child = core.dir_lookup(ino, name)?.ok_or(FsError::NotFound)?;
            if !core.load_inode(child)?.is_dir() {
                return Err(FsError::NotDir);
            }
            Ok(child)
        })?;
        Ok(Directory::from_parts(Arc::clone(&self.core), child))
    }

    /// Opens (or with `CREATE`, creates) a file under this directory.
    pub fn open(&self, name: &[u8], mode: OpenMode) -> Result<FileHandle> {
        validate_name(name)?;
        if !mode.intersects(OpenMode::READ | OpenMode::WRITE | OpenMode::APPEND) {
            return Err(FsError::BadMode);
        }
        let dir_ino = self.ino;
        let (ino, inode) = with_core(&self.core, |core| {
            let existing = core.dir_lookup(dir_ino, name)?;
            let (ino, mut inode) = match existing {
                Some(ino) => {
                    if mode.contains(OpenMode::CREATE | OpenMode::EXCLUSIVE) {
                        return Err(FsError::Exists);
                    }
                    let inode = core.load_inode(ino)?;
                    if inode.is_dir() {
                        return Err(FsError::IsDir);
                    }
                    (ino, inode)
                }
                None => {
                    if !mode.contains(OpenMode::CREATE) {
                        return Err(FsError::NotFound);
                    }
                    if !mode.intersects(OpenMode::WRITE | OpenMode::APPEND) {
                        return Err(FsError::BadMode);
                    }
                    let (ino, inode) = core.alloc_inode(InodeKind::File)?;
                    if let Err(e) = core.dir_add_entry(dir_ino, name, ino) {
                        // Do not leak the inode when the link fails.
                        let _ = core.free_inode(ino);
                        return Err(e);
                    }
                    debug!("created file inode {ino}");
                    (ino, inode)
                }
            };
            if mode.contains(OpenMode::TRUNCATE) {
                if !mode.intersects(OpenMode::WRITE | OpenMode::APPEND) {
                    return Err(FsError::BadMode);
                }
                core.truncate_to(&mut inode, 0)?;
                core.store_inode(ino, &inode)?;
            }
            Ok((ino, inode))
        })?;
        Ok(FileHandle::from_parts(Arc::clone(&self.core), ino, inode, mode))
    }

    /// Creates an empty child directory.
    pub fn mkdir(&self, name: &[u8]) -> Result<Directory> {
        validate_name(name)?;
        let dir_ino = self.ino;
        let child = with_core(&self.core, |core| {
            if core.dir_lookup(dir_ino, name)?.is_some() {
                return Err(FsError::Exists);
            }
            let (child, _) = core.alloc_inode(InodeKind::Directory)?;
            if let Err(e) = core.dir_add_entry(dir_ino, name, child) {
                let _ = core.free_inode(child);
                return Err(e);
            }
            debug!("created directory inode {child}");
            Ok(child)
        })?;
        Ok(Directory::from_parts(Arc::clone(&self.core), child))
    }

    /// Removes an empty child directory.
    pub fn rmdir(&self, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        let dir_ino = self.ino;
        with_core(&self.core, |core| {
            let child = core.dir_lookup(dir_ino, name)?.ok_or(FsError::NotFound)?;
            if !core.load_inode(child)?.is_dir() {
                return Err(FsError::NotDir);
            }
            if !core.dir_entries(child)?.is_empty() {
                return Err(FsError::NotEmpty);
            }
            core.dir_remove_entry(dir_ino, name)?;
            core.free_inode(child)
        })
    }

    /// Removes a child file and frees its inode and blocks.
    pub fn unlink(&self, name: &[u8]) -> Result<()> {
        validate_name(name)?;
        let dir_ino = self.ino;
        with_core(&self.core, |core| {
            let child = core.dir_lookup(dir_ino, name)?.ok_or(FsError::NotFound)?;
            if core.load_inode(child)?.is_dir() {
                return Err(FsError::IsDir);
            }
            core.dir_remove_entry(dir_ino, name)?;
            core.free_inode(child)
        })
    }

    /// Moves `old` from this directory to `new` under `dest`. All
    /// checks run before the first mutation, so observers see either
    /// the old state or the new one. Overwriting a file or an empty
    /// directory frees the victim; a populated directory is `NotEmpty`;
    /// moving a directory into its own subtree is `Loop`.
    pub fn rename(&self, old: &[u8], dest: &Directory, new: &[u8]) -> Result<()> {
        validate_name(old)?;
        validate_name(new)?;
        if !Arc::ptr_eq(&self.core, &dest.core) {
            return Err(FsError::BadMode);
        }
        let src_dir = self.ino;
        let dest_dir = dest.ino;
        with_core(&self.core, |core| {
            let moved = core.dir_lookup(src_dir, old)?.ok_or(FsError::NotFound)?;
            if src_dir == dest_dir && old == new {
                return Ok(());
            }
            let moved_is_dir = core.load_inode(moved)?.is_dir();

            let victim = core.dir_lookup(dest_dir, new)?;
            if let Some(victim) = victim {
                let victim_is_dir = core.load_inode(victim)?.is_dir();
                match (moved_is_dir, victim_is_dir) {
                    (false, true) => return Err(FsError::IsDir),
                    (true, false) => return Err(FsError::NotDir),
                    (true, true) if !core.dir_entries(victim)?.is_empty() => {
                        return Err(FsError::NotEmpty)
                    }
                    _ => {}
                }
            }
            if moved_is_dir && dest_dir != src_dir {
                if dest_dir == moved || core.subtree_contains(moved, dest_dir)? {
                    return Err(FsError::Loop);
                }
            }

            if let Some(victim) = victim {
                core.dir_remove_entry(dest_dir, new)?;
                core.free_inode(victim)?;
            }
            core.dir_add_entry(dest_dir, new, moved)?;
            if let Err(e) = core.dir_remove_entry(src_dir, old) {
                // Unlink from the destination again so no state shows
                // the entry twice.
                let _ = core.dir_remove_entry(dest_dir, new);
                return Err(e);
            }
            debug!("renamed inode {moved}");
            Ok(())
        })
    }
}
