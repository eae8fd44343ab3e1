//! vaultfs is a user-level virtual filesystem with a classic UNIX
//! on-disk layout, kept in a single image (in memory, in a host file,
//! or in an authenticated-encrypted host file).
//!
//! Image layout, in logical blocks:
//!
//! ```text
//! [ superblock                                    block 0          ]
//! [ inode bitmap   ceil(num_inodes/8) bytes, padded to blocks      ]
//! [ data bitmap    ceil(num_blocks/8) bytes, padded to blocks      ]
//! [ inode table    num_inodes * inode_size bytes, padded to blocks ]
//! [ data blocks    num_blocks * block_size bytes                   ]
//! ```
//!
//! Layers, bottom to top:
//! 1. [`BlockDevice`]: fixed-size block read/write over memory, a host
//!    file, or a ChaCha20 + HMAC-SHA-256 encrypted host file.
//! 2. Superblock, bitmaps and inode table: geometry and allocation.
//! 3. Indirect block tree and inode I/O: byte-addressable file bodies
//!    (12 direct pointers, then single/double/triple indirect).
//! 4. [`Directory`] and [`FileHandle`]: the namespace operations.
//! 5. [`FileSystem`]: format/mount lifecycle, root access, space stats.
//!
//! ```no_run
//! use vaultfs::{format_in_memory, Config, OpenMode};
//!
//! # fn main() -> vaultfs::Result<()> {
//! let fs = format_in_memory(Config {
//!     block_size: 4096,
//!     inode_size: 128,
//!     num_blocks: 1024,
//!     num_inodes: 1024,
//! })?;
//! let root = fs.root();
//! let docs = root.mkdir(b"docs")?;
//! let mut file = docs.open(b"notes.txt", OpenMode::CREATE | OpenMode::WRITE)?;
//! file.write(b"hello")?;
//! file.close()?;
//! fs.close()?;
//! # Ok(())
//! # }
//! ```
//!
//! Single-threaded cooperative model: one process owns a mount, and
//! operations interleave only at call boundaries. Durability needs a
//! clean [`FileSystem::close`]; there is no journaling.

pub mod config;
pub mod device;
pub mod error;
pub mod fs;

pub use config::Config;
pub use device::{BlockDevice, EncryptedBlockDevice, FileBlockDevice, MemBlockDevice};
pub use error::{FsError, Result};
pub use fs::directory::Directory;
pub use fs::file::{FileHandle, OpenMode};
pub use fs::filesystem::{
    format_in_file, format_in_file_encrypted, format_in_memory, mount_in_file,
    mount_in_file_encrypted, FileSystem, FsStats,
};
pub use fs::inode::{Inode, InodeKind};
pub use fs::superblock::{SuperBlock, FS_MAGIC, FS_VERSION};
pub use fs::ROOT_INODE;
