//! Authenticated-encryption backend: the plain on-file layout, XORed
//! with a per-block ChaCha20 keystream and guarded by a whole-disk
//! HMAC, behind a fixed 152-byte header.
//!
//! Header layout (fixed-width little-endian):
//!
//! ```text
//! magic:8 | version:u16 | kdf_id:u16 | kdf_params:32 |
//! salt:16 | base_nonce:12 | wrapped_key:48 | whole_disk_mac:32
//! ```
//!
//! Open order matters: the wrapped-key tag authenticates the password
//! before anything else is interpreted, and the whole-disk MAC is
//! verified before any block is served.

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::device::crypto::{
    apply_block_keystream, compute_disk_mac, derive_password_keys, disk_mac_key,
    unwrap_file_key, verify_disk_mac, wrap_file_key, KdfParams, KDF_ID_ARGON2ID,
};
use crate::device::{check_block_io, BlockDevice, ImageFile};
use crate::error::{FsError, Result};
use crate::fs::superblock::SuperBlock;

pub(crate) const HEADER_LEN: usize = 152;
const HEADER_MAGIC: [u8; 8] = *b"VFSCRYPT";
const HEADER_VERSION: u16 = 1;

const OFF_VERSION: usize = 8;
const OFF_KDF_ID: usize = 10;
const OFF_KDF_PARAMS: usize = 12;
const OFF_SALT: usize = 44;
const OFF_BASE_NONCE: usize = 60;
const OFF_WRAPPED_KEY: usize = 72;
const OFF_DISK_MAC: usize = 120;

struct EncInner {
    image: ImageFile,
    /// Ciphertext changed since the authenticator was last written.
    dirty: bool,
}

pub struct EncryptedBlockDevice {
    inner: Mutex<EncInner>,
    block_size: usize,
    num_blocks: u64,
    file_key: [u8; 32],
    mac_key: [u8; 32],
    base_nonce: [u8; 12],
}

impl EncryptedBlockDevice {
    /// Creates a fresh encrypted image: random file key, salt and base
    /// nonce, password stretched with Argon2id, header written with a
    /// zero authenticator (finalized on `close`).
    pub fn create<P: AsRef<Path>>(
        path: P,
        block_size: usize,
        num_blocks: u64,
        password: &[u8],
    ) -> Result<Self> {
        let mut file_key = [0u8; 32];
        let mut salt = [0u8; 16];
        let mut base_nonce = [0u8; 12];
        OsRng.fill_bytes(&mut file_key);
        OsRng.fill_bytes(&mut salt);
        OsRng.fill_bytes(&mut base_nonce);

        let params = KdfParams::recommended();
        let keys = derive_password_keys(password, &salt, &params)?;
        let wrapped = wrap_file_key(&file_key, &keys, &salt, &base_nonce);

        let mut header = [0u8; HEADER_LEN];
        header[..8].copy_from_slice(&HEADER_MAGIC);
        header[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        header[OFF_KDF_ID..OFF_KDF_ID + 2].copy_from_slice(&KDF_ID_ARGON2ID.to_le_bytes());
        header[OFF_KDF_PARAMS..OFF_KDF_PARAMS + 32].copy_from_slice(&params.encode());
        header[OFF_SALT..OFF_SALT + 16].copy_from_slice(&salt);
        header[OFF_BASE_NONCE..OFF_BASE_NONCE + 12].copy_from_slice(&base_nonce);
        header[OFF_WRAPPED_KEY..OFF_WRAPPED_KEY + 48].copy_from_slice(&wrapped);

        let len = HEADER_LEN as u64 + block_size as u64 * num_blocks;
        let mut image = ImageFile::create(path.as_ref(), len)?;
        image.bytes_mut()[..HEADER_LEN].copy_from_slice(&header);

        info!(
            "created encrypted image {} ({num_blocks} blocks of {block_size})",
            path.as_ref().display()
        );
        Ok(EncryptedBlockDevice {
            inner: Mutex::new(EncInner { image, dirty: true }),
            block_size,
            num_blocks,
            mac_key: disk_mac_key(&file_key),
            file_key,
            base_nonce,
        })
    }

    /// Opens an existing encrypted image. Geometry comes from the
    /// superblock, decrypted in place once the password has been
    /// authenticated against the wrapped-key tag.
    pub fn open<P: AsRef<Path>>(path: P, password: &[u8]) -> Result<Self> {
        let image = ImageFile::open(path.as_ref())?;
        if image.len() < HEADER_LEN as u64 {
            return Err(FsError::Format("image shorter than the encrypted header".into()));
        }
        let header: [u8; HEADER_LEN] = image.bytes()[..HEADER_LEN].try_into().unwrap();
        if header[..8] != HEADER_MAGIC {
            return Err(FsError::Format("bad magic, not an encrypted vaultfs image".into()));
        }
        let version = u16::from_le_bytes(header[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
        if version != HEADER_VERSION {
            return Err(FsError::Version(version));
        }
        let kdf_id = u16::from_le_bytes(header[OFF_KDF_ID..OFF_KDF_ID + 2].try_into().unwrap());
        if kdf_id != KDF_ID_ARGON2ID {
            return Err(FsError::Format(format!("unknown KDF id {kdf_id}")));
        }
        let params = KdfParams::decode(&header[OFF_KDF_PARAMS..OFF_KDF_PARAMS + 32].try_into().unwrap());
        let salt: [u8; 16] = header[OFF_SALT..OFF_SALT + 16].try_into().unwrap();
        let base_nonce: [u8; 12] = header[OFF_BASE_NONCE..OFF_BASE_NONCE + 12].try_into().unwrap();
        let wrapped: [u8; 48] = header[OFF_WRAPPED_KEY..OFF_WRAPPED_KEY + 48].try_into().unwrap();
        let stored_mac: [u8; 32] = header[OFF_DISK_MAC..OFF_DISK_MAC + 32].try_into().unwrap();

        let keys = derive_password_keys(password, &salt, &params)?;
        let file_key = unwrap_file_key(&wrapped, &keys, &salt, &base_nonce)?;

        // Peek at the superblock (logical block 0 starts right after the
        // header) to learn the geometry before touching anything else.
        let sb_len = crate::fs::superblock::SUPERBLOCK_ENCODED_LEN;
        if image.len() < (HEADER_LEN + sb_len) as u64 {
            return Err(FsError::Format("image too short for a superblock".into()));
        }
        let mut sb_bytes = image.bytes()[HEADER_LEN..HEADER_LEN + sb_len].to_vec();
        apply_block_keystream(&file_key, &base_nonce, 0, &mut sb_bytes);
        let superblock = SuperBlock::decode(&sb_bytes)?;
        let config = superblock.config;
        config.validate()?;
        let expected_len = HEADER_LEN as u64 + config.disk_size();
        if image.len() != expected_len {
            return Err(FsError::Format(format!(
                "image is {} bytes, geometry says {}",
                image.len(),
                expected_len
            )));
        }

        // Whole-disk integrity before any block is served.
        let mac_key = disk_mac_key(&file_key);
        if !verify_disk_mac(&mac_key, &image.bytes()[HEADER_LEN..], &stored_mac) {
            return Err(FsError::Integrity);
        }

        debug!("encrypted image {} authenticated", path.as_ref().display());
        Ok(EncryptedBlockDevice {
            inner: Mutex::new(EncInner { image, dirty: false }),
            block_size: config.block_size as usize,
            num_blocks: config.total_blocks(),
            file_key,
            mac_key,
            base_nonce,
        })
    }

    fn range(&self, block: u64) -> std::ops::Range<usize> {
        let start = HEADER_LEN + block as usize * self.block_size;
        start..start + self.block_size
    }
}

impl BlockDevice for EncryptedBlockDevice {
    fn num_blocks(&self) -> u64 {
        self.num_blocks
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let inner = self.inner.lock().unwrap();
        buf.copy_from_slice(&inner.image.bytes()[self.range(block)]);
        apply_block_keystream(&self.file_key, &self.base_nonce, block, buf);
        Ok(())
    }

    fn write_block(&self, block: u64, buf: &[u8]) -> Result<()> {
        check_block_io(self.num_blocks, self.block_size, block, buf.len())?;
        let mut ciphertext = buf.to_vec();
        apply_block_keystream(&self.file_key, &self.base_nonce, block, &mut ciphertext);
        let mut inner = self.inner.lock().unwrap();
        let range = self.range(block);
        inner.image.bytes_mut()[range].copy_from_slice(&ciphertext);
        inner.dirty = true;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.inner.lock().unwrap().image.flush()
    }

    /// Refreshes the whole-disk authenticator over the current
    /// ciphertexts, then flushes. The image is only openable again
    /// after a close that ran to completion.
    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dirty {
            let mac = compute_disk_mac(&self.mac_key, &inner.image.bytes()[HEADER_LEN..]);
            inner.image.bytes_mut()[OFF_DISK_MAC..OFF_DISK_MAC + 32].copy_from_slice(&mac);
            inner.dirty = false;
        }
        inner.image.flush()
    }
}

impl Drop for EncryptedBlockDevice {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
