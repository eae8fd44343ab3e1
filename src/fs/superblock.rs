//! Block 0: format identity plus the geometry everything else derives from.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{FsError, Result};

pub const FS_MAGIC: [u8; 8] = *b"VAULTFS\0";
pub const FS_VERSION: u16 = 1;

/// Encoded size under `bincode::config::legacy()`:
/// `magic:8 | version:u16 | config:4*u32 | digest:32`.
pub(crate) const SUPERBLOCK_ENCODED_LEN: usize = 58;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SuperBlock {
    pub magic: [u8; 8],
    pub version: u16,
    pub config: Config,
    /// blake3 over the record with this field zeroed.
    pub digest: [u8; 32],
}

impl SuperBlock {
    pub fn new(config: Config) -> Self {
        let mut superblock = SuperBlock {
            magic: FS_MAGIC,
            version: FS_VERSION,
            config,
            digest: [0u8; 32],
        };
        superblock.digest = superblock.compute_digest();
        superblock
    }

    fn compute_digest(&self) -> [u8; 32] {
        let mut clean = self.clone();
        clean.digest = [0u8; 32];
        let bytes = bincode::serde::encode_to_vec(&clean, bincode::config::legacy())
            .expect("superblock digest");
        *blake3::hash(&bytes).as_bytes()
    }

    pub fn verify_digest(&self) -> bool {
        self.digest == self.compute_digest()
    }

    /// Serializes into a whole zero-padded block.
    pub fn encode(&self, block_size: u32) -> Result<Vec<u8>> {
        let mut bytes = bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| FsError::Format(format!("superblock encode: {e}")))?;
        debug_assert_eq!(bytes.len(), SUPERBLOCK_ENCODED_LEN);
        bytes.resize(block_size as usize, 0);
        Ok(bytes)
    }

    /// Decodes and fully validates identity: magic, version, digest.
    /// Geometry is validated by the caller against the device.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (superblock, _): (SuperBlock, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
                .map_err(|e| FsError::Format(format!("superblock decode: {e}")))?;
        if superblock.magic != FS_MAGIC {
            return Err(FsError::Format("bad magic, not a vaultfs image".into()));
        }
        if superblock.version != FS_VERSION {
            return Err(FsError::Version(superblock.version));
        }
        if !superblock.verify_digest() {
            return Err(FsError::Format("superblock digest mismatch".into()));
        }
        Ok(superblock)
    }
}
