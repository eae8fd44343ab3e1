//! Allocation state for inodes and data blocks.

use bitvec::prelude::*;

use crate::error::{FsError, Result};

/// Index 0 of either bitmap is the zero-pointer sentinel; it is never
/// handed out and never freed.
const RESERVED: usize = 1;

/// Packed bit-vector allocator. A set bit means the index is owned by
/// exactly one live structure. Allocation is next-fit: the scan resumes
/// from a rotating hint so churn does not pile up at the low indices.
pub struct Bitmap {
    bits: BitVec<u8, Lsb0>,
    hint: usize,
    /// What this bitmap tracks, for error messages.
    resource: &'static str,
}

impl Bitmap {
    pub fn new(size: usize, resource: &'static str) -> Self {
        Bitmap {
            bits: bitvec![u8, Lsb0; 0; size],
            hint: RESERVED,
            resource,
        }
    }

    /// Restores a bitmap from its on-disk byte run.
    pub fn from_bytes(bytes: &[u8], size: usize, resource: &'static str) -> Self {
        let mut bits = BitVec::<u8, Lsb0>::from_slice(bytes);
        bits.truncate(size);
        debug_assert_eq!(bits.len(), size);
        Bitmap { bits, hint: RESERVED, resource }
    }

    /// The packed on-disk representation, `ceil(size / 8)` bytes.
    pub fn as_raw_bytes(&self) -> &[u8] {
        self.bits.as_raw_slice()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn is_set(&self, index: u32) -> bool {
        self.bits.get(index as usize).as_deref().copied().unwrap_or(false)
    }

    pub fn count_set(&self) -> usize {
        self.bits.count_ones()
    }

    /// Claims the first free index at or after the hint, wrapping once.
    /// Never returns the reserved index 0.
    pub fn alloc(&mut self) -> Result<u32> {
        if self.bits.len() <= RESERVED {
            return Err(FsError::NoSpace(self.resource));
        }
        let start = self.hint.clamp(RESERVED, self.bits.len());
        let found = self.bits[start..]
            .first_zero()
            .map(|i| start + i)
            .or_else(|| self.bits[RESERVED..start].first_zero().map(|i| RESERVED + i));
        match found {
            Some(index) => {
                self.bits.set(index, true);
                self.hint = index + 1;
                Ok(index as u32)
            }
            None => Err(FsError::NoSpace(self.resource)),
        }
    }

    /// Releases an index. Freeing index 0, an index beyond the end, or
    /// an index that is already free is a corruption signal.
    pub fn free(&mut self, index: u32) -> Result<()> {
        let index = index as usize;
        if index < RESERVED || index >= self.bits.len() {
            return Err(FsError::OutOfRange {
                block: index as u64,
                limit: self.bits.len() as u64,
            });
        }
        if !self.bits[index] {
            return Err(FsError::DoubleFree(index as u32));
        }
        self.bits.set(index, false);
        Ok(())
    }
}

impl std::fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("resource", &self.resource)
            .field("size", &self.bits.len())
            .field("set", &self.count_set())
            .field("hint", &self.hint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_skips_reserved_index() {
        let mut bitmap = Bitmap::new(16, "blocks");
        assert_eq!(bitmap.alloc().unwrap(), 1);
        assert_eq!(bitmap.alloc().unwrap(), 2);
        assert!(!bitmap.is_set(0));
    }

    #[test]
    fn test_rotating_hint_does_not_reuse_low_indices_first() {
        let mut bitmap = Bitmap::new(8, "blocks");
        for expected in 1..4 {
            assert_eq!(bitmap.alloc().unwrap(), expected);
        }
        bitmap.free(1).unwrap();
        // Next-fit keeps scanning upward before wrapping back to 1.
        assert_eq!(bitmap.alloc().unwrap(), 4);
        assert_eq!(bitmap.alloc().unwrap(), 5);
        assert_eq!(bitmap.alloc().unwrap(), 6);
        assert_eq!(bitmap.alloc().unwrap(), 7);
        assert_eq!(bitmap.alloc().unwrap(), 1);
    }

    #[test]
    fn test_exhaustion() {
        let mut bitmap = Bitmap::new(4, "inodes");
        for _ in 1..4 {
            bitmap.alloc().unwrap();
        }
        assert!(matches!(bitmap.alloc(), Err(FsError::NoSpace("inodes"))));
    }

    #[test]
    fn test_double_free() {
        let mut bitmap = Bitmap::new(8, "blocks");
        let index = bitmap.alloc().unwrap();
        bitmap.free(index).unwrap();
        assert!(matches!(bitmap.free(index), Err(FsError::DoubleFree(i)) if i == index));
    }

    #[test]
    fn test_free_of_reserved_or_out_of_range() {
        let mut bitmap = Bitmap::new(8, "blocks");
        assert!(matches!(bitmap.free(0), Err(FsError::OutOfRange { .. })));
        assert!(matches!(bitmap.free(8), Err(FsError::OutOfRange { .. })));
    }

    #[test]
    fn test_raw_bytes_round_trip() {
        let mut bitmap = Bitmap::new(19, "blocks");
        for _ in 0..5 {
            bitmap.alloc().unwrap();
        }
        bitmap.free(3).unwrap();
        let bytes = bitmap.as_raw_bytes().to_vec();
        let restored = Bitmap::from_bytes(&bytes, 19, "blocks");
        assert_eq!(restored.len(), 19);
        assert_eq!(restored.count_set(), bitmap.count_set());
        for i in 0..19 {
            assert_eq!(restored.is_set(i), bitmap.is_set(i));
        }
    }

    #[test]
    fn test_count_set() {
        let mut bitmap = Bitmap::new(64, "blocks");
        assert_eq!(bitmap.count_set(), 0);
        for _ in 0..10 {
            bitmap.alloc().unwrap();
        }
        assert_eq!(bitmap.count_set(), 10);
    }
}
