//! ASID and VMID allocation
//!
//! Identifiers are handed out from a bitmap, lowest free first. 0 is never
//! allocated: ASID 0 tags the kernel's own mappings and VMID 0 is what
//! stage 1 commands carry when no stage 2 is in use.
//!
//! Controllers differ in identifier width (8 or 16 bits), so allocation takes
//! the width of the controller that first needs the identifier; attaching the
//! owner to a narrower controller later is checked by the caller.

use alloc::vec;
use alloc::vec::Vec;

use spin::Mutex;

/// Widest identifier
pub const MAX_ID_BITS: u32 = 16;

/// Allocator of one identifier space.
pub struct IdAllocator {
    bitmap: Mutex<Vec<u64>>,
    bits: u32,
}

impl IdAllocator {
    /// Create an allocator for `bits`-wide identifiers.
    #[must_use]
    pub fn new(bits: u32) -> Self {
        let bits = bits.min(MAX_ID_BITS);
        let words = (1usize << bits).div_ceil(64);
        let mut bitmap = vec![0u64; words];
        bitmap[0] = 1;
        Self {
            bitmap: Mutex::new(bitmap),
            bits,
        }
    }

    /// Allocate the lowest free identifier below `2^limit_bits`.
    pub fn alloc(&self, limit_bits: u32) -> Option<u16> {
        let limit = 1usize << limit_bits.min(self.bits);
        let mut bitmap = self.bitmap.lock();
        for (i, word) in bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }
            let bit = (!*word).trailing_zeros() as usize;
            let id = i * 64 + bit;
            if id >= limit {
                return None;
            }
            *word |= 1 << bit;
            return u16::try_from(id).ok();
        }
        None
    }

    /// Return `id` to the pool.
    pub fn free(&self, id: u16) {
        if id == 0 {
            log::warn!("ids: attempt to free reserved identifier 0");
            return;
        }
        let (word, bit) = (usize::from(id) / 64, usize::from(id) % 64);
        let mut bitmap = self.bitmap.lock();
        match bitmap.get_mut(word) {
            Some(w) if *w & (1 << bit) != 0 => *w &= !(1 << bit),
            _ => log::warn!("ids: double free of identifier {id}"),
        }
    }

    #[must_use]
    pub fn is_allocated(&self, id: u16) -> bool {
        let (word, bit) = (usize::from(id) / 64, usize::from(id) % 64);
        self.bitmap
            .lock()
            .get(word)
            .is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Identifiers currently handed out.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let ones: u32 = self.bitmap.lock().iter().map(|w| w.count_ones()).sum();
        ones as usize - 1
    }
}

impl core::fmt::Debug for IdAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IdAllocator")
            .field("bits", &self.bits)
            .field("in_use", &self.in_use())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_reserved() {
        let ids = IdAllocator::new(8);
        assert_eq!(ids.alloc(8), Some(1));
        assert_eq!(ids.alloc(8), Some(2));
        assert!(ids.is_allocated(0));
        assert_eq!(ids.in_use(), 2);
    }

    #[test]
    fn test_lowest_free_reused() {
        let ids = IdAllocator::new(16);
        let a = ids.alloc(16).unwrap();
        let b = ids.alloc(16).unwrap();
        ids.free(a);
        assert!(!ids.is_allocated(a));
        assert_eq!(ids.alloc(16), Some(a));
        assert!(ids.is_allocated(b));
    }

    #[test]
    fn test_limit_bits_caps_allocation() {
        let ids = IdAllocator::new(16);
        for expected in 1..4 {
            assert_eq!(ids.alloc(2), Some(expected));
        }
        assert_eq!(ids.alloc(2), None);
        // A wider controller still has room
        assert_eq!(ids.alloc(16), Some(4));
    }

    #[test]
    fn test_exhaustion() {
        let ids = IdAllocator::new(8);
        for _ in 1..256 {
            assert!(ids.alloc(8).is_some());
        }
        assert_eq!(ids.alloc(8), None);
        assert_eq!(ids.in_use(), 255);
    }
}
