//! Register Files
//!
//! An SMMU exposes two 64KB register pages. Driver code reaches them only
//! through [`RegisterIo`], implemented by [`MmioRegion`] for real device
//! memory and by software models in tests.

use core::ptr::{read_volatile, write_volatile};

/// 32/64-bit register access at byte offsets into a register file.
///
/// Each call must be one naturally aligned, single-copy atomic access: the
/// SMMU ignores or faults on split 64-bit accesses to its base registers.
pub trait RegisterIo: Send + Sync {
    fn read32(&self, offset: usize) -> u32;

    fn write32(&self, offset: usize, value: u32);

    fn read64(&self, offset: usize) -> u64;

    fn write64(&self, offset: usize, value: u64);
}

/// Register file mapped with device memory attributes.
///
/// ```ignore
/// // SAFETY: firmware describes 128KB of SMMU registers at this address,
/// // mapped Device-nGnRE
/// let regs = unsafe { MmioRegion::new(0x0900_0000, 0x2_0000) };
/// let idr0 = regs.read32(0x0);
/// ```
#[derive(Clone, Copy)]
pub struct MmioRegion {
    base: usize,
    size: usize,
}

impl MmioRegion {
    /// # Safety
    ///
    /// `[base, base + size)` must be mapped device memory holding the
    /// registers for as long as the region (or a copy) is used.
    #[inline]
    #[must_use]
    pub const unsafe fn new(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Pointer to the `T`-sized register at `offset`.
    #[inline]
    fn reg<T>(&self, offset: usize) -> *mut T {
        let width = core::mem::size_of::<T>();
        debug_assert!(
            offset + width <= self.size && offset.is_multiple_of(width),
            "register access at {offset:#x} (width {width}) outside {self:?}"
        );
        (self.base + offset) as *mut T
    }
}

impl RegisterIo for MmioRegion {
    #[inline]
    fn read32(&self, offset: usize) -> u32 {
        // SAFETY: inside the mapped register file, naturally aligned
        unsafe { read_volatile(self.reg::<u32>(offset)) }
    }

    #[inline]
    fn write32(&self, offset: usize, value: u32) {
        // SAFETY: as for read32
        unsafe { write_volatile(self.reg::<u32>(offset), value) }
    }

    #[inline]
    fn read64(&self, offset: usize) -> u64 {
        // SAFETY: as for read32
        unsafe { read_volatile(self.reg::<u64>(offset)) }
    }

    #[inline]
    fn write64(&self, offset: usize, value: u64) {
        // SAFETY: as for read32
        unsafe { write_volatile(self.reg::<u64>(offset), value) }
    }
}

impl core::fmt::Debug for MmioRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "MmioRegion({:#x}+{:#x})", self.base, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_read_write() {
        let mut backing = [0u64; 4];
        let base = backing.as_mut_ptr() as usize;
        // SAFETY: backing outlives the region and is 32 bytes long
        let regs = unsafe { MmioRegion::new(base, 32) };

        regs.write64(8, 0xdead_beef_0000_0001);
        assert_eq!(regs.read64(8), 0xdead_beef_0000_0001);

        regs.write32(16, 0x55);
        regs.write32(20, 0x1);
        assert_eq!(regs.read32(16), 0x55);
        assert_eq!(regs.read64(16), 0x1_0000_0055);
        assert_eq!(regs.size(), 32);
    }
}
