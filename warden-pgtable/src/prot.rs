//! Mapping protection flags

use bitflags::bitflags;

bitflags! {
    /// Access requested for an I/O mapping.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct IommuProt: u32 {
        /// Device may read
        const READ = 1 << 0;
        /// Device may write
        const WRITE = 1 << 1;
        /// Normal write-back cacheable memory, inner shareable
        const CACHE = 1 << 2;
        /// Instruction fetches not permitted
        const NOEXEC = 1 << 3;
        /// Device memory (registers, doorbells)
        const MMIO = 1 << 4;
        /// Privileged accesses only (stage 1)
        const PRIV = 1 << 5;
    }
}

impl IommuProt {
    /// Read/write cacheable memory, the common DMA buffer case.
    pub const RW_CACHED: Self = Self::READ.union(Self::WRITE).union(Self::CACHE);

    /// Check that at least one of read or write is requested.
    #[inline]
    #[must_use]
    pub const fn is_accessible(self) -> bool {
        self.intersects(Self::READ.union(Self::WRITE))
    }
}
