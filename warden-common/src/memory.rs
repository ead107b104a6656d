//! Page Constants and Frame Allocation
//!
//! Every structure the SMMU walks (queues, stream tables, CD tables, I/O page
//! tables) lives in physically contiguous, naturally aligned frames obtained
//! through a [`FrameAllocator`]. The allocator hands out power-of-two runs of
//! 4KB frames identified by their physical address.

use crate::addr::PhysAddr;

/// Page size constants
pub mod page {
    /// 4KB page size
    pub const SIZE_4K: u64 = 4096;
    /// 2MB block size
    pub const SIZE_2M: u64 = 2 * 1024 * 1024;
    /// 1GB block size
    pub const SIZE_1G: u64 = 1024 * 1024 * 1024;

    /// 4KB page shift
    pub const SHIFT_4K: u32 = 12;
    /// 2MB block shift
    pub const SHIFT_2M: u32 = 21;
    /// 1GB block shift
    pub const SHIFT_1G: u32 = 30;

    /// 4KB page mask
    pub const MASK_4K: u64 = SIZE_4K - 1;

    const _: () = assert!(1 << SHIFT_4K == SIZE_4K, "SHIFT_4K must match SIZE_4K");
    const _: () = assert!(1 << SHIFT_2M == SIZE_2M, "SHIFT_2M must match SIZE_2M");
    const _: () = assert!(1 << SHIFT_1G == SIZE_1G, "SHIFT_1G must match SIZE_1G");

    #[must_use]
    pub const fn align_down_4k(addr: u64) -> u64 {
        addr & !MASK_4K
    }

    #[must_use]
    pub const fn align_up_4k(addr: u64) -> u64 {
        (addr + MASK_4K) & !MASK_4K
    }

    #[must_use]
    pub const fn is_aligned_4k(addr: u64) -> bool {
        addr & MASK_4K == 0
    }

    /// Smallest allocation order covering `bytes`.
    #[must_use]
    pub const fn order_for(bytes: u64) -> u32 {
        let pages = align_up_4k(bytes) >> SHIFT_4K;
        if pages <= 1 {
            0
        } else {
            u64::BITS - (pages - 1).leading_zeros()
        }
    }
}

/// Source of zeroed physical frames for hardware-walked structures.
///
/// An allocation of `order` returns `2^order` contiguous 4KB frames aligned
/// to their total size. Implementations must be usable from several CPUs.
pub trait FrameAllocator: Send + Sync {
    /// Allocate `2^order` zeroed frames.
    ///
    /// Returns `None` when the backing store is exhausted.
    fn alloc_zeroed(&self, order: u32) -> Option<PhysAddr>;

    /// Return frames obtained from [`alloc_zeroed`](Self::alloc_zeroed).
    ///
    /// # Safety
    ///
    /// `pa` must come from a previous `alloc_zeroed(order)` on this allocator
    /// and must no longer be reachable by the hardware.
    unsafe fn free(&self, pa: PhysAddr, order: u32);
}

/// Frames carved from the global heap.
///
/// Physical addresses are the heap addresses themselves, which matches the
/// default identity direct map. An optional frame limit makes allocation
/// failure reproducible.
#[cfg(feature = "heap")]
pub struct HeapFrameAllocator {
    live: core::sync::atomic::AtomicUsize,
    allocations: core::sync::atomic::AtomicUsize,
    limit: core::sync::atomic::AtomicUsize,
}

#[cfg(feature = "heap")]
impl HeapFrameAllocator {
    /// Create an allocator without a frame limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            live: core::sync::atomic::AtomicUsize::new(0),
            allocations: core::sync::atomic::AtomicUsize::new(0),
            limit: core::sync::atomic::AtomicUsize::new(usize::MAX),
        }
    }

    /// Refuse allocations once `frames` frames are live.
    pub fn set_limit(&self, frames: usize) {
        self.limit
            .store(frames, core::sync::atomic::Ordering::SeqCst);
    }

    /// Frames currently allocated.
    #[must_use]
    pub fn live_frames(&self) -> usize {
        self.live.load(core::sync::atomic::Ordering::SeqCst)
    }

    /// Successful allocation calls so far.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(core::sync::atomic::Ordering::SeqCst)
    }

    fn layout(order: u32) -> Option<alloc::alloc::Layout> {
        let size = (page::SIZE_4K as usize) << order;
        alloc::alloc::Layout::from_size_align(size, size).ok()
    }
}

#[cfg(feature = "heap")]
impl Default for HeapFrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "heap")]
impl FrameAllocator for HeapFrameAllocator {
    fn alloc_zeroed(&self, order: u32) -> Option<PhysAddr> {
        use core::sync::atomic::Ordering;

        let frames = 1usize << order;
        if self.live.load(Ordering::SeqCst) + frames > self.limit.load(Ordering::SeqCst) {
            return None;
        }
        let layout = Self::layout(order)?;
        // SAFETY: layout has a non-zero size
        let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        self.live.fetch_add(frames, Ordering::SeqCst);
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Some(PhysAddr::new(ptr as u64))
    }

    unsafe fn free(&self, pa: PhysAddr, order: u32) {
        let Some(layout) = Self::layout(order) else {
            return;
        };
        // SAFETY: caller guarantees pa came from alloc_zeroed(order), which
        // returned a heap pointer allocated with this layout
        unsafe { alloc::alloc::dealloc(pa.as_u64() as *mut u8, layout) };
        self.live
            .fetch_sub(1usize << order, core::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::page;

    #[test]
    fn test_order_for() {
        assert_eq!(page::order_for(1), 0);
        assert_eq!(page::order_for(4096), 0);
        assert_eq!(page::order_for(4097), 1);
        assert_eq!(page::order_for(16 * 1024), 2);
        assert_eq!(page::order_for(20 * 1024), 3);
    }

    #[test]
    fn test_alignment_helpers() {
        assert_eq!(page::align_down_4k(0x1fff), 0x1000);
        assert_eq!(page::align_up_4k(0x1001), 0x2000);
        assert!(page::is_aligned_4k(0x3000));
    }
}
