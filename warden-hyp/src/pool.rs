//! Memory donated by the host for hypervisor tables
//!
//! The host tops the pool up ahead of requests that may allocate (attach,
//! map). Page tables, CD tables and stream table leaves of the mirror come
//! from nowhere else.

use alloc::collections::BTreeSet;
use alloc::vec::Vec;

use spin::Mutex;
use warden_common::memory::page;
use warden_common::{FrameAllocator, PhysAddr};

use crate::ownership::Donation;

struct PoolInner {
    /// Donations whose pages feed the pool; dropped with it
    donations: Vec<Donation>,
    /// Free frame numbers
    free: BTreeSet<u64>,
}

/// Frame allocator over donated pages.
pub struct DonatedPool {
    inner: Mutex<PoolInner>,
}

impl DonatedPool {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                donations: Vec::new(),
                free: BTreeSet::new(),
            }),
        }
    }

    /// Make the pages of `donation` available for allocation.
    pub fn topup(&self, donation: Donation) {
        let mut inner = self.inner.lock();
        let first = donation.base().pfn();
        inner.free.extend(first..first + donation.pages());
        inner.donations.push(donation);
    }

    /// Free pages.
    #[must_use]
    pub fn free_pages(&self) -> usize {
        self.inner.lock().free.len()
    }

    /// Pages ever handed to the pool.
    #[must_use]
    pub fn total_pages(&self) -> u64 {
        self.inner.lock().donations.iter().map(Donation::pages).sum()
    }

    /// Check whether `pa` belongs to a donation of the pool.
    #[must_use]
    pub fn contains(&self, pa: PhysAddr) -> bool {
        let pfn = pa.pfn();
        self.inner.lock().donations.iter().any(|d| {
            let first = d.base().pfn();
            (first..first + d.pages()).contains(&pfn)
        })
    }
}

impl Default for DonatedPool {
    fn default() -> Self {
        Self::new()
    }
}

/// First naturally aligned run of `count` free frames.
fn find_run(free: &BTreeSet<u64>, count: u64) -> Option<u64> {
    free.iter()
        .copied()
        .filter(|pfn| pfn % count == 0)
        .find(|&start| (start..start + count).all(|pfn| free.contains(&pfn)))
}

impl FrameAllocator for DonatedPool {
    fn alloc_zeroed(&self, order: u32) -> Option<PhysAddr> {
        let count = 1u64 << order;
        let mut inner = self.inner.lock();
        let Some(start) = find_run(&inner.free, count) else {
            log::warn!("hyp: pool exhausted (order {order}, {} free)", inner.free.len());
            return None;
        };
        for pfn in start..start + count {
            inner.free.remove(&pfn);
        }
        drop(inner);

        let pa = PhysAddr::from_pfn(start);
        let bytes = usize::try_from(count * page::SIZE_4K).ok()?;
        // SAFETY: the run is donated, reachable through the direct map and
        // was just taken off the free list
        unsafe { core::ptr::write_bytes(pa.to_virt().as_mut_ptr::<u8>(), 0, bytes) };
        Some(pa)
    }

    unsafe fn free(&self, pa: PhysAddr, order: u32) {
        let first = pa.pfn();
        let mut inner = self.inner.lock();
        for pfn in first..first + (1u64 << order) {
            if !inner.free.insert(pfn) {
                log::warn!("hyp: pool page {:#x} freed twice", pfn << page::SHIFT_4K);
            }
        }
    }
}

impl core::fmt::Debug for DonatedPool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DonatedPool")
            .field("donations", &inner.donations.len())
            .field("free", &inner.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ownership::{OwnershipMap, PageState};
    use alloc::sync::Arc;
    use warden_common::HeapFrameAllocator;

    /// Donate `2^order` freshly allocated host frames.
    fn donated(map: &Arc<OwnershipMap>, host: &HeapFrameAllocator, order: u32) -> Donation {
        let pa = host.alloc_zeroed(order).unwrap();
        map.donate(pa, 1 << order).unwrap()
    }

    #[test]
    fn test_allocates_aligned_runs() {
        let map = Arc::new(OwnershipMap::new());
        let host = HeapFrameAllocator::new();
        let pool = DonatedPool::new();
        pool.topup(donated(&map, &host, 3));
        assert_eq!(pool.free_pages(), 8);

        let one = pool.alloc_zeroed(0).unwrap();
        let four = pool.alloc_zeroed(2).unwrap();
        assert!(four.is_aligned(4 * page::SIZE_4K));
        assert_ne!(one, four);
        assert_eq!(pool.free_pages(), 3);
        assert!(pool.alloc_zeroed(2).is_none());

        // SAFETY: allocated above, never handed to hardware
        unsafe { pool.free(four, 2) };
        assert_eq!(pool.free_pages(), 7);
        assert!(pool.contains(one));
    }

    #[test]
    fn test_allocations_are_zeroed() {
        let map = Arc::new(OwnershipMap::new());
        let host = HeapFrameAllocator::new();
        let pool = DonatedPool::new();
        pool.topup(donated(&map, &host, 0));

        let pa = pool.alloc_zeroed(0).unwrap();
        let ptr = pa.to_virt().as_mut_ptr::<u64>();
        // SAFETY: the frame is owned by the test
        unsafe { ptr.write(0xdead_beef) };
        // SAFETY: as above
        unsafe { pool.free(pa, 0) };
        let again = pool.alloc_zeroed(0).unwrap();
        assert_eq!(again, pa);
        // SAFETY: as above
        assert_eq!(unsafe { ptr.read() }, 0);
    }

    #[test]
    fn test_dropping_pool_reclaims() {
        let map = Arc::new(OwnershipMap::new());
        let host = HeapFrameAllocator::new();
        let pool = DonatedPool::new();
        let donation = donated(&map, &host, 1);
        let base = donation.base();
        pool.topup(donation);
        assert_eq!(map.state(base), PageState::Hyp);
        assert_eq!(pool.total_pages(), 2);
        drop(pool);
        assert_eq!(map.state(base), PageState::Host);
    }
}
