//! TLB flush callbacks and invalidation gathering

use alloc::vec::Vec;

use warden_common::PhysAddr;

/// Invalidations and freed tables collected during one unmap call.
#[derive(Debug, Default)]
pub struct IotlbGather {
    start: u64,
    end: u64,
    granule: u64,
    mixed: bool,
    freelist: Vec<PhysAddr>,
}

impl IotlbGather {
    /// Create an empty gather.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a cleared leaf of `size` bytes at `iova`.
    pub fn add_page(&mut self, iova: u64, size: u64) {
        let end = iova.saturating_add(size);
        if self.end == 0 {
            self.start = iova;
            self.end = end;
            self.granule = size;
            return;
        }
        self.start = self.start.min(iova);
        self.end = self.end.max(end);
        if size != self.granule {
            self.mixed = true;
            self.granule = self.granule.min(size);
        }
    }

    /// Check whether no leaf has been recorded.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.end == 0
    }

    /// Gathered range as `(start, size)`.
    #[must_use]
    pub const fn range(&self) -> Option<(u64, u64)> {
        if self.end == 0 {
            None
        } else {
            Some((self.start, self.end - self.start))
        }
    }

    /// Leaf size shared by every recorded leaf, if they all had the same size.
    #[must_use]
    pub const fn leaf_size(&self) -> Option<u64> {
        if self.end == 0 || self.mixed {
            None
        } else {
            Some(self.granule)
        }
    }

    /// Queue a table frame for release after invalidation.
    #[inline]
    pub fn push_free(&mut self, table: PhysAddr) {
        self.freelist.push(table);
    }

    /// Number of table frames awaiting release.
    #[inline]
    #[must_use]
    pub fn freed_tables(&self) -> usize {
        self.freelist.len()
    }

    /// Take the table frames awaiting release.
    #[must_use]
    pub fn take_freelist(&mut self) -> Vec<PhysAddr> {
        core::mem::take(&mut self.freelist)
    }

    /// Forget the gathered range (after it has been invalidated).
    pub fn reset_range(&mut self) {
        self.start = 0;
        self.end = 0;
        self.granule = 0;
        self.mixed = false;
    }
}

/// TLB maintenance supplied by the controller that walks the table.
///
/// Called with the page table lock held; implementations must not call back
/// into the page table.
pub trait FlushOps {
    /// Invalidate every translation cached for this table.
    fn flush_all(&self);

    /// Invalidate walk caches (and leaves) for `[iova, iova + size)` after an
    /// intermediate table was removed, and wait for completion.
    fn flush_walk(&self, iova: u64, size: u64, granule: u64);

    /// Record a cleared leaf for a deferred invalidation.
    fn add_page(&self, gather: &mut IotlbGather, iova: u64, granule: u64) {
        gather.add_page(iova, granule);
    }
}
