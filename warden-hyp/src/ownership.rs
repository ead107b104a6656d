//! Page ownership
//!
//! Every page the hypervisor has heard of is in one of three states:
//!
//! ```text
//!         donate                  share
//!  Hyp <----------- Host -----------------> Shared
//!      -----------> (default) <-----------
//!         reclaim                 unshare
//! ```
//!
//! Host pages mapped into an I/O page table carry a DMA reference count;
//! such a page cannot change hands until the count drops to zero. A
//! donation is represented by a move-only [`Donation`] token: whoever holds
//! it owns the pages, and dropping it hands them back to the host.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use warden_common::PhysAddr;
use warden_common::memory::page;
use warden_smmu::SmmuError;

/// Longest run one ownership change may cover (1GB).
pub const MAX_RUN_PAGES: u64 = 1 << 18;

/// Frames past the 52-bit physical address space.
const PFN_LIMIT: u64 = 1 << (52 - page::SHIFT_4K);

/// Owner of one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Owned by the host (every page starts here)
    Host,
    /// Donated to the hypervisor
    Hyp,
    /// Owned by the host, pinned and shared with the hypervisor
    Shared,
}

#[derive(Debug, Clone, Copy)]
struct PageInfo {
    state: PageState,
    dma_refs: u32,
}

impl PageInfo {
    const HOST: Self = Self {
        state: PageState::Host,
        dma_refs: 0,
    };

    const fn is_default(&self) -> bool {
        matches!(self.state, PageState::Host) && self.dma_refs == 0
    }
}

/// Log and build an ownership error.
pub(crate) fn violation(what: &str, pa: u64) -> SmmuError {
    log::error!("hyp: ownership violation: {what} at {pa:#x}");
    SmmuError::OwnershipViolation
}

/// Ownership of every page, keyed by frame number. Pages absent from the
/// map are host pages without DMA references.
pub struct OwnershipMap {
    pages: Mutex<BTreeMap<u64, PageInfo>>,
}

impl OwnershipMap {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: Mutex::new(BTreeMap::new()),
        }
    }

    #[must_use]
    pub fn state(&self, pa: PhysAddr) -> PageState {
        self.info(pa.pfn()).state
    }

    /// Number of I/O page table mappings of the page.
    #[must_use]
    pub fn dma_refs(&self, pa: PhysAddr) -> u32 {
        self.info(pa.pfn()).dma_refs
    }

    fn info(&self, pfn: u64) -> PageInfo {
        self.pages.lock().get(&pfn).copied().unwrap_or(PageInfo::HOST)
    }

    /// Move `pages` host pages starting at `base` to the hypervisor.
    ///
    /// Every page must be a host page without DMA mappings.
    pub fn donate(self: &Arc<Self>, base: PhysAddr, pages: u64) -> Result<Donation, SmmuError> {
        self.transition(base, pages, "donate", |info| {
            (info.state == PageState::Host && info.dma_refs == 0).then_some(PageInfo {
                state: PageState::Hyp,
                dma_refs: 0,
            })
        })?;
        log::debug!("hyp: {pages} pages at {:#x} donated", base.as_u64());
        Ok(Donation {
            base,
            pages,
            map: Arc::clone(self),
        })
    }

    /// Pin host pages shared with the hypervisor.
    pub fn share(&self, base: PhysAddr, pages: u64) -> Result<(), SmmuError> {
        self.transition(base, pages, "share", |info| {
            (info.state == PageState::Host).then_some(PageInfo {
                state: PageState::Shared,
                ..info
            })
        })
    }

    pub fn unshare(&self, base: PhysAddr, pages: u64) -> Result<(), SmmuError> {
        self.transition(base, pages, "unshare", |info| {
            (info.state == PageState::Shared).then_some(PageInfo {
                state: PageState::Host,
                ..info
            })
        })
    }

    /// Take a DMA reference on each host page of the run.
    pub fn pin_dma(&self, base: PhysAddr, pages: u64) -> Result<(), SmmuError> {
        self.transition(base, pages, "DMA map", |info| {
            (info.state == PageState::Host).then(|| PageInfo {
                dma_refs: info.dma_refs.saturating_add(1),
                ..info
            })
        })
    }

    /// Drop a DMA reference of each page in `pfns`.
    pub fn unpin_dma(&self, pfns: &[u64]) {
        let mut map = self.pages.lock();
        for &pfn in pfns {
            match map.get_mut(&pfn) {
                Some(info) if info.dma_refs > 0 => {
                    info.dma_refs -= 1;
                    if info.is_default() {
                        map.remove(&pfn);
                    }
                }
                _ => log::warn!("hyp: unbalanced DMA unmap of {:#x}", pfn << page::SHIFT_4K),
            }
        }
    }

    /// Runs of pages that are not plain host pages, as `[start, end)`
    /// physical ranges.
    #[must_use]
    pub fn non_host_runs(&self) -> Vec<(u64, u64)> {
        let mut runs: Vec<(u64, u64)> = Vec::new();
        for (&pfn, info) in self.pages.lock().iter() {
            if info.state == PageState::Host {
                continue;
            }
            let start = pfn << page::SHIFT_4K;
            match runs.last_mut() {
                Some(last) if last.1 == start => last.1 += page::SIZE_4K,
                _ => runs.push((start, start + page::SIZE_4K)),
            }
        }
        runs
    }

    /// Apply `f` to every page of the run, or to none of them.
    fn transition<F>(&self, base: PhysAddr, pages: u64, what: &str, f: F) -> Result<(), SmmuError>
    where
        F: Fn(PageInfo) -> Option<PageInfo>,
    {
        if pages == 0 || pages > MAX_RUN_PAGES || !base.is_page_aligned() {
            return Err(SmmuError::InvalidArgument);
        }
        let first = base.pfn();
        let end = first + pages;
        if end > PFN_LIMIT {
            return Err(SmmuError::InvalidArgument);
        }

        let mut map = self.pages.lock();
        let mut next = Vec::with_capacity(pages as usize);
        for pfn in first..end {
            let info = map.get(&pfn).copied().unwrap_or(PageInfo::HOST);
            match f(info) {
                Some(new) => next.push(new),
                None => return Err(violation(what, pfn << page::SHIFT_4K)),
            }
        }
        for (pfn, info) in (first..end).zip(next) {
            if info.is_default() {
                map.remove(&pfn);
            } else {
                map.insert(pfn, info);
            }
        }
        Ok(())
    }

    /// Return a donation's pages to the host.
    fn release(&self, base: PhysAddr, pages: u64) {
        let mut map = self.pages.lock();
        for pfn in base.pfn()..base.pfn() + pages {
            match map.get(&pfn) {
                Some(info) if info.state == PageState::Hyp => {
                    map.remove(&pfn);
                }
                _ => log::warn!("hyp: reclaiming {:#x}, not donated", pfn << page::SHIFT_4K),
            }
        }
    }
}

impl Default for OwnershipMap {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for OwnershipMap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("OwnershipMap")
            .field("tracked", &self.pages.lock().len())
            .finish()
    }
}

/// Pages donated to the hypervisor.
///
/// Not `Clone`: exactly one structure uses donated pages at a time. Dropping
/// the token reclaims the pages for the host.
#[must_use = "dropping a donation returns its pages to the host"]
pub struct Donation {
    base: PhysAddr,
    pages: u64,
    map: Arc<OwnershipMap>,
}

impl Donation {
    #[inline]
    pub const fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub const fn pages(&self) -> u64 {
        self.pages
    }

    #[inline]
    pub const fn size(&self) -> u64 {
        self.pages << page::SHIFT_4K
    }

    /// First address past the donation.
    #[must_use]
    pub const fn end(&self) -> PhysAddr {
        self.base.offset(self.size())
    }

    /// Hand the pages back to the host.
    pub fn reclaim(self) {
        log::debug!("hyp: {} pages at {:#x} reclaimed", self.pages, self.base.as_u64());
    }
}

impl Drop for Donation {
    fn drop(&mut self) {
        self.map.release(self.base, self.pages);
    }
}

impl core::fmt::Debug for Donation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Donation")
            .field("base", &self.base)
            .field("pages", &self.pages)
            .finish()
    }
}
