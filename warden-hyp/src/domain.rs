//! Domains built by the hypervisor on the host's behalf
//!
//! A [`HypDomain`] wraps a driver [`Domain`] whose tables come from the
//! donated pool. Every page the host maps for DMA is checked against the
//! ownership map and carries a DMA reference while mapped.

use alloc::sync::Arc;
use alloc::vec::Vec;

use warden_common::PhysAddr;
use warden_common::memory::page;
use warden_pgtable::IommuProt;
use warden_smmu::{Domain, DomainKind, SmmuDevice, SmmuError};

use crate::ownership::OwnershipMap;

/// A domain owned by the hypervisor.
pub struct HypDomain {
    domain: Domain,
    ownership: Arc<OwnershipMap>,
}

impl HypDomain {
    #[must_use]
    pub const fn new(domain: Domain, ownership: Arc<OwnershipMap>) -> Self {
        Self { domain, ownership }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.domain.id()
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> DomainKind {
        self.domain.kind()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.domain.is_attached()
    }

    /// The underlying driver domain.
    #[must_use]
    pub const fn inner(&self) -> &Domain {
        &self.domain
    }

    pub fn attach(
        &self,
        device: &Arc<SmmuDevice>,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        self.domain.attach(device, sid, ssid)
    }

    pub fn detach(
        &self,
        device: &Arc<SmmuDevice>,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        self.domain.detach(device, sid, ssid)
    }

    /// Map host pages `[paddr, paddr + size)` at `iova`.
    ///
    /// Every page must be owned by the host.
    pub fn map(
        &self,
        iova: u64,
        paddr: PhysAddr,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), SmmuError> {
        if size == 0 || !page::is_aligned_4k(size) || !paddr.is_page_aligned() {
            return Err(SmmuError::InvalidArgument);
        }
        let pages = size >> page::SHIFT_4K;
        self.ownership.pin_dma(paddr, pages)?;
        let result = self.domain.map(iova, paddr, size, prot);
        if result.is_err() {
            let pfns: Vec<u64> = (paddr.pfn()..paddr.pfn() + pages).collect();
            self.ownership.unpin_dma(&pfns);
        }
        result
    }

    /// Unmap `[iova, iova + size)`, dropping the DMA reference of every
    /// page no longer mapped. Returns the bytes unmapped.
    ///
    /// Blocks only partly inside the range stay mapped and pinned.
    pub fn unmap(&self, iova: u64, size: u64) -> Result<u64, SmmuError> {
        let mut released = Vec::new();
        let unmapped = self.domain.unmap_with(iova, size, |_, pa, len| {
            released.extend(pa.pfn()..pa.pfn() + (len >> page::SHIFT_4K));
        })?;
        self.ownership.unpin_dma(&released);
        Ok(unmapped)
    }

    pub fn iova_to_phys(&self, iova: u64) -> Result<PhysAddr, SmmuError> {
        self.domain.iova_to_phys(iova)
    }

    pub fn flush_all(&self) -> Result<(), SmmuError> {
        self.domain.flush_all()
    }
}

impl core::fmt::Debug for HypDomain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("HypDomain").field(&self.domain).finish()
    }
}
