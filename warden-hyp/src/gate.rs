//! Host call gate
//!
//! The only way the host driver reaches the hypervisor's SMMU state. Each
//! [`HypCall`] is validated against the hypervisor's own records and its
//! outcome returned as a non-negative value or a negative errno.
//!
//! Calls that may allocate tables (`Attach`, `Map`) carry a memory cache:
//! base addresses of earlier donations, moved into the pool before the call
//! runs.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::{Mutex, RwLock};
use warden_common::memory::page;
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::RegisterIo;
use warden_pgtable::IommuProt;
use warden_smmu::{DeviceDescriptor, Domain, DomainKind, IdAllocator, SmmuConfig, SmmuError};

use crate::domain::HypDomain;
use crate::idmap::HostIdmap;
use crate::ownership::{Donation, MAX_RUN_PAGES, OwnershipMap, PageState, violation};
use crate::pool::DonatedPool;
use crate::smmu::{HypSmmu, MmioAccess};

/// Negative errno values returned to the host.
pub mod errno {
    pub const EPERM: i64 = -1;
    pub const ENOENT: i64 = -2;
    pub const EIO: i64 = -5;
    pub const ENOMEM: i64 = -12;
    pub const EBUSY: i64 = -16;
    pub const ENODEV: i64 = -19;
    pub const EINVAL: i64 = -22;
    pub const ETIMEDOUT: i64 = -110;
}

/// Errno reported to the host for `err`.
#[must_use]
pub const fn to_errno(err: SmmuError) -> i64 {
    match err {
        SmmuError::Timeout => errno::ETIMEDOUT,
        SmmuError::Configuration | SmmuError::InvalidArgument => errno::EINVAL,
        SmmuError::OutOfMemory => errno::ENOMEM,
        SmmuError::OwnershipViolation => errno::EPERM,
        SmmuError::HardwareFault(_) => errno::EIO,
        SmmuError::Busy => errno::EBUSY,
        SmmuError::InvalidStreamId => errno::ENODEV,
        SmmuError::NotFound => errno::ENOENT,
    }
}

/// Requests the host may make.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HypCall {
    /// Give `pages` pages at `pa` to the hypervisor
    Donate { pa: PhysAddr, pages: u64 },
    /// Take back a donation not yet in use
    Reclaim { pa: PhysAddr },
    /// Returns the new domain id
    AllocDomain { kind: DomainKind },
    FreeDomain { domain: u32 },
    Attach {
        smmu: usize,
        domain: u32,
        sid: u32,
        ssid: Option<u32>,
        cache: Vec<PhysAddr>,
    },
    Detach {
        smmu: usize,
        domain: u32,
        sid: u32,
        ssid: Option<u32>,
    },
    Map {
        domain: u32,
        iova: u64,
        pa: PhysAddr,
        size: u64,
        prot: IommuProt,
        cache: Vec<PhysAddr>,
    },
    /// Returns the bytes unmapped
    Unmap { domain: u32, iova: u64, size: u64 },
    /// Returns the output address
    IovaToPhys { domain: u32, iova: u64 },
    /// Invalidate every TLB entry of a domain
    Invalidate { domain: u32 },
    Suspend { smmu: usize },
    Resume { smmu: usize },
}

/// Hypervisor SMMU state and the entry point for host calls.
pub struct Gate {
    ownership: Arc<OwnershipMap>,
    pool: Arc<DonatedPool>,
    smmus: RwLock<Vec<Arc<HypSmmu>>>,
    domains: RwLock<BTreeMap<u32, Arc<HypDomain>>>,
    /// Donations not yet handed to the pool, by base address
    pending: Mutex<BTreeMap<u64, Donation>>,
    idmap: HostIdmap,
    next_domain: AtomicU32,
    asids: Arc<IdAllocator>,
    vmids: Arc<IdAllocator>,
}

impl Gate {
    /// Create the gate. `host_memory` is the RAM identity domains expose,
    /// as `[start, end)` ranges, and the only memory the host may donate.
    #[must_use]
    pub fn new(ownership: Arc<OwnershipMap>, host_memory: &[(u64, u64)]) -> Self {
        Self {
            ownership,
            pool: Arc::new(DonatedPool::new()),
            smmus: RwLock::new(Vec::new()),
            domains: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            idmap: HostIdmap::new(host_memory),
            next_domain: AtomicU32::new(1),
            asids: Arc::new(IdAllocator::new(warden_smmu::ids::MAX_ID_BITS)),
            vmids: Arc::new(IdAllocator::new(warden_smmu::ids::MAX_ID_BITS)),
        }
    }

    /// Take over the controller behind `io`, which the host has programmed,
    /// and enable it. Returns its index for [`HypCall`]s.
    pub fn add_smmu(
        &self,
        io: Arc<dyn RegisterIo>,
        desc: DeviceDescriptor,
        config: SmmuConfig,
    ) -> Result<usize, SmmuError> {
        let mut smmus = self.smmus.write();
        let index = smmus.len();
        let smmu = HypSmmu::new(
            index,
            io,
            desc,
            config,
            Arc::clone(&self.ownership),
            Arc::clone(&self.pool),
        );
        smmu.probe()?;
        smmu.reset()?;
        smmus.push(Arc::new(smmu));
        Ok(index)
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<DonatedPool> {
        &self.pool
    }

    #[must_use]
    pub fn ownership(&self) -> &Arc<OwnershipMap> {
        &self.ownership
    }

    pub fn smmu(&self, index: usize) -> Result<Arc<HypSmmu>, SmmuError> {
        self.smmus.read().get(index).cloned().ok_or(SmmuError::NotFound)
    }

    /// Handle one host request.
    pub fn handle(&self, call: HypCall) -> i64 {
        match self.dispatch(call) {
            Ok(value) => i64::try_from(value).unwrap_or(errno::EINVAL),
            Err(err) => {
                log::debug!("hyp: call failed: {err}");
                to_errno(err)
            }
        }
    }

    /// Forward a trapped host register access to controller `smmu`.
    pub fn handle_mmio(
        &self,
        smmu: usize,
        offset: usize,
        width: usize,
        access: MmioAccess,
    ) -> Result<u32, SmmuError> {
        self.smmu(smmu)?.handle_mmio(offset, width, access)
    }

    fn dispatch(&self, call: HypCall) -> Result<u64, SmmuError> {
        match call {
            HypCall::Donate { pa, pages } => self.donate(pa, pages).map(|()| 0),
            HypCall::Reclaim { pa } => self.reclaim(pa).map(|()| 0),
            HypCall::AllocDomain { kind } => self.alloc_domain(kind).map(u64::from),
            HypCall::FreeDomain { domain } => self.free_domain(domain).map(|()| 0),
            HypCall::Attach {
                smmu,
                domain,
                sid,
                ssid,
                cache,
            } => {
                self.topup(&cache)?;
                let domain = self.domain(domain)?;
                let smmu = self.smmu(smmu)?;
                let device = smmu.device()?;
                smmu.note(domain.attach(&device, sid, ssid)).map(|()| 0)
            }
            HypCall::Detach {
                smmu,
                domain,
                sid,
                ssid,
            } => {
                let domain = self.domain(domain)?;
                let smmu = self.smmu(smmu)?;
                let device = smmu.device()?;
                smmu.note(domain.detach(&device, sid, ssid)).map(|()| 0)
            }
            HypCall::Map {
                domain,
                iova,
                pa,
                size,
                prot,
                cache,
            } => {
                self.topup(&cache)?;
                self.domain(domain)?.map(iova, pa, size, prot).map(|()| 0)
            }
            HypCall::Unmap { domain, iova, size } => self.domain(domain)?.unmap(iova, size),
            HypCall::IovaToPhys { domain, iova } => {
                self.domain(domain)?.iova_to_phys(iova).map(PhysAddr::as_u64)
            }
            HypCall::Invalidate { domain } => self.domain(domain)?.flush_all().map(|()| 0),
            HypCall::Suspend { smmu } => self.smmu(smmu)?.suspend().map(|()| 0),
            HypCall::Resume { smmu } => self.smmu(smmu)?.resume().map(|()| 0),
        }
    }

    fn domain(&self, id: u32) -> Result<Arc<HypDomain>, SmmuError> {
        self.domains.read().get(&id).cloned().ok_or(SmmuError::NotFound)
    }

    /// Take `pages` host RAM pages at `pa`. Runs longer than
    /// [`MAX_RUN_PAGES`] or wrapping the address space are invalid; runs
    /// reaching outside host RAM are refused.
    fn donate(&self, pa: PhysAddr, pages: u64) -> Result<(), SmmuError> {
        if pages == 0 || pages > MAX_RUN_PAGES {
            return Err(SmmuError::InvalidArgument);
        }
        let end = pages
            .checked_mul(page::SIZE_4K)
            .and_then(|len| pa.as_u64().checked_add(len))
            .ok_or(SmmuError::InvalidArgument)?;
        if !self.idmap.covers(pa.as_u64(), end) {
            return Err(violation("donation outside host memory", pa.as_u64()));
        }

        let donation = self.ownership.donate(pa, pages)?;
        self.pending.lock().insert(pa.as_u64(), donation);
        self.idmap.on_donate(pa.as_u64(), end);
        Ok(())
    }

    fn reclaim(&self, pa: PhysAddr) -> Result<(), SmmuError> {
        let Some(donation) = self.pending.lock().remove(&pa.as_u64()) else {
            return Err(self.unknown_donation(pa));
        };
        let (start, end) = (pa.as_u64(), donation.end().as_u64());
        donation.reclaim();
        self.idmap.on_reclaim(start, end);
        Ok(())
    }

    /// Move the donations named in `cache` into the pool.
    fn topup(&self, cache: &[PhysAddr]) -> Result<(), SmmuError> {
        for &pa in cache {
            let Some(donation) = self.pending.lock().remove(&pa.as_u64()) else {
                return Err(self.unknown_donation(pa));
            };
            self.pool.topup(donation);
        }
        Ok(())
    }

    /// Error for a request naming `pa` as a donation it is not.
    fn unknown_donation(&self, pa: PhysAddr) -> SmmuError {
        if self.ownership.state(pa) == PageState::Hyp {
            // Donated, but already handed to a structure
            SmmuError::Busy
        } else {
            violation("not donated", pa.as_u64())
        }
    }

    fn alloc_domain(&self, kind: DomainKind) -> Result<u32, SmmuError> {
        let id = self.next_domain.fetch_add(1, Ordering::Relaxed);
        let ids = if kind.is_stage1() {
            Arc::clone(&self.asids)
        } else {
            Arc::clone(&self.vmids)
        };
        let alloc: Arc<dyn FrameAllocator> = self.pool.clone();
        let domain = Arc::new(HypDomain::new(
            Domain::new(id, kind, ids, alloc),
            Arc::clone(&self.ownership),
        ));
        if kind == DomainKind::Identity {
            self.idmap.register(&domain, &self.ownership)?;
        }
        self.domains.write().insert(id, domain);
        Ok(id)
    }

    fn free_domain(&self, id: u32) -> Result<(), SmmuError> {
        let mut domains = self.domains.write();
        let domain = domains.get(&id).ok_or(SmmuError::NotFound)?;
        if domain.is_attached() {
            return Err(SmmuError::Busy);
        }
        if domain.kind() == DomainKind::Identity {
            self.idmap.unregister(id);
        }
        domains.remove(&id);
        Ok(())
    }

    /// Free pages left in the pool.
    #[must_use]
    pub fn pool_free_pages(&self) -> usize {
        self.pool.free_pages()
    }

    /// Pages the host donated but has not handed to a request yet.
    #[must_use]
    pub fn pending_pages(&self) -> u64 {
        self.pending.lock().values().map(Donation::pages).sum::<u64>()
    }
}

impl core::fmt::Debug for Gate {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Gate")
            .field("smmus", &self.smmus.read().len())
            .field("domains", &self.domains.read().len())
            .field("pending_pages", &self.pending_pages())
            .field("pool", &self.pool)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smmu::tests::{hyp_config, program_host};
    use alloc::vec;
    use core::cell::Cell;
    use warden_common::HeapFrameAllocator;
    use warden_smmu::cmd::Command;
    use warden_smmu::regs::{SMMU_CMDQ_BASE, SMMU_EVTQ_CONS};
    use warden_smmu::sim::{SimConfig, SimSmmu};

    const RAM: (u64, u64) = (0x8000_0000, 0xc000_0000);

    /// Backed host memory that donations are carved from.
    const ARENA_ORDER: u32 = 8;

    struct Host {
        sim: Arc<SimSmmu>,
        frames: HeapFrameAllocator,
        gate: Gate,
        arena: (u64, u64),
        next: Cell<u64>,
    }

    impl Host {
        fn new() -> Self {
            let sim = Arc::new(SimSmmu::new(SimConfig::default()));
            let frames = HeapFrameAllocator::new();
            program_host(&sim, &frames, true);
            let base = frames.alloc_zeroed(ARENA_ORDER).unwrap().as_u64();
            let arena = (base, base + (page::SIZE_4K << ARENA_ORDER));
            let mut memory = vec![RAM];
            if arena.1 <= RAM.0 || RAM.1 <= arena.0 {
                memory.push(arena);
            }
            let gate = Gate::new(Arc::new(OwnershipMap::new()), &memory);
            assert_eq!(
                gate.add_smmu(sim.clone(), DeviceDescriptor::default(), hyp_config()),
                Ok(0)
            );
            Self {
                sim,
                frames,
                gate,
                arena,
                next: Cell::new(base),
            }
        }

        /// Donate a fresh `2^order` run of the arena and return its base.
        fn donate(&self, order: u32) -> PhysAddr {
            let size = page::SIZE_4K << order;
            let start = self.next.get().next_multiple_of(size);
            assert!(start + size <= self.arena.1, "arena exhausted");
            self.next.set(start + size);
            let pa = PhysAddr::new(start);
            let ret = self.gate.handle(HypCall::Donate {
                pa,
                pages: 1 << order,
            });
            assert_eq!(ret, 0);
            pa
        }
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(to_errno(SmmuError::Timeout), -110);
        assert_eq!(to_errno(SmmuError::OwnershipViolation), -1);
        assert_eq!(to_errno(SmmuError::Busy), -16);
        assert_eq!(to_errno(SmmuError::HardwareFault(2)), -5);
        assert_eq!(to_errno(SmmuError::InvalidStreamId), -19);
    }

    #[test]
    fn test_stage2_map_through_gate() {
        let host = Host::new();
        let cache = host.donate(5);
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let dom = u32::try_from(dom).unwrap();

        let attach = HypCall::Attach {
            smmu: 0,
            domain: dom,
            sid: 4,
            ssid: None,
            cache: vec![cache],
        };
        assert_eq!(host.gate.handle(attach), 0);
        assert_eq!(host.gate.pending_pages(), 0);

        let pa = PhysAddr::new(0x9000_0000);
        host.sim.clear_log();
        let map = HypCall::Map {
            domain: dom,
            iova: 0x4000_0000,
            pa,
            size: 3 * page::SIZE_4K,
            prot: IommuProt::RW_CACHED,
            cache: Vec::new(),
        };
        assert_eq!(host.gate.handle(map), 0);
        assert_eq!(host.gate.ownership().dma_refs(pa), 1);
        assert_eq!(
            host.gate.handle(HypCall::IovaToPhys {
                domain: dom,
                iova: 0x4000_2010
            }),
            0x9000_2010
        );

        let unmapped = host.gate.handle(HypCall::Unmap {
            domain: dom,
            iova: 0x4000_0000,
            size: 3 * page::SIZE_4K,
        });
        assert_eq!(unmapped, 3 * page::SIZE_4K as i64);
        assert_eq!(host.gate.ownership().dma_refs(pa), 0);

        // One batch per call, each ending in a single sync
        for batch in host.sim.batches() {
            let syncs = batch.iter().filter(|c| matches!(c, Command::Sync { .. })).count();
            assert!(syncs <= 1);
        }

        assert_eq!(host.gate.handle(HypCall::FreeDomain { domain: dom }), errno::EBUSY);
        let detach = HypCall::Detach {
            smmu: 0,
            domain: dom,
            sid: 4,
            ssid: None,
        };
        assert_eq!(host.gate.handle(detach), 0);
        assert_eq!(host.gate.handle(HypCall::FreeDomain { domain: dom }), 0);
    }

    #[test]
    fn test_undonated_memory_rejected() {
        let host = Host::new();
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage1,
        });
        let stranger = host.frames.alloc_zeroed(0).unwrap();
        let attach = HypCall::Attach {
            smmu: 0,
            domain: u32::try_from(dom).unwrap(),
            sid: 1,
            ssid: None,
            cache: vec![stranger],
        };
        assert_eq!(host.gate.handle(attach), errno::EPERM);
        assert_eq!(host.gate.handle(HypCall::Reclaim { pa: stranger }), errno::EPERM);
    }

    #[test]
    fn test_donation_bounds() {
        let host = Host::new();
        let donate = |pa: u64, pages: u64| {
            host.gate.handle(HypCall::Donate {
                pa: PhysAddr::new(pa),
                pages,
            })
        };
        // Wrapping the address space
        assert_eq!(donate(0xffff_ffff_ffff_f000, 2), errno::EINVAL);
        assert_eq!(donate(RAM.0, u64::MAX), errno::EINVAL);
        assert_eq!(donate(RAM.0, MAX_RUN_PAGES + 1), errno::EINVAL);
        assert_eq!(donate(RAM.0, 0), errno::EINVAL);

        // Not host RAM, or only partly
        assert_eq!(donate(0x1000, 1), errno::EPERM);
        assert_eq!(donate(RAM.1 - page::SIZE_4K, 2), errno::EPERM);
        assert_eq!(donate(RAM.0 - page::SIZE_4K, 2), errno::EPERM);
        assert_eq!(host.gate.ownership().state(PhysAddr::new(RAM.0)), PageState::Host);
        assert_eq!(host.gate.pending_pages(), 0);

        assert_eq!(donate(RAM.1 - page::SIZE_4K, 1), 0);
        assert_eq!(host.gate.pending_pages(), 1);
    }

    #[test]
    fn test_reclaimed_memory_rejected() {
        let host = Host::new();
        let pa = host.donate(0);
        assert_eq!(host.gate.ownership().state(pa), PageState::Hyp);
        assert_eq!(host.gate.handle(HypCall::Reclaim { pa }), 0);
        assert_eq!(host.gate.ownership().state(pa), PageState::Host);

        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let map = HypCall::Map {
            domain: u32::try_from(dom).unwrap(),
            iova: 0,
            pa: PhysAddr::new(0x9000_0000),
            size: page::SIZE_4K,
            prot: IommuProt::READ,
            cache: vec![pa],
        };
        assert_eq!(host.gate.handle(map), errno::EPERM);
        assert_eq!(host.gate.handle(HypCall::Reclaim { pa }), errno::EPERM);
    }

    #[test]
    fn test_pool_pages_cannot_be_reclaimed_or_reused() {
        let host = Host::new();
        let cache = host.donate(0);
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let dom = u32::try_from(dom).unwrap();
        let map = |cache: Vec<PhysAddr>| HypCall::Map {
            domain: dom,
            iova: 0,
            pa: PhysAddr::new(0x9000_0000),
            size: page::SIZE_4K,
            prot: IommuProt::READ,
            cache,
        };
        // Unbound domain, but the cache is consumed first
        assert_eq!(host.gate.handle(map(vec![cache])), errno::ENOENT);
        assert_eq!(host.gate.pool_free_pages(), 1);
        assert_eq!(host.gate.handle(map(vec![cache])), errno::EBUSY);
        assert_eq!(host.gate.handle(HypCall::Reclaim { pa: cache }), errno::EBUSY);
    }

    #[test]
    fn test_dma_to_hypervisor_memory_rejected() {
        let host = Host::new();
        let cache = host.donate(5);
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let dom = u32::try_from(dom).unwrap();
        let attach = HypCall::Attach {
            smmu: 0,
            domain: dom,
            sid: 2,
            ssid: None,
            cache: vec![cache],
        };
        assert_eq!(host.gate.handle(attach), 0);

        let map = HypCall::Map {
            domain: dom,
            iova: 0,
            pa: cache,
            size: page::SIZE_4K,
            prot: IommuProt::RW_CACHED,
            cache: Vec::new(),
        };
        assert_eq!(host.gate.handle(map), errno::EPERM);
    }

    #[test]
    fn test_validation_errors() {
        let host = Host::new();
        let cache = host.donate(5);
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let dom = u32::try_from(dom).unwrap();
        let attach = |sid, ssid, cache| HypCall::Attach {
            smmu: 0,
            domain: dom,
            sid,
            ssid,
            cache,
        };
        // The captured stream table has 2^8 entries
        assert_eq!(host.gate.handle(attach(0x100, None, vec![cache])), errno::ENODEV);
        assert_eq!(host.gate.handle(attach(1, Some(1), Vec::new())), errno::EBUSY);
        assert_eq!(
            host.gate.handle(HypCall::Attach {
                smmu: 3,
                domain: dom,
                sid: 1,
                ssid: None,
                cache: Vec::new()
            }),
            errno::ENOENT
        );
        assert_eq!(
            host.gate.handle(HypCall::Unmap {
                domain: dom,
                iova: 0x10,
                size: page::SIZE_4K
            }),
            errno::EINVAL
        );
    }

    #[test]
    fn test_suspend_blocks_attach() {
        let host = Host::new();
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Stage2,
        });
        let dom = u32::try_from(dom).unwrap();
        assert_eq!(host.gate.handle(HypCall::Suspend { smmu: 0 }), 0);
        let attach = HypCall::Attach {
            smmu: 0,
            domain: dom,
            sid: 1,
            ssid: None,
            cache: Vec::new(),
        };
        assert_eq!(host.gate.handle(attach.clone()), errno::EBUSY);
        assert_eq!(host.gate.handle(HypCall::Resume { smmu: 0 }), 0);
        // No pool pages: the page table cannot be allocated
        assert_eq!(host.gate.handle(attach), errno::ENOMEM);
    }

    #[test]
    fn test_identity_domain_follows_donations() {
        let host = Host::new();
        let dom = host.gate.handle(HypCall::AllocDomain {
            kind: DomainKind::Identity,
        });
        let dom = u32::try_from(dom).unwrap();
        let cache = host.donate(5);
        let attach = HypCall::Attach {
            smmu: 0,
            domain: dom,
            sid: 9,
            ssid: None,
            cache: vec![cache],
        };
        // Host RAM is not backed here; the identity map lives only in tables
        assert_eq!(host.gate.handle(attach), 0);
        assert_eq!(
            host.gate.handle(HypCall::IovaToPhys {
                domain: dom,
                iova: 0x8123_4000
            }),
            0x8123_4000
        );

        let ram_page = PhysAddr::new(0x8800_0000);
        assert_eq!(
            host.gate.handle(HypCall::Donate {
                pa: ram_page,
                pages: 1
            }),
            0
        );
        assert_eq!(
            host.gate.handle(HypCall::IovaToPhys {
                domain: dom,
                iova: ram_page.as_u64()
            }),
            errno::ENOENT
        );
        assert_eq!(host.gate.handle(HypCall::Reclaim { pa: ram_page }), 0);
        assert_eq!(
            host.gate.handle(HypCall::IovaToPhys {
                domain: dom,
                iova: ram_page.as_u64()
            }),
            0x8800_0000
        );
    }

    #[test]
    fn test_mmio_through_gate() {
        let host = Host::new();
        assert_eq!(
            host.gate.handle_mmio(0, SMMU_EVTQ_CONS, 4, MmioAccess::Read),
            Ok(0)
        );
        assert_eq!(
            host.gate.handle_mmio(0, SMMU_CMDQ_BASE, 4, MmioAccess::Read),
            Err(SmmuError::OwnershipViolation)
        );
        assert_eq!(
            host.gate.handle_mmio(1, SMMU_EVTQ_CONS, 4, MmioAccess::Read),
            Err(SmmuError::NotFound)
        );
    }
}
