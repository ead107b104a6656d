//! Driver entry point
//!
//! [`SmmuRegistry`] owns every probed controller and every domain, plus the
//! ASID and VMID spaces the domains draw from. Callers name controllers and
//! domains by the handles it returns.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use spin::RwLock;
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::RegisterIo;
use warden_pgtable::IommuProt;

use crate::caps::ReservedRegion;
use crate::config::{DeviceDescriptor, SmmuConfig};
use crate::device::SmmuDevice;
use crate::domain::{Domain, DomainKind};
use crate::error::SmmuError;
use crate::evtq::FaultHandler;
use crate::ids::{IdAllocator, MAX_ID_BITS};

/// Handle of a probed controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub usize);

/// Handle of a domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId(pub u32);

/// All controllers and domains of the system.
pub struct SmmuRegistry {
    config: SmmuConfig,
    alloc: Arc<dyn FrameAllocator>,
    devices: RwLock<Vec<Arc<SmmuDevice>>>,
    domains: RwLock<BTreeMap<u32, Arc<Domain>>>,
    next_domain: AtomicU32,
    asids: Arc<IdAllocator>,
    vmids: Arc<IdAllocator>,
}

impl SmmuRegistry {
    /// Create an empty registry. Every controller probed later uses `config`
    /// and takes its tables from `alloc`.
    #[must_use]
    pub fn init(config: SmmuConfig, alloc: Arc<dyn FrameAllocator>) -> Self {
        Self {
            config,
            alloc,
            devices: RwLock::new(Vec::new()),
            domains: RwLock::new(BTreeMap::new()),
            next_domain: AtomicU32::new(1),
            asids: Arc::new(IdAllocator::new(MAX_ID_BITS)),
            vmids: Arc::new(IdAllocator::new(MAX_ID_BITS)),
        }
    }

    /// Disable every controller and drop every domain.
    ///
    /// Domains still attached are dropped without invalidation; the
    /// controllers are off by then.
    pub fn teardown(&self) {
        for device in self.devices.write().drain(..) {
            if let Err(err) = device.disable() {
                log::warn!("smmu{}: disable failed: {err}", device.index());
            }
        }
        let mut domains = self.domains.write();
        let attached = domains.values().filter(|d| d.is_attached()).count();
        if attached != 0 {
            log::warn!("smmu: teardown with {attached} attached domains");
        }
        domains.clear();
    }

    /// Probe and reset the controller behind `io`.
    ///
    /// A controller that fails is not registered; the others are unaffected.
    pub fn probe_device(
        &self,
        io: Arc<dyn RegisterIo>,
        desc: DeviceDescriptor,
    ) -> Result<DeviceId, SmmuError> {
        let mut devices = self.devices.write();
        let index = devices.len();
        let device = SmmuDevice::probe(index, io, desc, self.config, Arc::clone(&self.alloc))
            .and_then(|device| device.reset().map(|()| device))
            .inspect_err(|err| log::error!("smmu{index}: {:#x}: probe failed: {err}", desc.base))?;
        devices.push(Arc::new(device));
        Ok(DeviceId(index))
    }

    /// Look up a probed controller.
    pub fn device(&self, id: DeviceId) -> Result<Arc<SmmuDevice>, SmmuError> {
        self.devices.read().get(id.0).cloned().ok_or(SmmuError::NotFound)
    }

    /// Number of registered controllers.
    #[must_use]
    pub fn device_count(&self) -> usize {
        self.devices.read().len()
    }

    // -- Domains

    pub fn domain_alloc(&self, kind: DomainKind) -> DomainId {
        let id = self.next_domain.fetch_add(1, Ordering::Relaxed);
        let ids = if kind.is_stage1() {
            Arc::clone(&self.asids)
        } else {
            Arc::clone(&self.vmids)
        };
        let domain = Arc::new(Domain::new(id, kind, ids, Arc::clone(&self.alloc)));
        self.domains.write().insert(id, domain);
        log::debug!("smmu: domain {id} ({kind:?}) allocated");
        DomainId(id)
    }

    /// Free a domain with no attached streams.
    pub fn domain_free(&self, id: DomainId) -> Result<(), SmmuError> {
        let mut domains = self.domains.write();
        let domain = domains.get(&id.0).ok_or(SmmuError::NotFound)?;
        if domain.is_attached() {
            return Err(SmmuError::Busy);
        }
        domains.remove(&id.0);
        Ok(())
    }

    /// Look up a domain.
    pub fn domain(&self, id: DomainId) -> Result<Arc<Domain>, SmmuError> {
        self.domains.read().get(&id.0).cloned().ok_or(SmmuError::NotFound)
    }

    pub fn attach(
        &self,
        domain: DomainId,
        device: DeviceId,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        let device = self.device(device)?;
        self.domain(domain)?.attach(&device, sid, ssid)
    }

    pub fn detach(
        &self,
        domain: DomainId,
        device: DeviceId,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        let device = self.device(device)?;
        self.domain(domain)?.detach(&device, sid, ssid)
    }

    // -- Translation

    pub fn map(
        &self,
        domain: DomainId,
        iova: u64,
        paddr: PhysAddr,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), SmmuError> {
        self.domain(domain)?.map(iova, paddr, size, prot)
    }

    /// Unmap `[iova, iova + size)`, returning the bytes unmapped.
    pub fn unmap(&self, domain: DomainId, iova: u64, size: u64) -> Result<u64, SmmuError> {
        self.domain(domain)?.unmap(iova, size)
    }

    pub fn iova_to_phys(&self, domain: DomainId, iova: u64) -> Result<PhysAddr, SmmuError> {
        self.domain(domain)?.iova_to_phys(iova)
    }

    /// Invalidate every TLB entry of the domain on every controller.
    pub fn flush_domain(&self, domain: DomainId) -> Result<(), SmmuError> {
        self.domain(domain)?.flush_all()
    }

    /// Map host range `[start, end)` one to one into an identity domain.
    pub fn idmap(
        &self,
        domain: DomainId,
        start: u64,
        end: u64,
        prot: IommuProt,
    ) -> Result<(), SmmuError> {
        self.domain(domain)?.idmap(start, end, prot)
    }

    pub fn idunmap(&self, domain: DomainId, start: u64, end: u64) -> Result<(), SmmuError> {
        self.domain(domain)?.idunmap(start, end)
    }

    // -- Per-controller queries

    /// ASID tagging the stage 1 translations of `(sid, ssid)`.
    pub fn asid_for_device(
        &self,
        device: DeviceId,
        sid: u32,
        ssid: u32,
    ) -> Result<u16, SmmuError> {
        self.device(device)?.asid_for(sid, ssid)
    }

    /// IOVA windows to keep out of every domain attached to `device`.
    pub fn reserved_regions(&self, device: DeviceId) -> Result<&'static [ReservedRegion], SmmuError> {
        Ok(self.device(device)?.reserved_regions())
    }

    pub fn set_fault_handler(
        &self,
        device: DeviceId,
        sid: u32,
        handler: Arc<dyn FaultHandler>,
    ) -> Result<(), SmmuError> {
        self.device(device)?.set_fault_handler(sid, handler)
    }

    /// Service a controller's interrupt: global errors first, then one
    /// budget of events. Returns the number of events handled.
    pub fn process_events(&self, device: DeviceId) -> Result<usize, SmmuError> {
        let device = self.device(device)?;
        device.handle_gerror()?;
        Ok(device.handle_events())
    }
}

impl core::fmt::Debug for SmmuRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuRegistry")
            .field("devices", &self.devices.read().len())
            .field("domains", &self.domains.read().len())
            .field("asids", &*self.asids)
            .field("vmids", &*self.vmids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::Command;
    use crate::device::tests::test_config;
    use crate::sim::{SimConfig, SimSmmu};
    use warden_common::HeapFrameAllocator;
    use warden_common::memory::page::SIZE_4K;

    fn registry() -> SmmuRegistry {
        let alloc: Arc<dyn FrameAllocator> = Arc::new(HeapFrameAllocator::new());
        SmmuRegistry::init(test_config(), alloc)
    }

    fn add_device(reg: &SmmuRegistry, cfg: SimConfig) -> (Arc<SimSmmu>, Result<DeviceId, SmmuError>) {
        let sim = Arc::new(SimSmmu::new(cfg));
        let id = reg.probe_device(sim.clone(), DeviceDescriptor::default());
        (sim, id)
    }

    #[test]
    fn test_failed_probe_keeps_other_devices() {
        let reg = registry();
        let (_, first) = add_device(&reg, SimConfig::default());
        let (_, broken) = add_device(
            &reg,
            SimConfig {
                stage1: false,
                stage2: false,
                ..SimConfig::default()
            },
        );
        assert_eq!(first, Ok(DeviceId(0)));
        assert_eq!(broken, Err(SmmuError::Configuration));
        assert_eq!(reg.device_count(), 1);
        let (_, second) = add_device(&reg, SimConfig::default());
        assert_eq!(second, Ok(DeviceId(1)));
    }

    #[test]
    fn test_stage1_domain_end_to_end() {
        let reg = registry();
        let (sim, dev) = add_device(&reg, SimConfig::default());
        let dev = dev.unwrap();
        let dom = reg.domain_alloc(DomainKind::Stage1);

        reg.attach(dom, dev, 3, None).unwrap();
        let asid = reg.asid_for_device(dev, 3, 0).unwrap();
        assert_eq!(reg.domain(dom).unwrap().tag(), Some(asid));

        let pa = PhysAddr::new(0x9000_0000);
        reg.map(dom, 0x4000, pa, 2 * SIZE_4K, IommuProt::RW_CACHED).unwrap();
        assert_eq!(reg.iova_to_phys(dom, 0x5010), Ok(pa.offset(0x1010)));
        assert_eq!(reg.unmap(dom, 0x4000, 2 * SIZE_4K), Ok(2 * SIZE_4K));

        sim.clear_log();
        reg.flush_domain(dom).unwrap();
        assert!(sim.commands().contains(&Command::TlbiNhAsid { asid, vmid: 0 }));

        assert_eq!(reg.domain_free(dom), Err(SmmuError::Busy));
        reg.detach(dom, dev, 3, None).unwrap();
        reg.domain_free(dom).unwrap();
        assert!(reg.domain(dom).is_err());
    }

    #[test]
    fn test_unknown_handles() {
        let reg = registry();
        let dom = reg.domain_alloc(DomainKind::Stage2);
        assert_eq!(reg.attach(dom, DeviceId(7), 0, None), Err(SmmuError::NotFound));
        assert_eq!(reg.domain_free(DomainId(999)), Err(SmmuError::NotFound));
        assert_eq!(reg.iova_to_phys(DomainId(999), 0), Err(SmmuError::NotFound));
    }

    #[test]
    fn test_asid_and_vmid_spaces_are_separate() {
        let reg = registry();
        let (_, dev) = add_device(&reg, SimConfig::default());
        let dev = dev.unwrap();
        let s1 = reg.domain_alloc(DomainKind::Stage1);
        let s2 = reg.domain_alloc(DomainKind::Stage2);
        reg.attach(s1, dev, 1, None).unwrap();
        reg.attach(s2, dev, 2, None).unwrap();
        assert_eq!(reg.domain(s1).unwrap().tag(), Some(1));
        assert_eq!(reg.domain(s2).unwrap().tag(), Some(1));
    }

    #[test]
    fn test_reserved_regions_and_events() {
        let reg = registry();
        let (_, dev) = add_device(&reg, SimConfig::default());
        let dev = dev.unwrap();
        assert!(!reg.reserved_regions(dev).unwrap().is_empty());
        assert_eq!(reg.process_events(dev), Ok(0));
    }

    #[test]
    fn test_teardown_disables_devices() {
        let reg = registry();
        let (sim, dev) = add_device(&reg, SimConfig::default());
        let dev = dev.unwrap();
        let dom = reg.domain_alloc(DomainKind::Stage2);
        reg.attach(dom, dev, 1, None).unwrap();
        reg.teardown();
        assert_eq!(sim.read32(crate::regs::SMMU_CR0), 0);
        assert_eq!(reg.device_count(), 0);
        assert!(reg.domain(dom).is_err());
    }
}
