//! Host identity map
//!
//! Identity domains let devices reach host memory one to one while keeping
//! them out of everything the hypervisor owns. The map follows ownership:
//! donated pages are punched out of every identity domain and reclaimed
//! pages are mapped back.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::RwLock;
use warden_pgtable::IommuProt;
use warden_smmu::SmmuError;

use crate::domain::HypDomain;
use crate::ownership::OwnershipMap;

/// Identity domains and the host memory they cover.
pub struct HostIdmap {
    /// Host RAM as `[start, end)` ranges
    memory: Vec<(u64, u64)>,
    domains: RwLock<Vec<Arc<HypDomain>>>,
}

impl HostIdmap {
    #[must_use]
    pub fn new(memory: &[(u64, u64)]) -> Self {
        Self {
            memory: memory.to_vec(),
            domains: RwLock::new(Vec::new()),
        }
    }

    /// Map host memory into a new identity domain, minus every page that is
    /// not currently the host's.
    pub fn register(
        &self,
        domain: &Arc<HypDomain>,
        ownership: &OwnershipMap,
    ) -> Result<(), SmmuError> {
        let inner = domain.inner();
        for &(start, end) in &self.memory {
            inner.idmap(start, end, IommuProt::RW_CACHED)?;
        }
        for (start, end) in ownership.non_host_runs() {
            Self::punch(domain, start, end);
        }
        self.domains.write().push(Arc::clone(domain));
        Ok(())
    }

    /// Check whether `[start, end)` lies inside one host memory range.
    #[must_use]
    pub fn covers(&self, start: u64, end: u64) -> bool {
        self.memory
            .iter()
            .any(|&(mem_start, mem_end)| mem_start <= start && end <= mem_end)
    }

    pub fn unregister(&self, id: u32) {
        self.domains.write().retain(|d| d.id() != id);
    }

    /// Pages `[start, end)` left the host.
    pub fn on_donate(&self, start: u64, end: u64) {
        for domain in self.domains.read().iter() {
            Self::punch(domain, start, end);
        }
    }

    /// Pages `[start, end)` are the host's again.
    pub fn on_reclaim(&self, start: u64, end: u64) {
        for &(mem_start, mem_end) in &self.memory {
            let (s, e) = (start.max(mem_start), end.min(mem_end));
            if s >= e {
                continue;
            }
            for domain in self.domains.read().iter() {
                if let Err(err) = domain.inner().idmap(s, e, IommuProt::RW_CACHED) {
                    log::error!("hyp: domain {}: identity map of {s:#x}..{e:#x} failed: {err}", domain.id());
                }
            }
        }
    }

    fn punch(domain: &HypDomain, start: u64, end: u64) {
        match domain.inner().idunmap(start, end) {
            Ok(()) | Err(SmmuError::NotFound) => {}
            Err(err) => log::error!(
                "hyp: domain {}: identity unmap of {start:#x}..{end:#x} failed: {err}",
                domain.id()
            ),
        }
    }
}

impl core::fmt::Debug for HostIdmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HostIdmap")
            .field("memory", &self.memory)
            .field("domains", &self.domains.read().len())
            .finish()
    }
}
