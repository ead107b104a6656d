//! Translation domains
//!
//! A [`Domain`] is one I/O page table plus the identifier that tags its TLB
//! entries (an ASID for stage 1, a VMID for stage 2), shared by every stream
//! attached to it.
//!
//! ```text
//! Unbound --first attach--> Bound(1) --attach/detach--> Bound(n)
//!    ^                                                     |
//!    +------- last detach: invalidate, free table + id ----+
//! ```
//!
//! The page table is built at first attach, from the capabilities of the
//! first controller; later attaches are checked against it. Invalidations
//! fan out to every attached controller, one command batch per controller.
//!
//! An identity domain maps host physical ranges one to one (`idmap`), using
//! the largest page sizes the alignment allows. Ranges registered before
//! the domain is bound are mapped when it binds.
//!
//! Lock order: `binding`, then `state`, then `devices`. Attach and detach
//! serialize on `binding` and only hold `state` to bind, unbind or read the
//! table registers, so they do not wait for map and unmap.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};
use warden_common::{FrameAllocator, PhysAddr};
use warden_pgtable::{
    FlushOps, IoPageTable, IoPgtableCfg, IoPgtableFormat, IommuProt, IotlbGather, Stage1Regs,
    Stage2Regs,
};

use crate::caps::{Caps, Features};
use crate::cmd::{Command, TlbiRange};
use crate::device::SmmuDevice;
use crate::error::SmmuError;
use crate::ids::IdAllocator;
use crate::range::{InvChunk, InvRange};

/// From this many granules on, a controller without range invalidation
/// invalidates the whole domain instead.
pub const MAX_TLBI_OPS: u64 = 512;

/// Page table input size for stage 1
const STAGE1_MAX_IAS: u32 = 48;

/// What a domain translates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    /// VA to PA, tagged by ASID, substreams allowed
    Stage1,
    /// IPA to PA, tagged by VMID
    Stage2,
    /// Stage 2 table mapping host ranges one to one
    Identity,
}

impl DomainKind {
    #[inline]
    #[must_use]
    pub const fn is_stage1(self) -> bool {
        matches!(self, Self::Stage1)
    }

    const fn format(self) -> IoPgtableFormat {
        match self {
            Self::Stage1 => IoPgtableFormat::Stage1,
            Self::Stage2 | Self::Identity => IoPgtableFormat::Stage2,
        }
    }

    /// Identifier width of `caps` for this kind.
    const fn tag_bits(self, caps: &Caps) -> u32 {
        if self.is_stage1() {
            caps.asid_bits
        } else {
            caps.vmid_bits
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamRef {
    sid: u32,
    ssid: Option<u32>,
}

/// One controller and the streams of it attached to the domain.
struct DeviceNode {
    device: Arc<SmmuDevice>,
    streams: Vec<StreamRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IdentityRange {
    start: u64,
    end: u64,
    prot: IommuProt,
}

struct Bound {
    pgtable: IoPageTable,
    tag: u16,
}

#[derive(Default)]
struct DomainState {
    bound: Option<Bound>,
    identity: Vec<IdentityRange>,
}

/// Table registers a stream is pointed at.
#[derive(Clone, Copy)]
enum TableRegs {
    Stage1(Stage1Regs),
    Stage2(Stage2Regs),
}

/// A translation context shared by attached streams.
pub struct Domain {
    id: u32,
    kind: DomainKind,
    /// Held across attach and detach; guards binding and unbinding
    binding: Mutex<()>,
    state: Mutex<DomainState>,
    devices: RwLock<Vec<DeviceNode>>,
    ids: Arc<IdAllocator>,
    alloc: Arc<dyn FrameAllocator>,
}

impl Domain {
    /// Create an unbound domain. `ids` is the ASID space for stage 1 and
    /// the VMID space otherwise.
    #[must_use]
    pub fn new(
        id: u32,
        kind: DomainKind,
        ids: Arc<IdAllocator>,
        alloc: Arc<dyn FrameAllocator>,
    ) -> Self {
        Self {
            id,
            kind,
            binding: Mutex::new(()),
            state: Mutex::new(DomainState::default()),
            devices: RwLock::new(Vec::new()),
            ids,
            alloc,
        }
    }

    #[inline]
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> DomainKind {
        self.kind
    }

    /// ASID or VMID, once bound.
    #[must_use]
    pub fn tag(&self) -> Option<u16> {
        self.state.lock().bound.as_ref().map(|b| b.tag)
    }

    /// Attached streams, across all controllers.
    #[must_use]
    pub fn attachments(&self) -> usize {
        self.devices.read().iter().map(|n| n.streams.len()).sum()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        !self.devices.read().is_empty()
    }

    // -- Attachment

    /// Attach stream `sid` (substream `ssid`) of `device`.
    ///
    /// The first attach builds the page table from the controller's
    /// capabilities and allocates the domain's identifier.
    pub fn attach(
        &self,
        device: &Arc<SmmuDevice>,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        let caps = device.caps();
        if !caps.supports_stage(self.kind.is_stage1()) {
            log::warn!(
                "domain {}: smmu{} cannot translate {:?}",
                self.id,
                device.index(),
                self.kind
            );
            return Err(SmmuError::Configuration);
        }
        if ssid.is_some() && !self.kind.is_stage1() {
            return Err(SmmuError::Busy);
        }

        let _binding = self.binding.lock();
        let (tag, regs) = {
            let mut state = self.state.lock();
            if state.bound.is_none() {
                // Replaying identity ranges may flush, which reads `devices`.
                let bound = self.bind(caps, &state.identity)?;
                state.bound = Some(bound);
            }
            let bound = state.bound.as_ref().ok_or(SmmuError::NotFound)?;
            let compatible = self.check_compatible(bound, caps);
            let regs = match self.kind {
                DomainKind::Stage1 => TableRegs::Stage1(bound.pgtable.stage1_regs()),
                DomainKind::Stage2 | DomainKind::Identity => {
                    TableRegs::Stage2(bound.pgtable.stage2_regs())
                }
            };
            (compatible.map(|()| bound.tag), regs)
        };

        let mut devices = self.devices.write();
        let stream = StreamRef { sid, ssid };
        let result = tag.and_then(|tag| {
            if devices
                .iter()
                .any(|n| Arc::ptr_eq(&n.device, device) && n.streams.contains(&stream))
            {
                return Err(SmmuError::Busy);
            }
            match regs {
                TableRegs::Stage1(regs) => {
                    device.attach_stage1(sid, ssid.unwrap_or(0), tag, &regs)
                }
                TableRegs::Stage2(regs) => device.attach_stage2(sid, tag, &regs),
            }
        });
        if let Err(err) = result {
            let unused = devices.is_empty();
            drop(devices);
            if unused {
                self.unbind(&mut self.state.lock());
            }
            return Err(err);
        }

        match devices.iter_mut().find(|n| Arc::ptr_eq(&n.device, device)) {
            Some(node) => node.streams.push(stream),
            None => devices.push(DeviceNode {
                device: Arc::clone(device),
                streams: alloc::vec![stream],
            }),
        }
        log::debug!(
            "domain {}: attached smmu{} sid {sid:#x} ssid {ssid:?}",
            self.id,
            device.index()
        );
        Ok(())
    }

    /// Detach a stream attached with [`attach`](Self::attach).
    ///
    /// A controller's last stream leaving invalidates the domain's
    /// identifier on that controller; the last stream overall frees the
    /// page table and the identifier.
    pub fn detach(
        &self,
        device: &Arc<SmmuDevice>,
        sid: u32,
        ssid: Option<u32>,
    ) -> Result<(), SmmuError> {
        let _binding = self.binding.lock();
        let tag = self.tag();
        let mut devices = self.devices.write();
        let stream = StreamRef { sid, ssid };
        let ni = devices
            .iter()
            .position(|n| Arc::ptr_eq(&n.device, device))
            .ok_or(SmmuError::NotFound)?;
        let si = devices[ni]
            .streams
            .iter()
            .position(|s| *s == stream)
            .ok_or(SmmuError::NotFound)?;

        match self.kind {
            DomainKind::Stage1 => device.detach_stage1(sid, ssid.unwrap_or(0))?,
            DomainKind::Stage2 | DomainKind::Identity => device.detach_stage2(sid)?,
        }
        devices[ni].streams.swap_remove(si);

        if devices[ni].streams.is_empty() {
            let node = devices.swap_remove(ni);
            if let Some(tag) = tag {
                let mut batch = node.device.batch();
                let flushed = batch
                    .add(self.inv_all_command(tag))
                    .and_then(|()| batch.submit());
                if let Err(err) = flushed {
                    log::warn!(
                        "domain {}: invalidation on smmu{} failed: {err}",
                        self.id,
                        node.device.index()
                    );
                }
            }
        }
        let unused = devices.is_empty();
        drop(devices);
        if unused {
            self.unbind(&mut self.state.lock());
        }
        Ok(())
    }

    fn bind(&self, caps: &Caps, identity: &[IdentityRange]) -> Result<Bound, SmmuError> {
        let (ias, oas) = match self.kind {
            DomainKind::Stage1 => (caps.ias.min(STAGE1_MAX_IAS), caps.ias),
            DomainKind::Stage2 | DomainKind::Identity => (caps.ias, caps.oas),
        };
        let cfg = IoPgtableCfg {
            fmt: self.kind.format(),
            pgsize_bitmap: caps.pgsize_bitmap,
            ias,
            oas,
            coherent_walk: caps.features.contains(Features::COHERENCY),
        }
        .finalize()?;

        let tag = self
            .ids
            .alloc(self.kind.tag_bits(caps))
            .ok_or(SmmuError::OutOfMemory)?;
        let pgtable = match IoPageTable::new(cfg, Arc::clone(&self.alloc)) {
            Ok(pgtable) => pgtable,
            Err(err) => {
                self.ids.free(tag);
                return Err(err.into());
            }
        };
        let mut bound = Bound { pgtable, tag };

        for range in identity {
            if let Err(err) = self.map_identity(&mut bound, range) {
                bound.pgtable.free();
                self.ids.free(tag);
                return Err(err);
            }
        }
        log::debug!("domain {}: bound, {:?} tag {tag}", self.id, self.kind);
        Ok(bound)
    }

    fn unbind(&self, state: &mut DomainState) {
        if let Some(bound) = state.bound.take() {
            log::debug!("domain {}: unbound, releasing tag {}", self.id, bound.tag);
            bound.pgtable.free();
            self.ids.free(bound.tag);
        }
    }

    fn check_compatible(&self, bound: &Bound, caps: &Caps) -> Result<(), SmmuError> {
        let cfg = bound.pgtable.cfg();
        let fits = cfg.pgsize_bitmap & !caps.pgsize_bitmap == 0
            && u32::from(bound.tag) >> self.kind.tag_bits(caps) == 0
            && match self.kind {
                DomainKind::Stage1 => cfg.oas <= caps.ias,
                DomainKind::Stage2 | DomainKind::Identity => {
                    cfg.ias <= caps.ias && cfg.oas <= caps.oas
                }
            };
        if fits {
            Ok(())
        } else {
            log::warn!("domain {}: page table does not fit the controller", self.id);
            Err(SmmuError::Configuration)
        }
    }

    // -- Mapping

    /// Map `[iova, iova + size)` to `paddr`.
    ///
    /// Uses the largest page sizes the alignment of both addresses allows.
    /// A partial mapping is undone before the error is returned.
    pub fn map(
        &self,
        iova: u64,
        paddr: PhysAddr,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), SmmuError> {
        if self.kind == DomainKind::Identity || !prot.is_accessible() {
            return Err(SmmuError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let bound = state.bound.as_mut().ok_or(SmmuError::NotFound)?;
        self.map_locked(bound, iova, paddr, size, prot)
    }

    fn map_locked(
        &self,
        bound: &mut Bound,
        iova: u64,
        paddr: PhysAddr,
        size: u64,
        prot: IommuProt,
    ) -> Result<(), SmmuError> {
        let granule = bound.pgtable.cfg().granule();
        let bitmap = bound.pgtable.cfg().pgsize_bitmap;
        if size == 0 || (iova | paddr.as_u64() | size) & (granule - 1) != 0 {
            return Err(SmmuError::InvalidArgument);
        }
        iova.checked_add(size).ok_or(SmmuError::InvalidArgument)?;

        let mut done = 0;
        while done < size {
            let (va, pa) = (iova + done, paddr.offset(done));
            let (pgsize, count) =
                pgsize_for(bitmap, va, pa.as_u64(), size - done).ok_or(SmmuError::InvalidArgument)?;
            let mut mapped = 0;
            let result = bound
                .pgtable
                .map_pages(va, pa, pgsize, count, prot, &mut mapped);
            done += mapped;
            let result = match result {
                Ok(()) if mapped == 0 => Err(warden_pgtable::PgtableError::OutOfRange),
                other => other,
            };
            if let Err(err) = result {
                log::debug!("domain {}: map at {va:#x} failed: {err}", self.id);
                if done > 0 {
                    self.unmap_locked(bound, iova, done);
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Unmap `[iova, iova + size)`. Returns the bytes unmapped, which is
    /// short of `size` when the range has a hole.
    ///
    /// Every attached controller has invalidated the range, and tables the
    /// unmap emptied are freed, before this returns.
    pub fn unmap(&self, iova: u64, size: u64) -> Result<u64, SmmuError> {
        self.unmap_with(iova, size, |_, _, _| {})
    }

    /// [`unmap`](Self::unmap), calling `unmapped(iova, pa, size)` for each
    /// leaf the call removed.
    ///
    /// Leaves are reported under the same lock as the unmap, so two callers
    /// racing on one range never both see the same leaf.
    pub fn unmap_with<F>(&self, iova: u64, size: u64, mut unmapped: F) -> Result<u64, SmmuError>
    where
        F: FnMut(u64, PhysAddr, u64),
    {
        if self.kind == DomainKind::Identity {
            return Err(SmmuError::InvalidArgument);
        }
        let mut state = self.state.lock();
        let bound = state.bound.as_mut().ok_or(SmmuError::NotFound)?;
        let cfg = bound.pgtable.cfg();
        let end = iova.checked_add(size).ok_or(SmmuError::InvalidArgument)?;
        if (iova | size) & (cfg.granule() - 1) != 0 || end > 1u64 << cfg.ias {
            return Err(SmmuError::InvalidArgument);
        }

        let mut leaves = Vec::new();
        bound.pgtable.walk(iova, size, |va, pa, len| {
            if va >= iova && va + len <= end {
                leaves.push((va, pa, len));
            }
        });
        let done = self.unmap_locked(bound, iova, size);
        for (va, pa, len) in leaves {
            if bound.pgtable.iova_to_phys(va).is_none() {
                unmapped(va, pa, len);
            }
        }
        Ok(done)
    }

    fn unmap_locked(&self, bound: &mut Bound, iova: u64, size: u64) -> u64 {
        let bitmap = bound.pgtable.cfg().pgsize_bitmap;
        let flush = DomainFlush {
            domain: self,
            tag: bound.tag,
            pgsize_bitmap: bitmap,
        };
        let mut gather = IotlbGather::new();

        let mut unmapped = 0;
        while unmapped < size {
            let va = iova + unmapped;
            let Some((pgsize, count)) = pgsize_for(bitmap, va, va, size - unmapped) else {
                break;
            };
            let n = bound
                .pgtable
                .unmap_pages(va, pgsize, count, &mut gather, &flush);
            if n == 0 {
                break;
            }
            unmapped += n;
        }

        if let Some((start, len)) = gather.range() {
            let granule = gather
                .leaf_size()
                .unwrap_or_else(|| bound.pgtable.cfg().granule());
            let leaf = gather.freed_tables() == 0;
            if let Err(err) = self.invalidate_range(bound.tag, start, len, granule, leaf, bitmap) {
                // Walkers may still hold the freed tables.
                log::error!(
                    "domain {}: invalidation failed ({err}), leaking {} tables",
                    self.id,
                    gather.freed_tables()
                );
                drop(gather.take_freelist());
                return unmapped;
            }
        }
        bound.pgtable.release_freelist(&mut gather);
        unmapped
    }

    /// Output address of `iova`.
    pub fn iova_to_phys(&self, iova: u64) -> Result<PhysAddr, SmmuError> {
        let state = self.state.lock();
        let bound = state.bound.as_ref().ok_or(SmmuError::NotFound)?;
        bound.pgtable.iova_to_phys(iova).ok_or(SmmuError::NotFound)
    }

    // -- Identity ranges

    /// Map host range `[start, end)` one to one, clamped to the output
    /// address size.
    ///
    /// Fails with [`SmmuError::Busy`] if the range overlaps one already
    /// mapped.
    pub fn idmap(&self, start: u64, end: u64, prot: IommuProt) -> Result<(), SmmuError> {
        if self.kind != DomainKind::Identity
            || !prot.is_accessible()
            || start >= end
            || (start | end) & (warden_common::memory::page::SIZE_4K - 1) != 0
        {
            return Err(SmmuError::InvalidArgument);
        }
        let mut state = self.state.lock();
        if state
            .identity
            .iter()
            .any(|r| r.start < end && start < r.end)
        {
            return Err(SmmuError::Busy);
        }

        let range = IdentityRange { start, end, prot };
        if let Some(bound) = state.bound.as_mut() {
            self.map_identity(bound, &range)?;
        }
        state.identity.push(range);
        Ok(())
    }

    /// Remove `[start, end)` from the identity map.
    ///
    /// Ranges straddling the boundaries are split; their remainders stay
    /// mapped.
    pub fn idunmap(&self, start: u64, end: u64) -> Result<(), SmmuError> {
        if self.kind != DomainKind::Identity
            || start >= end
            || (start | end) & (warden_common::memory::page::SIZE_4K - 1) != 0
        {
            return Err(SmmuError::InvalidArgument);
        }
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (hit, mut kept): (Vec<_>, Vec<_>) = state
            .identity
            .drain(..)
            .partition(|r| r.start < end && start < r.end);
        if hit.is_empty() {
            state.identity = kept;
            return Err(SmmuError::NotFound);
        }

        let mut leftovers = Vec::new();
        for r in &hit {
            if r.start < start {
                leftovers.push(IdentityRange { end: start, ..*r });
            }
            if end < r.end {
                leftovers.push(IdentityRange { start: end, ..*r });
            }
        }

        if let Some(bound) = state.bound.as_mut() {
            // Blocks may straddle the boundaries: drop whole ranges, then
            // map what is left.
            for r in &hit {
                if let Some((s, e)) = self.clamp(bound, r) {
                    self.unmap_locked(bound, s, e - s);
                }
            }
            for r in &leftovers {
                if let Err(err) = self.map_identity(bound, r) {
                    log::error!(
                        "domain {}: remapping {:#x}..{:#x} failed: {err}",
                        self.id,
                        r.start,
                        r.end
                    );
                }
            }
        }
        kept.extend(leftovers);
        state.identity = kept;
        Ok(())
    }

    fn clamp(&self, bound: &Bound, range: &IdentityRange) -> Option<(u64, u64)> {
        let oas = bound.pgtable.cfg().oas;
        let limit = 1u64.checked_shl(oas).unwrap_or(u64::MAX);
        let end = range.end.min(limit);
        (range.start < end).then_some((range.start, end))
    }

    fn map_identity(&self, bound: &mut Bound, range: &IdentityRange) -> Result<(), SmmuError> {
        match self.clamp(bound, range) {
            Some((start, end)) => {
                self.map_locked(bound, start, PhysAddr::new(start), end - start, range.prot)
            }
            None => Ok(()),
        }
    }

    // -- Invalidation

    /// Invalidate every translation of the domain on every controller.
    pub fn flush_all(&self) -> Result<(), SmmuError> {
        let Some(tag) = self.tag() else {
            return Ok(());
        };
        self.invalidate_all(tag)
    }

    fn invalidate_all(&self, tag: u16) -> Result<(), SmmuError> {
        let devices = self.devices.read();
        let mut result = Ok(());
        for node in devices.iter() {
            let mut batch = node.device.batch();
            let flushed = batch
                .add(self.inv_all_command(tag))
                .and_then(|()| add_atc_invalidations(&mut batch, node, 0, u64::MAX))
                .and_then(|()| batch.submit());
            if let Err(err) = flushed {
                log::warn!("domain {}: smmu{} invalidation failed: {err}", self.id, node.device.index());
                result = result.and(Err(err));
            }
        }
        result
    }

    fn invalidate_range(
        &self,
        tag: u16,
        start: u64,
        size: u64,
        granule: u64,
        leaf: bool,
        pgsize_bitmap: u64,
    ) -> Result<(), SmmuError> {
        let devices = self.devices.read();
        let mut result = Ok(());
        for node in devices.iter() {
            let range_inv = node.device.caps().features.contains(Features::RANGE_INV);
            let mut batch = node.device.batch();
            let mut flushed = Ok(());
            if !range_inv && size / granule.max(1) >= MAX_TLBI_OPS {
                flushed = batch.add(self.inv_all_command(tag));
            } else {
                for chunk in InvRange::new(start, size, granule, leaf, pgsize_bitmap, range_inv) {
                    flushed = batch.add(self.range_command(tag, &chunk, leaf));
                    if flushed.is_err() {
                        break;
                    }
                }
            }
            let flushed = flushed
                .and_then(|()| add_atc_invalidations(&mut batch, node, start, size))
                .and_then(|()| batch.submit());
            if let Err(err) = flushed {
                log::warn!("domain {}: smmu{} invalidation failed: {err}", self.id, node.device.index());
                result = result.and(Err(err));
            }
        }
        result
    }

    const fn inv_all_command(&self, tag: u16) -> Command {
        match self.kind {
            DomainKind::Stage1 => Command::TlbiNhAsid { asid: tag, vmid: 0 },
            DomainKind::Stage2 | DomainKind::Identity => Command::TlbiS12Vmall { vmid: tag },
        }
    }

    fn range_command(&self, tag: u16, chunk: &InvChunk, leaf: bool) -> Command {
        let mut range = TlbiRange {
            addr: chunk.addr,
            leaf,
            ttl: chunk.ttl,
            tg: chunk.tg,
            num: chunk.num,
            scale: chunk.scale,
            ..TlbiRange::default()
        };
        if self.kind.is_stage1() {
            range.asid = tag;
            Command::TlbiNhVa(range)
        } else {
            range.vmid = tag;
            Command::TlbiS2Ipa(range)
        }
    }
}

/// Queue ATC invalidations of `[start, start + size)` for the ATS-enabled
/// streams of `node`.
fn add_atc_invalidations<R>(
    batch: &mut crate::cmdq::CommandBatch<'_, R>,
    node: &DeviceNode,
    start: u64,
    size: u64,
) -> Result<(), SmmuError>
where
    R: warden_mmio::RegisterIo + ?Sized,
{
    if !node.device.ats_enabled() {
        return Ok(());
    }
    let (addr, size_log2) = atc_span(start, size);
    for stream in &node.streams {
        batch.add(Command::AtcInv {
            sid: stream.sid,
            ssid: stream.ssid,
            addr,
            size_log2,
            global: false,
        })?;
    }
    Ok(())
}

/// Smallest naturally aligned span of 4KB pages covering the range, as an
/// ATC_INV address and log2 page count.
fn atc_span(start: u64, size: u64) -> (u64, u8) {
    const ALL: u8 = 52;
    if size == 0 || start.checked_add(size).is_none() {
        return (0, ALL);
    }
    let first = start >> 12;
    let last = (start + size - 1) >> 12;
    let log2 = u64::BITS - (first ^ last).leading_zeros();
    if log2 >= u32::from(ALL) {
        return (0, ALL);
    }
    ((first & !((1u64 << log2) - 1)) << 12, log2 as u8)
}

/// Largest page size for mapping `size` bytes at `iova` to `paddr`, and how
/// many of them to map before a larger size becomes possible.
fn pgsize_for(bitmap: u64, iova: u64, paddr: u64, size: u64) -> Option<(u64, u64)> {
    let addr_merge = iova | paddr;
    let mut sizes = bitmap & mask_through(size.checked_ilog2()?);
    if addr_merge != 0 {
        sizes &= mask_through(addr_merge.trailing_zeros());
    }
    let idx = sizes.checked_ilog2()?;
    let pgsize = 1u64 << idx;

    let mut span = size;
    let bigger = bitmap & !mask_through(idx);
    if bigger != 0 {
        let next = 1u64 << bigger.trailing_zeros();
        if (iova ^ paddr) & (next - 1) == 0 {
            let offset = next - (addr_merge & (next - 1));
            if offset + next <= size {
                span = offset;
            }
        }
    }
    Some((pgsize, span >> idx))
}

/// Bits `0..=bit`.
const fn mask_through(bit: u32) -> u64 {
    if bit >= 63 {
        u64::MAX
    } else {
        (1u64 << (bit + 1)) - 1
    }
}

/// [`FlushOps`] of a bound domain: walk flushes go out at once to every
/// attached controller.
struct DomainFlush<'a> {
    domain: &'a Domain,
    tag: u16,
    pgsize_bitmap: u64,
}

impl FlushOps for DomainFlush<'_> {
    fn flush_all(&self) {
        if let Err(err) = self.domain.invalidate_all(self.tag) {
            log::error!("domain {}: flush failed: {err}", self.domain.id);
        }
    }

    fn flush_walk(&self, iova: u64, size: u64, granule: u64) {
        if let Err(err) =
            self.domain
                .invalidate_range(self.tag, iova, size, granule, false, self.pgsize_bitmap)
        {
            log::error!("domain {}: walk flush at {iova:#x} failed: {err}", self.domain.id);
        }
    }
}

impl core::fmt::Debug for Domain {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Domain")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("tag", &self.tag())
            .field("attachments", &self.attachments())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::cmd::opcode;
    use crate::config::DeviceDescriptor;
    use crate::device::tests::setup_with;
    use crate::ids::MAX_ID_BITS;
    use crate::sim::{SimConfig, SimSmmu};
    use warden_common::HeapFrameAllocator;
    use warden_common::memory::page::{SIZE_1G, SIZE_2M, SIZE_4K};

    const BITMAP: u64 = SIZE_4K | SIZE_2M | SIZE_1G;

    struct Fixture {
        sim: Arc<SimSmmu>,
        frames: Arc<HeapFrameAllocator>,
        device: Arc<SmmuDevice>,
        ids: Arc<IdAllocator>,
    }

    impl Fixture {
        fn new(cfg: SimConfig) -> Self {
            let (sim, frames, device) = setup_with(cfg, DeviceDescriptor::default());
            Self {
                sim,
                frames,
                device: Arc::new(device),
                ids: Arc::new(IdAllocator::new(MAX_ID_BITS)),
            }
        }

        fn domain(&self, kind: DomainKind) -> Domain {
            let alloc: Arc<dyn FrameAllocator> = self.frames.clone();
            Domain::new(1, kind, Arc::clone(&self.ids), alloc)
        }
    }

    #[test]
    fn test_pgsize_for_prefers_blocks() {
        assert_eq!(pgsize_for(BITMAP, 0x20_0000, 0x4020_0000, 2 * SIZE_2M), Some((SIZE_2M, 2)));
        // 4KB pages up to the next 2MB boundary
        assert_eq!(pgsize_for(BITMAP, 0x1f_f000, 0x1f_f000, 0x20_1000), Some((SIZE_4K, 1)));
        // Addresses that can never share a block stay at 4KB
        assert_eq!(pgsize_for(BITMAP, 0x20_0000, 0x1000, 4 * SIZE_2M), Some((SIZE_4K, 2048)));
        assert_eq!(pgsize_for(BITMAP, 0x800, 0x800, SIZE_4K), None);
    }

    #[test]
    fn test_atc_span() {
        assert_eq!(atc_span(0x1000, 0x1000), (0x1000, 0));
        assert_eq!(atc_span(0x1000, 0x2000), (0, 2));
        assert_eq!(atc_span(0, u64::MAX), (0, 52));
    }

    #[test]
    fn test_stage1_map_translate_unmap() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage1);
        domain.attach(&fx.device, 1, None).unwrap();
        let asid = domain.tag().unwrap();
        assert_eq!(fx.device.asid_for(1, 0), Ok(asid));

        let pa = PhysAddr::new(0x8000_0000);
        domain.map(0x1000, pa, SIZE_4K, IommuProt::RW_CACHED).unwrap();
        assert_eq!(domain.iova_to_phys(0x1000), Ok(pa));
        assert_eq!(domain.iova_to_phys(0x1234), Ok(pa.offset(0x234)));

        fx.sim.clear_log();
        assert_eq!(domain.unmap(0x1000, SIZE_4K), Ok(SIZE_4K));
        assert_eq!(domain.iova_to_phys(0x1000), Err(SmmuError::NotFound));
        assert!(fx.sim.commands().iter().any(
            |c| matches!(c, Command::TlbiNhVa(r) if r.asid == asid && r.addr == 0x1000)
        ));
    }

    #[test]
    fn test_stage2_flush_is_one_batch_per_controller() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage2);
        domain.attach(&fx.device, 1, None).unwrap();
        domain.attach(&fx.device, 2, None).unwrap();
        let vmid = domain.tag().unwrap();
        assert_eq!(domain.attachments(), 2);

        fx.sim.clear_log();
        domain.flush_all().unwrap();
        let batches = fx.sim.batches();
        assert_eq!(batches.len(), 1);
        let vmalls = batches[0]
            .iter()
            .filter(|c| **c == Command::TlbiS12Vmall { vmid })
            .count();
        assert_eq!(vmalls, 1);
        assert_eq!(batches[0].last().map(Command::opcode), Some(opcode::CMD_SYNC));
    }

    #[test]
    fn test_last_detach_releases_identifier() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage2);
        domain.attach(&fx.device, 1, None).unwrap();
        domain.attach(&fx.device, 2, None).unwrap();
        let vmid = domain.tag().unwrap();
        assert_eq!(fx.ids.in_use(), 1);

        domain.detach(&fx.device, 1, None).unwrap();
        assert!(domain.tag().is_some());
        fx.sim.clear_log();
        domain.detach(&fx.device, 2, None).unwrap();
        assert!(fx.sim.commands().contains(&Command::TlbiS12Vmall { vmid }));
        assert_eq!(domain.tag(), None);
        assert_eq!(fx.ids.in_use(), 0);
        assert_eq!(domain.detach(&fx.device, 2, None), Err(SmmuError::NotFound));
    }

    #[test]
    fn test_attach_checks_stage_support() {
        let fx = Fixture::new(SimConfig {
            stage1: false,
            ..SimConfig::default()
        });
        let domain = fx.domain(DomainKind::Stage1);
        assert_eq!(domain.attach(&fx.device, 1, None), Err(SmmuError::Configuration));
        assert_eq!(fx.ids.in_use(), 0);
    }

    #[test]
    fn test_substream_on_stage2_is_busy() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage2);
        assert_eq!(domain.attach(&fx.device, 1, Some(1)), Err(SmmuError::Busy));
    }

    #[test]
    fn test_failed_first_attach_unbinds() {
        let fx = Fixture::new(SimConfig::default());
        let stage1 = fx.domain(DomainKind::Stage1);
        stage1.attach(&fx.device, 1, None).unwrap();

        let stage2 = fx.domain(DomainKind::Stage2);
        assert_eq!(stage2.attach(&fx.device, 1, None), Err(SmmuError::Busy));
        assert_eq!(stage2.tag(), None);
        assert_eq!(fx.ids.in_use(), 1);
    }

    #[test]
    fn test_unmap_reports_removed_leaves() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage2);
        domain.attach(&fx.device, 1, None).unwrap();
        let pa = PhysAddr::new(0x8000_0000);
        domain.map(0, pa, SIZE_2M, IommuProt::RW_CACHED).unwrap();
        domain.map(SIZE_2M, pa, SIZE_4K, IommuProt::READ).unwrap();
        domain.map(SIZE_2M + SIZE_4K, pa, SIZE_4K, IommuProt::READ).unwrap();

        let mut seen = Vec::new();
        let done = domain
            .unmap_with(0, SIZE_2M + SIZE_4K, |va, pa, len| seen.push((va, pa, len)))
            .unwrap();
        assert_eq!(done, SIZE_2M + SIZE_4K);
        assert_eq!(seen, alloc::vec![(0, pa, SIZE_2M), (SIZE_2M, pa, SIZE_4K)]);
        assert_eq!(domain.iova_to_phys(SIZE_2M + SIZE_4K), Ok(pa));

        // A second caller on the same range is told about nothing.
        seen.clear();
        let done = domain
            .unmap_with(0, SIZE_2M + SIZE_4K, |va, pa, len| seen.push((va, pa, len)))
            .unwrap();
        assert_eq!(done, 0);
        assert!(seen.is_empty());
    }

    #[test]
    fn test_unmap_rejects_ranges_past_input_size() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage1);
        domain.attach(&fx.device, 1, None).unwrap();
        assert_eq!(
            domain.unmap(u64::MAX & !(SIZE_4K - 1), SIZE_4K),
            Err(SmmuError::InvalidArgument)
        );
        assert_eq!(
            domain.unmap(SIZE_4K, u64::MAX & !(SIZE_4K - 1)),
            Err(SmmuError::InvalidArgument)
        );
        assert_eq!(domain.unmap(1 << 48, SIZE_4K), Err(SmmuError::InvalidArgument));
        assert_eq!(domain.unmap(0, SIZE_4K), Ok(0));
    }

    #[test]
    fn test_mapping_does_not_wait_for_attach() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage2);
        domain.attach(&fx.device, 1, None).unwrap();

        // Attach and detach hold `binding` while they program the device.
        let _attaching = domain.binding.lock();
        let pa = PhysAddr::new(0x8000_0000);
        domain.map(0, pa, SIZE_4K, IommuProt::RW_CACHED).unwrap();
        assert_eq!(domain.iova_to_phys(0), Ok(pa));
        assert_eq!(domain.unmap(0, SIZE_4K), Ok(SIZE_4K));
        domain.flush_all().unwrap();
    }

    #[test]
    fn test_map_rejects_bad_requests() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Stage1);
        let pa = PhysAddr::new(0x8000_0000);
        assert_eq!(
            domain.map(0, pa, SIZE_4K, IommuProt::READ),
            Err(SmmuError::NotFound)
        );
        domain.attach(&fx.device, 1, None).unwrap();
        assert_eq!(
            domain.map(0, pa, SIZE_4K, IommuProt::CACHE),
            Err(SmmuError::InvalidArgument)
        );
        assert_eq!(
            domain.map(0x800, pa, SIZE_4K, IommuProt::READ),
            Err(SmmuError::InvalidArgument)
        );
        domain.map(0, pa, SIZE_4K, IommuProt::READ).unwrap();
        assert_eq!(
            domain.map(0, pa, SIZE_4K, IommuProt::READ),
            Err(SmmuError::Busy)
        );
    }

    #[test]
    fn test_large_unmap_without_range_support_invalidates_all() {
        let fx = Fixture::new(SimConfig {
            range_inv: false,
            ..SimConfig::default()
        });
        let domain = fx.domain(DomainKind::Stage1);
        domain.attach(&fx.device, 1, None).unwrap();
        let asid = domain.tag().unwrap();

        // 4KB-aligned physical side keeps the mapping at page granularity
        let size = (MAX_TLBI_OPS + 1) * SIZE_4K;
        domain
            .map(SIZE_2M, PhysAddr::new(0x8000_1000), size, IommuProt::RW_CACHED)
            .unwrap();
        fx.sim.clear_log();
        assert_eq!(domain.unmap(SIZE_2M, size), Ok(size));

        assert!(fx.sim.commands().contains(&Command::TlbiNhAsid { asid, vmid: 0 }));
        assert_eq!(domain.iova_to_phys(SIZE_2M + size - SIZE_4K), Err(SmmuError::NotFound));
    }

    #[test]
    fn test_small_unmap_without_range_support_is_per_page() {
        let fx = Fixture::new(SimConfig {
            range_inv: false,
            ..SimConfig::default()
        });
        let domain = fx.domain(DomainKind::Stage2);
        domain.attach(&fx.device, 1, None).unwrap();
        domain
            .map(0x10_0000, PhysAddr::new(0x8000_0000), 4 * SIZE_4K, IommuProt::RW_CACHED)
            .unwrap();
        fx.sim.clear_log();
        domain.unmap(0x10_0000, 4 * SIZE_4K).unwrap();
        let per_page = fx
            .sim
            .commands()
            .iter()
            .filter(|c| c.opcode() == opcode::TLBI_S2_IPA)
            .count();
        assert_eq!(per_page, 4);
    }

    #[test]
    fn test_identity_ranges_replayed_and_split() {
        let fx = Fixture::new(SimConfig::default());
        let domain = fx.domain(DomainKind::Identity);
        domain.idmap(0x4000_0000, 0x4040_0000, IommuProt::RW_CACHED).unwrap();
        assert_eq!(
            domain.idmap(0x4020_0000, 0x4060_0000, IommuProt::READ),
            Err(SmmuError::Busy)
        );

        domain.attach(&fx.device, 1, None).unwrap();
        assert_eq!(domain.iova_to_phys(0x4030_0000), Ok(PhysAddr::new(0x4030_0000)));

        domain.idunmap(0x4010_0000, 0x4011_0000).unwrap();
        assert_eq!(domain.iova_to_phys(0x4010_8000), Err(SmmuError::NotFound));
        assert_eq!(domain.iova_to_phys(0x400f_f000), Ok(PhysAddr::new(0x400f_f000)));
        assert_eq!(domain.iova_to_phys(0x4011_0000), Ok(PhysAddr::new(0x4011_0000)));
        assert_eq!(domain.idunmap(0x4010_0000, 0x4011_0000), Err(SmmuError::NotFound));
        assert_eq!(
            domain.map(0, PhysAddr::new(0), SIZE_4K, IommuProt::READ),
            Err(SmmuError::InvalidArgument)
        );
    }
}
