//! One SMMU controller
//!
//! [`SmmuDevice`] owns a controller's command queue, event queue and stream
//! table, plus the per-stream state layered on them: the CD table of a
//! stage 1 stream, whether a stream is bound to a stage 2 domain, and who
//! hears about the stream's faults. Domains drive it through the attach and
//! detach calls and submit their TLB maintenance through
//! [`SmmuDevice::batch`].
//!
//! # Reset sequence
//!
//! 1. CR0 = 0 (translation and queues off), wait for CR0ACK
//! 2. CR1/CR2 (table and queue attributes, invalid-SID recording)
//! 3. stream table base, command queue base, CR0 = CMDQEN
//! 4. CFGI_ALL + TLBI_NSNH_ALL + CMD_SYNC
//! 5. event queue base, CR0 |= EVTQEN
//! 6. clear stale global errors, enable interrupts
//! 7. GBPA = abort (write with UPDATE, wait for UPDATE to clear)
//! 8. CR0 |= SMMUEN (and ATSCHK with ATS)

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use spin::{Mutex, RwLock};
use tock_registers::LocalRegisterCopy;
use tock_registers::fields::Field;
use warden_common::FrameAllocator;
use warden_mmio::{PollConfig, RegisterIo, clamp_log2size, poll_until};
use warden_pgtable::{Stage1Regs, Stage2Regs};

use crate::caps::{Caps, Features, Quirks, ReservedRegion};
use crate::cd::{Cd, CdSync, CdTable};
use crate::cmd::{Command, SyncCompletion};
use crate::cmdq::{Cmdq, CommandBatch};
use crate::config::{
    BATCH_ENTRIES, DeviceDescriptor, MAX_CD_TABLE_SSID_BITS, STRTAB_SPLIT, SmmuConfig,
};
use crate::entry::WriteMode;
use crate::error::SmmuError;
use crate::evtq::{Evtq, FaultHandler, FaultRecord};
use crate::regs::{
    CACHE_WB, CR0, CR1, CR2, GBPA, GERROR, IRQ_CTRL, SH_ISH, SMMU_CMDQ_BASE, SMMU_CMDQ_CONS,
    SMMU_CMDQ_PROD, SMMU_CR0, SMMU_CR0ACK, SMMU_CR1, SMMU_CR2, SMMU_EVTQ_BASE, SMMU_EVTQ_CONS,
    SMMU_EVTQ_PROD, SMMU_GBPA, SMMU_GERROR, SMMU_GERRORN, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK,
    SMMU_STRTAB_BASE, SMMU_STRTAB_BASE_CFG,
};
use crate::ste::{Ste, SteMode, SteSync};
use crate::strtab::{StreamTable, StrtabLayout};

/// Code carried by [`SmmuError::HardwareFault`] when the controller entered
/// service failure mode
pub const FATAL_GERROR: u8 = 0xff;

/// ATC_INV size covering the whole address space
const ATC_INV_SIZE_ALL: u8 = 52;

/// Global errors that are reported and acknowledged.
const GERROR_REPORTS: [(Field<u32, GERROR::Register>, &str); 6] = [
    (GERROR::EVTQ_ABT_ERR, "event queue write aborted"),
    (GERROR::PRIQ_ABT_ERR, "PRI queue write aborted"),
    (GERROR::MSI_CMDQ_ABT_ERR, "CMDQ MSI write aborted"),
    (GERROR::MSI_EVTQ_ABT_ERR, "EVTQ MSI write aborted"),
    (GERROR::MSI_PRIQ_ABT_ERR, "PRIQ MSI write aborted"),
    (GERROR::MSI_GERROR_ABT_ERR, "GERROR MSI write aborted"),
];

/// Configuration of one stream beyond its STE.
#[derive(Default)]
struct StreamState {
    /// CD table of a stage 1 stream, anchored by substream 0
    cd_table: Option<CdTable>,
    /// Bound to a stage 2 domain
    stage2: bool,
}

/// Hardware structures of a controller, for [`SmmuDevice::from_parts`].
pub struct DeviceParts {
    pub caps: Caps,
    pub cmdq: Cmdq,
    pub evtq: Evtq,
    pub strtab: StreamTable,
}

/// A probed SMMU controller.
pub struct SmmuDevice {
    index: usize,
    desc: DeviceDescriptor,
    config: SmmuConfig,
    io: Arc<dyn RegisterIo>,
    caps: Caps,
    alloc: Arc<dyn FrameAllocator>,
    cmdq: Cmdq,
    evtq: Evtq,
    strtab: StreamTable,
    /// Attach and detach of one stream serialize on its entry
    streams: Mutex<BTreeMap<u32, Arc<Mutex<StreamState>>>>,
    fault_handlers: RwLock<BTreeMap<u32, Arc<dyn FaultHandler>>>,
}

impl SmmuDevice {
    /// Read the controller's capabilities and allocate its queues and
    /// stream table. The controller is not touched beyond its ID registers
    /// until [`reset`](Self::reset).
    pub fn probe(
        index: usize,
        io: Arc<dyn RegisterIo>,
        desc: DeviceDescriptor,
        config: SmmuConfig,
        alloc: Arc<dyn FrameAllocator>,
    ) -> Result<Self, SmmuError> {
        let caps = Caps::probe(&*io, &desc, &config)?;

        // A full batch plus its sync must fit.
        let cmdq_log2 =
            clamp_log2size(config.cmdq_log2size, caps.cmdq_max_log2, BATCH_ENTRIES as u32 + 1)?;
        let evtq_log2 = clamp_log2size(config.evtq_log2size, caps.evtq_max_log2, 1)?;

        let sync_cs = if caps.features.contains(Features::SEV) {
            SyncCompletion::Sev
        } else {
            SyncCompletion::None
        };
        let poll = PollConfig {
            use_wfe: config.poll.use_wfe || sync_cs == SyncCompletion::Sev,
            ..config.poll
        };
        let cmdq = Cmdq::new(
            &alloc,
            cmdq_log2,
            poll,
            sync_cs,
            caps.quirks.contains(Quirks::CMDQ_FORCE_SYNC),
        )?;
        let evtq = Evtq::new(&alloc, evtq_log2)?;

        let layout = if caps.sid_bits > config.linear_strtab_max_bits
            && caps.sid_bits >= STRTAB_SPLIT
            && caps.features.contains(Features::TWO_LVL_STRTAB)
        {
            StrtabLayout::TwoLevel
        } else {
            StrtabLayout::Linear
        };
        let strtab = StreamTable::new(&alloc, caps.sid_bits, layout)?;

        log::info!(
            "smmu{index}: {:#x}: cmdq 2^{cmdq_log2}, evtq 2^{evtq_log2}, {layout:?} stream table for {} sid bits",
            desc.base,
            caps.sid_bits
        );

        Ok(Self::from_parts(
            index,
            io,
            desc,
            config,
            alloc,
            DeviceParts {
                caps,
                cmdq,
                evtq,
                strtab,
            },
        ))
    }

    /// Assemble a controller from queues and a stream table built by the
    /// caller, such as memory adopted from another agent. `alloc` backs the
    /// stream table leaves and CD tables allocated later.
    #[must_use]
    pub fn from_parts(
        index: usize,
        io: Arc<dyn RegisterIo>,
        desc: DeviceDescriptor,
        config: SmmuConfig,
        alloc: Arc<dyn FrameAllocator>,
        parts: DeviceParts,
    ) -> Self {
        Self {
            index,
            desc,
            config,
            io,
            caps: parts.caps,
            alloc,
            cmdq: parts.cmdq,
            evtq: parts.evtq,
            strtab: parts.strtab,
            streams: Mutex::new(BTreeMap::new()),
            fault_handlers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Bring the controller from any state to translating, with every
    /// unconfigured stream aborting.
    pub fn reset(&self) -> Result<(), SmmuError> {
        let io = &*self.io;
        let cr0 = LocalRegisterCopy::<u32, CR0::Register>::new(io.read32(SMMU_CR0));
        if cr0.is_set(CR0::SMMUEN) {
            log::warn!("smmu{}: already enabled, resetting", self.index);
        }
        self.write_cr0(0)?;

        let mut cr1 = LocalRegisterCopy::<u32, CR1::Register>::new(0);
        cr1.write(
            CR1::QUEUE_IC.val(CACHE_WB)
                + CR1::QUEUE_OC.val(CACHE_WB)
                + CR1::QUEUE_SH.val(SH_ISH)
                + CR1::TABLE_IC.val(CACHE_WB)
                + CR1::TABLE_OC.val(CACHE_WB)
                + CR1::TABLE_SH.val(SH_ISH),
        );
        io.write32(SMMU_CR1, cr1.get());

        let mut cr2 = LocalRegisterCopy::<u32, CR2::Register>::new(0);
        cr2.write(CR2::RECINVSID::SET);
        if !self.caps.features.contains(Features::BTM) {
            cr2.modify(CR2::PTM::SET);
        }
        io.write32(SMMU_CR2, cr2.get());

        io.write64(SMMU_STRTAB_BASE, self.strtab.base_register());
        io.write32(SMMU_STRTAB_BASE_CFG, self.strtab.cfg_register());

        io.write64(SMMU_CMDQ_BASE, self.cmdq.base_register());
        io.write32(SMMU_CMDQ_PROD, 0);
        io.write32(SMMU_CMDQ_CONS, 0);
        self.cmdq.reset_indices();
        let mut enables = CR0::CMDQEN::SET.value;
        self.write_cr0(enables)?;

        self.cmdq
            .issue(io, &[Command::CfgiAll, Command::TlbiNsnhAll], true)?;

        io.write64(SMMU_EVTQ_BASE, self.evtq.base_register());
        io.write32(SMMU_EVTQ_PROD, 0);
        io.write32(SMMU_EVTQ_CONS, 0);
        self.evtq.reset_indices();
        enables |= CR0::EVTQEN::SET.value;
        self.write_cr0(enables)?;

        self.handle_gerror()?;
        self.write_irq_ctrl(IRQ_CTRL::GERROR_IRQEN::SET.value | IRQ_CTRL::EVTQ_IRQEN::SET.value)?;
        self.set_gbpa_abort()?;

        if self.caps.features.contains(Features::ATS) {
            enables |= CR0::ATSCHK::SET.value;
        }
        enables |= CR0::SMMUEN::SET.value;
        self.write_cr0(enables)?;

        log::info!("smmu{}: enabled", self.index);
        Ok(())
    }

    /// Stop translation and queue processing. Incoming transactions abort
    /// (GBPA).
    pub fn disable(&self) -> Result<(), SmmuError> {
        self.write_cr0(0)?;
        self.write_irq_ctrl(0)
    }

    fn write_cr0(&self, value: u32) -> Result<(), SmmuError> {
        self.io.write32(SMMU_CR0, value);
        poll_until(&self.config.poll, || self.io.read32(SMMU_CR0ACK) == value).map_err(|_| {
            log::error!("smmu{}: CR0 {value:#x} not acknowledged", self.index);
            SmmuError::Timeout
        })
    }

    fn write_irq_ctrl(&self, value: u32) -> Result<(), SmmuError> {
        self.io.write32(SMMU_IRQ_CTRL, value);
        poll_until(&self.config.poll, || self.io.read32(SMMU_IRQ_CTRLACK) == value)?;
        Ok(())
    }

    fn set_gbpa_abort(&self) -> Result<(), SmmuError> {
        let updated = || self.io.read32(SMMU_GBPA) & GBPA::UPDATE::SET.value == 0;
        poll_until(&self.config.poll, &updated)?;
        let gbpa = self.io.read32(SMMU_GBPA) | GBPA::ABORT::SET.value | GBPA::UPDATE::SET.value;
        self.io.write32(SMMU_GBPA, gbpa);
        poll_until(&self.config.poll, &updated).map_err(|_| {
            log::error!("smmu{}: GBPA update not acknowledged", self.index);
            SmmuError::Timeout
        })
    }

    // -- Accessors

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[inline]
    #[must_use]
    pub const fn caps(&self) -> &Caps {
        &self.caps
    }

    #[inline]
    #[must_use]
    pub const fn descriptor(&self) -> &DeviceDescriptor {
        &self.desc
    }

    #[inline]
    #[must_use]
    pub const fn stream_table(&self) -> &StreamTable {
        &self.strtab
    }

    /// IOVA windows of this implementation that domains must keep clear.
    #[must_use]
    pub fn reserved_regions(&self) -> &'static [ReservedRegion] {
        self.caps.implementation.reserved_regions()
    }

    /// Check whether streams are configured to accept ATS translated
    /// requests.
    #[inline]
    #[must_use]
    pub fn ats_enabled(&self) -> bool {
        self.caps.features.contains(Features::ATS)
    }

    /// Current STE of `sid`.
    pub fn ste(&self, sid: u32) -> Result<Ste, SmmuError> {
        self.strtab.get(sid)
    }

    /// Start a batch of commands for this controller.
    #[must_use]
    pub fn batch(&self) -> CommandBatch<'_, dyn RegisterIo> {
        self.cmdq.batch(&*self.io)
    }

    // -- Stream configuration

    fn stream(&self, sid: u32) -> Result<Arc<Mutex<StreamState>>, SmmuError> {
        if u64::from(sid) >> self.caps.sid_bits != 0 {
            return Err(SmmuError::InvalidStreamId);
        }
        Ok(Arc::clone(self.streams.lock().entry(sid).or_default()))
    }

    fn stream_is_free(&self, sid: u32) -> Result<bool, SmmuError> {
        Ok(matches!(
            self.strtab.get(sid)?.mode(),
            SteMode::Abort | SteMode::Disabled
        ))
    }

    /// Install `ste` for `sid`, then prefetch it unless the implementation
    /// cannot.
    pub fn install_ste(&self, sid: u32, ste: &Ste) -> Result<WriteMode, SmmuError> {
        let io = &*self.io;
        let mode = self
            .strtab
            .write(sid, ste, &mut SteSync::new(&self.cmdq, io, sid))?;
        if ste.is_valid()
            && mode != WriteMode::Unchanged
            && !self.caps.quirks.contains(Quirks::SKIP_PREFETCH)
        {
            self.cmdq.issue(io, &[Command::PrefetchConfig { sid }], false)?;
        }
        log::debug!("smmu{}: sid {sid:#x} -> {:?} ({mode:?})", self.index, ste.mode());
        Ok(mode)
    }

    /// Point substream `ssid` of `sid` at a stage 1 table tagged `asid`.
    ///
    /// Substream 0 creates the stream's CD table; other substreams need it.
    pub fn attach_stage1(
        &self,
        sid: u32,
        ssid: u32,
        asid: u16,
        regs: &Stage1Regs,
    ) -> Result<(), SmmuError> {
        let stream = self.stream(sid)?;
        let mut state = stream.lock();
        if state.stage2 {
            return Err(SmmuError::Busy);
        }
        let table_bits = self.caps.ssid_bits.min(MAX_CD_TABLE_SSID_BITS);
        if u64::from(ssid) >> table_bits != 0 {
            return Err(SmmuError::InvalidArgument);
        }

        let created = state.cd_table.is_none();
        if created {
            if ssid != 0 {
                return Err(SmmuError::NotFound);
            }
            if !self.stream_is_free(sid)? {
                return Err(SmmuError::Busy);
            }
            state.cd_table = Some(CdTable::new(&self.alloc, table_bits)?);
        }
        let io = &*self.io;
        let table = state.cd_table.as_mut().ok_or(SmmuError::NotFound)?;
        if table.get(ssid)?.is_valid() {
            return Err(SmmuError::Busy);
        }

        if let Err(err) = table.write(
            ssid,
            &Cd::new(asid, regs),
            &mut CdSync::new(&self.cmdq, io, sid, ssid),
        ) {
            if created {
                state.cd_table = None;
            }
            return Err(err);
        }

        let stall_disable = self.caps.features.contains(Features::STALLS)
            && !self.caps.features.contains(Features::STALL_FORCE);
        let target = Ste::stage1(
            table.base(),
            table.ssid_bits(),
            self.ats_enabled(),
            stall_disable,
        );
        let Err(err) = self.install_ste(sid, &target) else {
            return Ok(());
        };

        // Undo the CD, and the table if this attach created it. The stream
        // may already point at the table: it must abort before the table
        // goes.
        if let Err(cd_err) = table.write(
            ssid,
            &Cd::disabled(),
            &mut CdSync::new(&self.cmdq, io, sid, ssid),
        ) {
            log::warn!("smmu{}: sid {sid:#x} ssid {ssid}: CD rollback failed: {cd_err}", self.index);
        }
        if created {
            match self.install_ste(sid, &Ste::abort()) {
                Ok(_) => state.cd_table = None,
                Err(ste_err) => log::error!(
                    "smmu{}: sid {sid:#x}: STE rollback failed ({ste_err}), keeping CD table",
                    self.index
                ),
            }
        }
        Err(err)
    }

    /// Disable substream `ssid` of `sid`.
    ///
    /// Substream 0 goes last: it fails with [`SmmuError::Busy`] while other
    /// substreams are live, and takes the CD table with it.
    pub fn detach_stage1(&self, sid: u32, ssid: u32) -> Result<(), SmmuError> {
        let stream = self.stream(sid)?;
        let mut state = stream.lock();
        let io = &*self.io;
        let table = state.cd_table.as_mut().ok_or(SmmuError::NotFound)?;
        if !table.get(ssid)?.is_valid() {
            return Err(SmmuError::NotFound);
        }

        if ssid != 0 {
            table.write(
                ssid,
                &Cd::disabled(),
                &mut CdSync::new(&self.cmdq, io, sid, ssid),
            )?;
            return self.inv_atc(sid, Some(ssid));
        }

        if table.has_secondary_substreams() {
            return Err(SmmuError::Busy);
        }
        // The stream lets go of the table before it is freed.
        self.install_ste(sid, &Ste::abort())?;
        self.cmdq.issue_sync(io, Command::CfgiCdAll { sid })?;
        self.inv_atc(sid, None)?;
        state.cd_table = None;
        Ok(())
    }

    /// Translate `sid` through a stage 2 table tagged `vmid`.
    pub fn attach_stage2(&self, sid: u32, vmid: u16, regs: &Stage2Regs) -> Result<(), SmmuError> {
        let stream = self.stream(sid)?;
        let mut state = stream.lock();
        if state.stage2 || state.cd_table.is_some() || !self.stream_is_free(sid)? {
            return Err(SmmuError::Busy);
        }
        self.install_ste(sid, &Ste::stage2(vmid, regs, self.ats_enabled()))?;
        state.stage2 = true;
        Ok(())
    }

    /// Return a stage 2 stream to abort.
    pub fn detach_stage2(&self, sid: u32) -> Result<(), SmmuError> {
        let stream = self.stream(sid)?;
        let mut state = stream.lock();
        if !state.stage2 {
            return Err(SmmuError::NotFound);
        }
        self.install_ste(sid, &Ste::abort())?;
        self.inv_atc(sid, None)?;
        state.stage2 = false;
        Ok(())
    }

    /// ASID the CD of (`sid`, `ssid`) carries.
    pub fn asid_for(&self, sid: u32, ssid: u32) -> Result<u16, SmmuError> {
        let stream = self.stream(sid)?;
        let state = stream.lock();
        let table = state.cd_table.as_ref().ok_or(SmmuError::NotFound)?;
        table.get(ssid)?.asid().ok_or(SmmuError::NotFound)
    }

    fn inv_atc(&self, sid: u32, ssid: Option<u32>) -> Result<(), SmmuError> {
        if !self.ats_enabled() {
            return Ok(());
        }
        self.cmdq.issue_sync(
            &*self.io,
            Command::AtcInv {
                sid,
                ssid,
                addr: 0,
                size_log2: ATC_INV_SIZE_ALL,
                global: false,
            },
        )
    }

    // -- Faults

    /// Route faults of `sid` to `handler`.
    pub fn set_fault_handler(
        &self,
        sid: u32,
        handler: Arc<dyn FaultHandler>,
    ) -> Result<(), SmmuError> {
        if u64::from(sid) >> self.caps.sid_bits != 0 {
            return Err(SmmuError::InvalidStreamId);
        }
        self.fault_handlers.write().insert(sid, handler);
        Ok(())
    }

    /// Stop routing faults of `sid`. Returns whether a handler was set.
    pub fn clear_fault_handler(&self, sid: u32) -> bool {
        self.fault_handlers.write().remove(&sid).is_some()
    }

    /// Drain up to one budget of events, handing each to the handler of its
    /// stream. Returns the number of events handled.
    pub fn handle_events(&self) -> usize {
        let handlers = self.fault_handlers.read();
        self.evtq
            .drain(&*self.io, self.config.evtq_budget, |record| {
                match handlers.get(&record.sid) {
                    Some(handler) => handler.on_fault(&record),
                    None => self.log_fault(&record),
                }
            })
    }

    fn log_fault(&self, record: &FaultRecord) {
        if record.kind.is_translation_fault() {
            log::error!(
                "smmu{}: {:?} fault (no handler): sid={:#x} ssid={:?} addr={:#x} {}",
                self.index,
                record.kind,
                record.sid,
                record.ssid,
                record.addr,
                if record.read { "read" } else { "write" }
            );
        } else {
            log::warn!(
                "smmu{}: event {:?} (no handler): sid={:#x}",
                self.index,
                record.kind,
                record.sid
            );
        }
    }

    /// Report and acknowledge active global errors.
    ///
    /// A command queue error is recovered through the command queue. Service
    /// failure mode disables the controller and is fatal.
    pub fn handle_gerror(&self) -> Result<(), SmmuError> {
        let io = &*self.io;
        let gerror = io.read32(SMMU_GERROR);
        let gerrorn = io.read32(SMMU_GERRORN);
        let active = LocalRegisterCopy::<u32, GERROR::Register>::new(gerror ^ gerrorn);
        if active.get() == 0 {
            return Ok(());
        }

        log::warn!("smmu{}: global errors active: {:#x}", self.index, active.get());
        if active.is_set(GERROR::SFM_ERR) {
            log::error!("smmu{}: device has entered service failure mode", self.index);
            self.disable()?;
            return Err(SmmuError::HardwareFault(FATAL_GERROR));
        }
        for (field, what) in GERROR_REPORTS {
            if active.is_set(field) {
                log::warn!("smmu{}: {what}", self.index);
            }
        }

        if active.is_set(GERROR::CMDQ_ERR) {
            self.cmdq.recover(io);
        }
        let rest = active.get() & !GERROR::CMDQ_ERR::SET.value;
        if rest != 0 {
            let gerrorn = io.read32(SMMU_GERRORN);
            io.write32(SMMU_GERRORN, gerrorn ^ rest);
        }
        Ok(())
    }
}

impl core::fmt::Debug for SmmuDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuDevice")
            .field("index", &self.index)
            .field("base", &format_args!("{:#x}", self.desc.base))
            .field("caps", &self.caps)
            .field("cmdq", &self.cmdq)
            .field("evtq", &self.evtq)
            .field("strtab", &self.strtab)
            .finish_non_exhaustive()
    }
}
