//! Hypervisor view of one SMMU
//!
//! The host driver allocates and programs the queues and the stream table,
//! then hands the controller over. [`HypSmmu::probe`] captures what the host
//! programmed, checks it, and takes the memory away from the host: the
//! command queue and stream table are donated, the event queue stays with
//! the host but is shared so the host can keep reading faults.
//!
//! ```text
//! Uninitialized --probe--> Reset --reset--> Active <--resume-- Suspended
//!                            ^                 |                   ^
//!                            +--fatal error----+-------suspend-----+
//! ```

use alloc::sync::Arc;

use spin::{Mutex, Once};
use tock_registers::LocalRegisterCopy;
use warden_common::memory::page;
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::{Queue, RegisterIo};
use warden_smmu::config::BATCH_ENTRIES;
use warden_smmu::evtq::EvtEntry;
use warden_smmu::regs::{
    GBPA, Q_BASE, SMMU_CMDQ_BASE, SMMU_EVTQ_BASE, SMMU_EVTQ_CONS, SMMU_EVTQ_PROD, SMMU_GBPA,
    SMMU_GERROR, SMMU_GERRORN, SMMU_STRTAB_BASE, SMMU_STRTAB_BASE_CFG, STRTAB_BASE,
};
use warden_smmu::{
    Caps, CmdEntry, Cmdq, DeviceDescriptor, DeviceParts, Evtq, Features, SmmuConfig, SmmuDevice,
    SmmuError, StreamTable, SyncCompletion,
};

use crate::ownership::{Donation, OwnershipMap, violation};
use crate::pool::DonatedPool;

/// Lifecycle of a mirrored controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypState {
    Uninitialized,
    /// Structures captured, translation off
    Reset,
    Active,
    /// Translation off, structures kept
    Suspended,
}

/// Host access to a trapped register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmioAccess {
    Read,
    Write(u32),
}

/// Structures taken over at probe.
struct Captured {
    device: Arc<SmmuDevice>,
    _cmdq_pages: Donation,
    _strtab_pages: Donation,
    evtq_pages: (PhysAddr, u64),
}

/// An SMMU under hypervisor control.
pub struct HypSmmu {
    index: usize,
    io: Arc<dyn RegisterIo>,
    desc: DeviceDescriptor,
    config: SmmuConfig,
    ownership: Arc<OwnershipMap>,
    pool: Arc<DonatedPool>,
    state: Mutex<HypState>,
    captured: Once<Captured>,
}

/// A queue base register decoded into its address and log2 size.
fn decode_q_base(value: u64) -> (PhysAddr, u32) {
    let reg = LocalRegisterCopy::<u64, Q_BASE::Register>::new(value);
    (
        PhysAddr::new(reg.read(Q_BASE::ADDR) << 5),
        reg.read(Q_BASE::LOG2SIZE) as u32,
    )
}

/// Pages spanned by `bytes`.
fn pages_for(bytes: usize) -> u64 {
    page::align_up_4k(bytes as u64) >> page::SHIFT_4K
}

impl HypSmmu {
    #[must_use]
    pub fn new(
        index: usize,
        io: Arc<dyn RegisterIo>,
        desc: DeviceDescriptor,
        config: SmmuConfig,
        ownership: Arc<OwnershipMap>,
        pool: Arc<DonatedPool>,
    ) -> Self {
        Self {
            index,
            io,
            desc,
            config,
            ownership,
            pool,
            state: Mutex::new(HypState::Uninitialized),
            captured: Once::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn state(&self) -> HypState {
        *self.state.lock()
    }

    /// Capture and validate what the host programmed, and take ownership of
    /// the command queue and stream table.
    pub fn probe(&self) -> Result<(), SmmuError> {
        let mut state = self.state.lock();
        if *state != HypState::Uninitialized {
            return Err(SmmuError::Busy);
        }
        let io = &*self.io;
        let mut caps = Caps::probe(io, &self.desc, &self.config)?;

        if io.read32(SMMU_GBPA) & GBPA::ABORT::SET.value == 0 {
            log::error!("hyp: smmu{}: GBPA does not abort", self.index);
            return Err(SmmuError::Configuration);
        }

        let (cmdq_base, cmdq_log2) = decode_q_base(io.read64(SMMU_CMDQ_BASE));
        if cmdq_log2 > caps.cmdq_max_log2 || (1usize << cmdq_log2) <= BATCH_ENTRIES {
            log::error!("hyp: smmu{}: command queue of 2^{cmdq_log2} rejected", self.index);
            return Err(SmmuError::Configuration);
        }
        let cmdq_bytes = Queue::<CmdEntry>::memory_size(cmdq_log2);

        let strtab_reg =
            LocalRegisterCopy::<u64, STRTAB_BASE::Register>::new(io.read64(SMMU_STRTAB_BASE));
        let strtab_base = PhysAddr::new(strtab_reg.read(STRTAB_BASE::ADDR) << 6);
        let strtab_cfg = io.read32(SMMU_STRTAB_BASE_CFG);
        let (layout, sid_bits) = StreamTable::parse_cfg(strtab_cfg)?;
        if sid_bits > caps.sid_bits {
            log::error!("hyp: smmu{}: stream table wider than the hardware", self.index);
            return Err(SmmuError::Configuration);
        }
        let strtab_bytes = StreamTable::top_level_size(layout, sid_bits);

        let (evtq_base, evtq_log2) = decode_q_base(io.read64(SMMU_EVTQ_BASE));
        if evtq_log2 > caps.evtq_max_log2 {
            return Err(SmmuError::Configuration);
        }
        let evtq_pages = pages_for(Queue::<EvtEntry>::memory_size(evtq_log2));

        for base in [cmdq_base, strtab_base, evtq_base] {
            if !base.is_page_aligned() {
                log::error!("hyp: smmu{}: {:#x} is not page aligned", self.index, base.as_u64());
                return Err(SmmuError::Configuration);
            }
        }

        let cmdq_pages = self.ownership.donate(cmdq_base, pages_for(cmdq_bytes))?;
        let strtab_pages = self.ownership.donate(strtab_base, pages_for(strtab_bytes))?;
        self.ownership.share(evtq_base, evtq_pages)?;

        let sync_cs = if caps.features.contains(Features::SEV) {
            SyncCompletion::Sev
        } else {
            SyncCompletion::None
        };
        let alloc: Arc<dyn FrameAllocator> = self.pool.clone();
        // SAFETY: the command queue pages were donated above and stay donated
        // as long as `Captured` holds the token; the event queue is pinned
        // shared until the same point
        let parts = unsafe {
            core::ptr::write_bytes(cmdq_base.to_virt().as_mut_ptr::<u8>(), 0, cmdq_bytes);
            let strtab = StreamTable::adopt(&alloc, strtab_base, strtab_cfg);
            strtab.map(|strtab| DeviceParts {
                caps,
                cmdq: Cmdq::adopt(cmdq_base, cmdq_log2, self.config.poll, sync_cs),
                evtq: Evtq::adopt(evtq_base, evtq_log2),
                strtab,
            })
        };
        let mut parts = match parts {
            Ok(parts) => parts,
            Err(err) => {
                self.release_evtq(evtq_base, evtq_pages);
                return Err(err);
            }
        };
        caps.sid_bits = sid_bits;
        parts.caps = caps;

        let device = SmmuDevice::from_parts(
            self.index,
            Arc::clone(&self.io),
            self.desc,
            self.config,
            alloc,
            parts,
        );
        self.captured.call_once(|| Captured {
            device: Arc::new(device),
            _cmdq_pages: cmdq_pages,
            _strtab_pages: strtab_pages,
            evtq_pages: (evtq_base, evtq_pages),
        });
        *state = HypState::Reset;
        log::info!(
            "hyp: smmu{}: captured {layout:?} stream table ({sid_bits} bits), cmdq 2^{cmdq_log2}, evtq 2^{evtq_log2}",
            self.index
        );
        Ok(())
    }

    /// Enable translation of a probed controller.
    pub fn reset(&self) -> Result<(), SmmuError> {
        self.enable(HypState::Reset)
    }

    /// Stop translation, keeping every structure.
    pub fn suspend(&self) -> Result<(), SmmuError> {
        let mut state = self.state.lock();
        if *state != HypState::Active {
            return Err(SmmuError::Busy);
        }
        let device = self.captured_device()?;
        if let Err(err) = device.disable() {
            *state = HypState::Reset;
            return Err(err);
        }
        *state = HypState::Suspended;
        Ok(())
    }

    pub fn resume(&self) -> Result<(), SmmuError> {
        self.enable(HypState::Suspended)
    }

    fn enable(&self, from: HypState) -> Result<(), SmmuError> {
        let mut state = self.state.lock();
        if *state != from {
            return Err(SmmuError::Busy);
        }
        let device = self.captured_device()?;
        match device.reset() {
            Ok(()) => {
                *state = HypState::Active;
                Ok(())
            }
            Err(err) => {
                log::error!("hyp: smmu{}: reset failed: {err}", self.index);
                self.disable(&device);
                *state = HypState::Reset;
                Err(err)
            }
        }
    }

    fn captured_device(&self) -> Result<Arc<SmmuDevice>, SmmuError> {
        self.captured
            .get()
            .map(|c| Arc::clone(&c.device))
            .ok_or(SmmuError::NotFound)
    }

    /// The controller, while it translates.
    pub fn device(&self) -> Result<Arc<SmmuDevice>, SmmuError> {
        if *self.state.lock() != HypState::Active {
            return Err(SmmuError::Busy);
        }
        self.captured_device()
    }

    /// Stop translation, leaving the controller to abort all traffic.
    fn disable(&self, device: &SmmuDevice) {
        if let Err(err) = device.disable() {
            log::error!("hyp: smmu{}: disable failed: {err}", self.index);
        }
    }

    /// Return the event queue pages shared at capture to the host.
    fn release_evtq(&self, base: PhysAddr, pages: u64) {
        if let Err(err) = self.ownership.unshare(base, pages) {
            log::warn!("hyp: smmu{}: event queue pages not returned: {err}", self.index);
        }
    }

    /// Feed the outcome of an operation on the controller back into the
    /// state machine: fatal errors take it back to `Reset`.
    pub fn note<T>(&self, result: Result<T, SmmuError>) -> Result<T, SmmuError> {
        if let Err(err @ (SmmuError::Configuration | SmmuError::HardwareFault(_))) = result {
            let mut state = self.state.lock();
            if *state == HypState::Active {
                log::error!("hyp: smmu{}: {err}, back to reset", self.index);
                if let Ok(device) = self.captured_device() {
                    self.disable(&device);
                }
                *state = HypState::Reset;
            }
        }
        result
    }

    /// Forward a trapped host access to the controller's registers.
    ///
    /// Only 32-bit accesses to the event queue indices and the global error
    /// registers get through; GERROR is read-only. Reads return the register
    /// value, writes return 0.
    pub fn handle_mmio(
        &self,
        offset: usize,
        width: usize,
        access: MmioAccess,
    ) -> Result<u32, SmmuError> {
        let allowed = width == 4
            && offset % 4 == 0
            && match offset {
                SMMU_EVTQ_PROD | SMMU_EVTQ_CONS | SMMU_GERRORN => true,
                SMMU_GERROR => access == MmioAccess::Read,
                _ => false,
            };
        if !allowed {
            return Err(violation("host register access", offset as u64));
        }
        match access {
            MmioAccess::Read => Ok(self.io.read32(offset)),
            MmioAccess::Write(value) => {
                self.io.write32(offset, value);
                Ok(0)
            }
        }
    }
}

impl Drop for HypSmmu {
    fn drop(&mut self) {
        if let Some(captured) = self.captured.get() {
            self.disable(&captured.device);
            let (base, pages) = captured.evtq_pages;
            self.release_evtq(base, pages);
        }
    }
}

impl core::fmt::Debug for HypSmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HypSmmu")
            .field("index", &self.index)
            .field("state", &self.state())
            .finish()
    }
}
