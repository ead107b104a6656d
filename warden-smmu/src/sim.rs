//! Software model of an SMMU
//!
//! [`SimSmmu`] answers register accesses the way a controller would, well
//! enough to run the driver without hardware:
//!
//! - ID registers describe the configured [`SimConfig`]
//! - CR0, IRQ_CTRL and GBPA updates are acknowledged at once
//! - a write to CMDQ_PROD executes the published commands, reading them
//!   from queue memory, and records each one
//! - TLB invalidations act on a small TLB model that tests fill by hand
//! - events are injected into the event queue, with overflow
//!
//! Queue and table addresses are dereferenced through the direct map, so
//! the driver must be given frames from an allocator whose physical
//! addresses are reachable (the heap allocator in tests).

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ptr::{read_volatile, write_volatile};

use spin::Mutex;
use tock_registers::LocalRegisterCopy;
use warden_common::PhysAddr;
use warden_mmio::RegisterIo;
use warden_mmio::queue::OVERFLOW_FLAG;

use crate::cmd::{CmdEntry, Command, TlbiRange};
use crate::entry::ENTRY_QWORDS;
use crate::evtq::EvtEntry;
use crate::regs::{
    BASE_ADDR_MASK, CR0, GBPA, GERROR, IDR0, IDR1, IDR3, IDR5, Q_BASE, SMMU_CMDQ_BASE,
    SMMU_CMDQ_CONS, SMMU_CMDQ_PROD, SMMU_CR0, SMMU_CR0ACK, SMMU_EVTQ_BASE, SMMU_EVTQ_CONS,
    SMMU_EVTQ_PROD, SMMU_GBPA, SMMU_GERROR, SMMU_GERRORN, SMMU_IDR0, SMMU_IDR1, SMMU_IDR3,
    SMMU_IDR5, SMMU_IIDR, SMMU_IRQ_CTRL, SMMU_IRQ_CTRLACK, SMMU_STRTAB_BASE,
    SMMU_STRTAB_BASE_CFG, STRTAB_BASE, STRTAB_BASE_CFG,
};
use crate::ste::Ste;

/// CMDQ_CONS.ERR code for a command the controller cannot decode
const CERROR_ILL: u8 = 1;

/// What the modelled controller implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimConfig {
    pub sid_bits: u32,
    pub ssid_bits: u32,
    pub stage1: bool,
    pub stage2: bool,
    pub iidr: u32,
    pub btm: bool,
    pub two_level: bool,
    pub range_inv: bool,
    pub ats: bool,
    pub sev: bool,
    pub cmdq_max_log2: u32,
    pub evtq_max_log2: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            sid_bits: 16,
            ssid_bits: 10,
            stage1: true,
            stage2: true,
            iidr: 0,
            btm: false,
            two_level: true,
            range_inv: true,
            ats: false,
            sev: false,
            cmdq_max_log2: 19,
            evtq_max_log2: 19,
        }
    }
}

/// Translation regime a modelled TLB entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbTag {
    Asid(u16),
    Vmid(u16),
}

struct SimState {
    cfg: SimConfig,
    regs: BTreeMap<usize, u64>,
    log: Vec<Command>,
    batches: Vec<Vec<Command>>,
    stalled: bool,
    /// One-shot failure: opcode and CMDQ_CONS.ERR code
    fail: Option<(u8, u8)>,
    tlb: Vec<(TlbTag, u64)>,
}

/// A software SMMU behind the [`RegisterIo`] interface.
pub struct SimSmmu {
    inner: Mutex<SimState>,
}

impl SimSmmu {
    #[must_use]
    pub fn new(cfg: SimConfig) -> Self {
        Self {
            inner: Mutex::new(SimState {
                cfg,
                regs: BTreeMap::new(),
                log: Vec::new(),
                batches: Vec::new(),
                stalled: false,
                fail: None,
                tlb: Vec::new(),
            }),
        }
    }

    /// Every command executed so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.inner.lock().log.clone()
    }

    /// Commands grouped by the producer update that published them.
    #[must_use]
    pub fn batches(&self) -> Vec<Vec<Command>> {
        self.inner.lock().batches.clone()
    }

    /// Forget executed commands.
    pub fn clear_log(&self) {
        let mut state = self.inner.lock();
        state.log.clear();
        state.batches.clear();
    }

    /// Stop (or resume) consuming commands.
    pub fn set_stalled(&self, stalled: bool) {
        let mut state = self.inner.lock();
        state.stalled = stalled;
        state.process_cmdq();
    }

    /// Reject the next command with `opcode`, reporting `code` in
    /// CMDQ_CONS.ERR.
    pub fn fail_next(&self, opcode: u8, code: u8) {
        self.inner.lock().fail = Some((opcode, code));
    }

    /// Check whether any global error is active.
    #[must_use]
    pub fn gerror_active(&self) -> bool {
        let state = self.inner.lock();
        state.reg32(SMMU_GERROR) != state.reg32(SMMU_GERRORN)
    }

    /// Activate the global errors in `bits`.
    pub fn raise_gerror(&self, bits: u32) {
        let mut state = self.inner.lock();
        state.raise_gerror(bits);
    }

    /// Write an event record as the controller would.
    ///
    /// Records are dropped while the event queue is disabled. A full queue
    /// signals overflow instead.
    pub fn inject_event(&self, entry: EvtEntry) {
        let mut state = self.inner.lock();
        if state.reg32(SMMU_CR0) & CR0::EVTQEN::SET.value == 0 {
            return;
        }
        let Some((addr, log2)) = state.queue(SMMU_EVTQ_BASE) else {
            return;
        };
        let mask = (2u32 << log2) - 1;
        let prod_reg = state.reg32(SMMU_EVTQ_PROD);
        let cons_reg = state.reg32(SMMU_EVTQ_CONS);
        let (prod, cons) = (prod_reg & mask, cons_reg & mask);

        if prod ^ cons == 1 << log2 {
            if (prod_reg ^ cons_reg) & OVERFLOW_FLAG == 0 {
                state.set32(SMMU_EVTQ_PROD, prod_reg ^ OVERFLOW_FLAG);
            }
            return;
        }

        let slot = addr + u64::from(prod & ((1 << log2) - 1)) * 32;
        for (i, dword) in entry.dwords.iter().enumerate() {
            // SAFETY: the driver programmed EVTQ_BASE with queue memory of
            // 2^log2 32-byte slots
            unsafe { write_volatile(ptr_at(slot + i as u64 * 8), *dword) };
        }
        let next = ((prod + 1) & mask) | (prod_reg & OVERFLOW_FLAG);
        state.set32(SMMU_EVTQ_PROD, next);
    }

    /// Check whether an event queue overflow is unacknowledged.
    #[must_use]
    pub fn evtq_overflowed(&self) -> bool {
        let state = self.inner.lock();
        (state.reg32(SMMU_EVTQ_PROD) ^ state.reg32(SMMU_EVTQ_CONS)) & OVERFLOW_FLAG != 0
    }

    /// STE of `sid` as the controller would fetch it.
    #[must_use]
    pub fn read_ste(&self, sid: u32) -> Option<Ste> {
        let state = self.inner.lock();
        let base = LocalRegisterCopy::<u64, STRTAB_BASE::Register>::new(
            state.reg64(SMMU_STRTAB_BASE),
        );
        let cfg = LocalRegisterCopy::<u32, STRTAB_BASE_CFG::Register>::new(
            state.reg32(SMMU_STRTAB_BASE_CFG),
        );
        let table = base.read(STRTAB_BASE::ADDR) << 6;
        if table == 0 || u64::from(sid) >> cfg.read(STRTAB_BASE_CFG::LOG2SIZE) != 0 {
            return None;
        }

        let ste_addr = match cfg.read_as_enum(STRTAB_BASE_CFG::FMT) {
            Some(STRTAB_BASE_CFG::FMT::Value::Linear) => table + u64::from(sid) * 64,
            Some(STRTAB_BASE_CFG::FMT::Value::TwoLevel) => {
                let split = cfg.read(STRTAB_BASE_CFG::SPLIT);
                // SAFETY: the L1 array covers every sid below 2^LOG2SIZE
                let desc = unsafe { read_volatile(ptr_at(table + u64::from(sid >> split) * 8)) };
                if desc & 0x1f == 0 {
                    return None;
                }
                let index = u64::from(sid & ((1 << split) - 1));
                (desc & BASE_ADDR_MASK) + index * 64
            }
            None => return None,
        };

        let mut words = [0u64; ENTRY_QWORDS];
        for (i, word) in words.iter_mut().enumerate() {
            // SAFETY: ste_addr is an STE inside table memory the driver owns
            *word = unsafe { read_volatile(ptr_at(ste_addr + i as u64 * 8)) };
        }
        Some(Ste(words))
    }

    /// Insert a TLB entry for the 4KB page at `addr`.
    pub fn fill_tlb(&self, tag: TlbTag, addr: u64) {
        self.inner.lock().tlb.push((tag, addr & !0xfff));
    }

    /// Entries still in the TLB model.
    #[must_use]
    pub fn tlb_entries(&self) -> Vec<(TlbTag, u64)> {
        self.inner.lock().tlb.clone()
    }
}

fn ptr_at(addr: u64) -> *mut u64 {
    PhysAddr::new(addr).to_virt().as_mut_ptr()
}

impl SimState {
    fn reg32(&self, offset: usize) -> u32 {
        self.regs.get(&offset).copied().unwrap_or(0) as u32
    }

    fn reg64(&self, offset: usize) -> u64 {
        self.regs.get(&offset).copied().unwrap_or(0)
    }

    fn set32(&mut self, offset: usize, value: u32) {
        self.regs.insert(offset, u64::from(value));
    }

    fn idr0(&self) -> u32 {
        let cfg = &self.cfg;
        let mut idr0 = LocalRegisterCopy::<u32, IDR0::Register>::new(0);
        idr0.write(
            IDR0::TTF::AArch64
                + IDR0::TTENDIAN::Little
                + IDR0::STALL_MODEL::Terminate
                + IDR0::ASID16::SET
                + IDR0::VMID16::SET,
        );
        let mut bits = idr0.get();
        for (present, bit) in [
            (cfg.stage1, IDR0::S1P::SET.value),
            (cfg.stage2, IDR0::S2P::SET.value),
            (cfg.btm, IDR0::BTM::SET.value),
            (cfg.ats, IDR0::ATS::SET.value),
            (cfg.sev, IDR0::SEV::SET.value),
            (cfg.two_level, IDR0::ST_LEVEL::TwoLevel.value),
        ] {
            if present {
                bits |= bit;
            }
        }
        bits
    }

    fn idr1(&self) -> u32 {
        let mut idr1 = LocalRegisterCopy::<u32, IDR1::Register>::new(0);
        idr1.write(
            IDR1::SIDSIZE.val(self.cfg.sid_bits)
                + IDR1::SSIDSIZE.val(self.cfg.ssid_bits)
                + IDR1::EVTQS.val(self.cfg.evtq_max_log2)
                + IDR1::CMDQS.val(self.cfg.cmdq_max_log2),
        );
        idr1.get()
    }

    fn read32(&self, offset: usize) -> u32 {
        match offset {
            SMMU_IDR0 => self.idr0(),
            SMMU_IDR1 => self.idr1(),
            SMMU_IDR3 if self.cfg.range_inv => IDR3::RIL::SET.value,
            SMMU_IDR3 => 0,
            SMMU_IDR5 => (IDR5::OAS::Bits48 + IDR5::GRAN4K::SET).value,
            SMMU_IIDR => self.cfg.iidr,
            _ => self.reg32(offset),
        }
    }

    fn write32(&mut self, offset: usize, value: u32) {
        match offset {
            SMMU_CR0 => {
                self.set32(SMMU_CR0, value);
                self.set32(SMMU_CR0ACK, value);
                self.process_cmdq();
            }
            SMMU_IRQ_CTRL => {
                self.set32(SMMU_IRQ_CTRL, value);
                self.set32(SMMU_IRQ_CTRLACK, value);
            }
            SMMU_GBPA => self.set32(SMMU_GBPA, value & !GBPA::UPDATE::SET.value),
            SMMU_GERRORN => {
                self.set32(SMMU_GERRORN, value);
                if !self.cmdq_error_active() {
                    let cons = self.reg32(SMMU_CMDQ_CONS) & !(0x7f << 24);
                    self.set32(SMMU_CMDQ_CONS, cons);
                    self.process_cmdq();
                }
            }
            SMMU_CMDQ_PROD => {
                self.set32(SMMU_CMDQ_PROD, value);
                self.process_cmdq();
            }
            _ => self.set32(offset, value),
        }
    }

    fn raise_gerror(&mut self, bits: u32) {
        let active = self.reg32(SMMU_GERROR) ^ self.reg32(SMMU_GERRORN);
        let gerror = self.reg32(SMMU_GERROR) ^ (bits & !active);
        self.set32(SMMU_GERROR, gerror);
    }

    fn cmdq_error_active(&self) -> bool {
        (self.reg32(SMMU_GERROR) ^ self.reg32(SMMU_GERRORN)) & GERROR::CMDQ_ERR::SET.value != 0
    }

    /// Address and log2 size programmed into a queue base register.
    fn queue(&self, base_reg: usize) -> Option<(u64, u32)> {
        let base = LocalRegisterCopy::<u64, Q_BASE::Register>::new(self.reg64(base_reg));
        let addr = base.read(Q_BASE::ADDR) << 5;
        (addr != 0).then(|| (addr, base.read(Q_BASE::LOG2SIZE) as u32))
    }

    fn process_cmdq(&mut self) {
        if self.reg32(SMMU_CR0) & CR0::CMDQEN::SET.value == 0
            || self.stalled
            || self.cmdq_error_active()
        {
            return;
        }
        let Some((addr, log2)) = self.queue(SMMU_CMDQ_BASE) else {
            return;
        };
        let mask = (2u32 << log2) - 1;
        let prod = self.reg32(SMMU_CMDQ_PROD) & mask;
        let mut cons = self.reg32(SMMU_CMDQ_CONS) & mask;

        let mut batch = Vec::new();
        let mut error = None;
        while cons != prod {
            let slot = addr + u64::from(cons & ((1 << log2) - 1)) * 16;
            // SAFETY: the driver programmed CMDQ_BASE with queue memory of
            // 2^log2 16-byte slots
            let entry = unsafe {
                CmdEntry {
                    dwords: [read_volatile(ptr_at(slot)), read_volatile(ptr_at(slot + 8))],
                }
            };
            let cmd = match Command::decode(&entry) {
                Some(cmd) => cmd,
                None => {
                    error = Some(CERROR_ILL);
                    break;
                }
            };
            if let Some((op, code)) = self.fail
                && op == cmd.opcode()
            {
                self.fail = None;
                error = Some(code);
                break;
            }
            self.apply(&cmd);
            batch.push(cmd);
            cons = (cons + 1) & mask;
        }

        match error {
            Some(code) => {
                self.set32(SMMU_CMDQ_CONS, cons | (u32::from(code) << 24));
                self.raise_gerror(GERROR::CMDQ_ERR::SET.value);
            }
            None => self.set32(SMMU_CMDQ_CONS, cons),
        }
        if !batch.is_empty() {
            self.log.extend_from_slice(&batch);
            self.batches.push(batch);
        }
    }

    fn apply(&mut self, cmd: &Command) {
        match *cmd {
            Command::TlbiNhAsid { asid, .. } => self.tlb.retain(|(tag, _)| *tag != TlbTag::Asid(asid)),
            Command::TlbiS12Vmall { vmid } => self.tlb.retain(|(tag, _)| *tag != TlbTag::Vmid(vmid)),
            Command::TlbiNsnhAll => self.tlb.clear(),
            Command::TlbiNhVa(range) => self.invalidate_range(TlbTag::Asid(range.asid), &range),
            Command::TlbiS2Ipa(range) => self.invalidate_range(TlbTag::Vmid(range.vmid), &range),
            _ => {}
        }
    }

    fn invalidate_range(&mut self, target: TlbTag, range: &TlbiRange) {
        let start = range.addr & !0xfff;
        let size = if range.tg == 0 {
            0x1000
        } else {
            let granule_shift = 12 + 2 * (u32::from(range.tg) - 1);
            (u64::from(range.num) + 1) << range.scale << granule_shift
        };
        self.tlb
            .retain(|&(tag, addr)| tag != target || addr < start || addr - start >= size);
    }
}

impl RegisterIo for SimSmmu {
    fn read32(&self, offset: usize) -> u32 {
        self.inner.lock().read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.inner.lock().write32(offset, value);
    }

    fn read64(&self, offset: usize) -> u64 {
        self.inner.lock().reg64(offset)
    }

    fn write64(&self, offset: usize, value: u64) {
        self.inner.lock().regs.insert(offset, value);
    }
}

impl core::fmt::Debug for SimSmmu {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("SimSmmu")
            .field("cfg", &state.cfg)
            .field("executed", &state.log.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::SyncCompletion;
    use warden_common::{FrameAllocator, HeapFrameAllocator};

    #[test]
    fn test_asid_invalidation_is_idempotent() {
        let sim = SimSmmu::new(SimConfig::default());
        sim.fill_tlb(TlbTag::Asid(5), 0x1000);
        sim.fill_tlb(TlbTag::Asid(5), 0x2000);
        sim.fill_tlb(TlbTag::Asid(6), 0x1000);

        let mut state = sim.inner.lock();
        state.apply(&Command::TlbiNhAsid { asid: 5, vmid: 0 });
        let after_once = state.tlb.clone();
        state.apply(&Command::TlbiNhAsid { asid: 5, vmid: 0 });
        assert_eq!(state.tlb, after_once);
        assert_eq!(after_once, [(TlbTag::Asid(6), 0x1000)]);
    }

    #[test]
    fn test_range_invalidation() {
        let sim = SimSmmu::new(SimConfig::default());
        for page in 0..8u64 {
            sim.fill_tlb(TlbTag::Vmid(2), page << 12);
        }
        let mut state = sim.inner.lock();
        // Pages 2..6 (num + 1 = 4 granules of 4KB)
        state.apply(&Command::TlbiS2Ipa(TlbiRange {
            vmid: 2,
            addr: 0x2000,
            tg: 1,
            num: 3,
            ..TlbiRange::default()
        }));
        let left: Vec<u64> = state.tlb.iter().map(|&(_, addr)| addr >> 12).collect();
        assert_eq!(left, [0, 1, 6, 7]);
    }

    #[test]
    fn test_ack_registers_follow_writes() {
        let sim = SimSmmu::new(SimConfig::default());
        sim.write32(SMMU_CR0, CR0::SMMUEN::SET.value);
        assert_eq!(sim.read32(SMMU_CR0ACK), CR0::SMMUEN::SET.value);
        sim.write32(SMMU_GBPA, GBPA::ABORT::SET.value | GBPA::UPDATE::SET.value);
        assert_eq!(sim.read32(SMMU_GBPA), GBPA::ABORT::SET.value);
    }

    #[test]
    fn test_commands_wait_for_enable() {
        let frames = HeapFrameAllocator::new();
        let page = frames.alloc_zeroed(0).unwrap();
        let sync = Command::Sync { cs: SyncCompletion::None }.encode();
        // SAFETY: page is a fresh 4KB frame reachable through the direct map
        unsafe { page.to_virt().as_mut_ptr::<CmdEntry>().write(sync) };

        let sim = SimSmmu::new(SimConfig::default());
        sim.write64(SMMU_CMDQ_BASE, page.as_u64() | 2);
        sim.write32(SMMU_CMDQ_PROD, 1);
        assert!(sim.commands().is_empty());

        sim.write32(SMMU_CR0, CR0::CMDQEN::SET.value);
        assert_eq!(sim.commands(), [Command::Sync { cs: SyncCompletion::None }]);
        assert_eq!(sim.read32(SMMU_CMDQ_CONS), 1);

        // SAFETY: page came from alloc_zeroed(0) and the model is done with it
        unsafe { frames.free(page, 0) };
    }
}
