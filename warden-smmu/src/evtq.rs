//! Event queue
//!
//! The controller produces 32-byte fault records; the driver drains them
//! from its interrupt handler (or a poll) and routes each to the handler
//! registered for the faulting stream. Handlers observe faults only: they
//! never modify page tables from this context.

use alloc::sync::Arc;

use spin::Mutex;
use tock_registers::{LocalRegisterCopy, register_bitfields};
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::{Queue, RegisterIo};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::SmmuError;
use crate::frames::Frames;
use crate::regs::{Q_BASE, SMMU_EVTQ_CONS, SMMU_EVTQ_PROD};

register_bitfields![u64,
    EVT0 [
        ID OFFSET(0) NUMBITS(8) [],
        SSV OFFSET(11) NUMBITS(1) [],
        SSID OFFSET(12) NUMBITS(20) [],
        SID OFFSET(32) NUMBITS(32) []
    ],
    EVT1 [
        STAG OFFSET(0) NUMBITS(16) [],
        STALL OFFSET(31) NUMBITS(1) [],
        PNU OFFSET(33) NUMBITS(1) [],
        IND OFFSET(34) NUMBITS(1) [],
        RNW OFFSET(35) NUMBITS(1) [],
        S2 OFFSET(39) NUMBITS(1) [],
        CLASS OFFSET(40) NUMBITS(2) []
    ]
];

/// IPA bits of event dword 3
const EVT3_IPA_MASK: u64 = ((1 << 52) - 1) & !0xFFF;

/// One event queue slot.
#[repr(C, align(32))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct EvtEntry {
    pub dwords: [u64; 4],
}

/// Event record types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    UnsupportedUpstreamTransaction,
    BadStreamId,
    SteFetch,
    BadSte,
    BadAtsRequest,
    StreamDisabled,
    TranslationForbidden,
    BadSubstreamId,
    CdFetch,
    BadCd,
    WalkAbort,
    Translation,
    AddressSize,
    Access,
    Permission,
    TlbConflict,
    ConfigConflict,
    PageRequest,
    Unknown(u8),
}

impl From<u8> for EventKind {
    fn from(id: u8) -> Self {
        match id {
            0x01 => Self::UnsupportedUpstreamTransaction,
            0x02 => Self::BadStreamId,
            0x03 => Self::SteFetch,
            0x04 => Self::BadSte,
            0x05 => Self::BadAtsRequest,
            0x06 => Self::StreamDisabled,
            0x07 => Self::TranslationForbidden,
            0x08 => Self::BadSubstreamId,
            0x09 => Self::CdFetch,
            0x0a => Self::BadCd,
            0x0b => Self::WalkAbort,
            0x10 => Self::Translation,
            0x11 => Self::AddressSize,
            0x12 => Self::Access,
            0x13 => Self::Permission,
            0x20 => Self::TlbConflict,
            0x21 => Self::ConfigConflict,
            0x24 => Self::PageRequest,
            other => Self::Unknown(other),
        }
    }
}

impl EventKind {
    /// Translation faults raised by a page table walk, as opposed to
    /// configuration errors.
    #[must_use]
    pub const fn is_translation_fault(self) -> bool {
        matches!(
            self,
            Self::Translation | Self::AddressSize | Self::Access | Self::Permission
        )
    }
}

/// A decoded event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultRecord {
    pub kind: EventKind,
    pub sid: u32,
    pub ssid: Option<u32>,
    /// The transaction is stalled awaiting a resume
    pub stall: bool,
    pub stag: u16,
    pub privileged: bool,
    pub instruction: bool,
    pub read: bool,
    /// The fault came from the stage 2 walk
    pub stage2: bool,
    /// Access class (0 = CD fetch, 1 = table walk, 2 = input address)
    pub class: u8,
    /// Input address of the faulting transaction
    pub addr: u64,
    /// Intermediate address of a stage 2 fault
    pub ipa: u64,
}

impl FaultRecord {
    #[must_use]
    pub fn decode(entry: &EvtEntry) -> Self {
        let e0 = LocalRegisterCopy::<u64, EVT0::Register>::new(entry.dwords[0]);
        let e1 = LocalRegisterCopy::<u64, EVT1::Register>::new(entry.dwords[1]);
        Self {
            kind: EventKind::from(e0.read(EVT0::ID) as u8),
            sid: e0.read(EVT0::SID) as u32,
            ssid: e0.is_set(EVT0::SSV).then(|| e0.read(EVT0::SSID) as u32),
            stall: e1.is_set(EVT1::STALL),
            stag: e1.read(EVT1::STAG) as u16,
            privileged: e1.is_set(EVT1::PNU),
            instruction: e1.is_set(EVT1::IND),
            read: e1.is_set(EVT1::RNW),
            stage2: e1.is_set(EVT1::S2),
            class: e1.read(EVT1::CLASS) as u8,
            addr: entry.dwords[2],
            ipa: entry.dwords[3] & EVT3_IPA_MASK,
        }
    }
}

/// Build an event record, for software models of the controller.
#[must_use]
pub fn encode_event(id: u8, sid: u32, ssid: Option<u32>, addr: u64, read: bool) -> EvtEntry {
    let mut e0 = LocalRegisterCopy::<u64, EVT0::Register>::new(0);
    e0.write(EVT0::ID.val(u64::from(id)) + EVT0::SID.val(u64::from(sid)));
    if let Some(ssid) = ssid {
        e0.modify(EVT0::SSV::SET + EVT0::SSID.val(u64::from(ssid)));
    }
    let mut e1 = LocalRegisterCopy::<u64, EVT1::Register>::new(0);
    e1.write(EVT1::RNW.val(u64::from(read)) + EVT1::CLASS.val(2));
    EvtEntry {
        dwords: [e0.get(), e1.get(), addr, 0],
    }
}

/// Receiver of the faults of one stream.
pub trait FaultHandler: Send + Sync {
    fn on_fault(&self, record: &FaultRecord);
}

/// The event queue of one controller.
pub struct Evtq {
    queue: Mutex<Queue<EvtEntry>>,
    _mem: Option<Frames>,
}

impl Evtq {
    /// Allocate a queue of `2^log2size` entries.
    pub fn new(alloc: &Arc<dyn FrameAllocator>, log2size: u32) -> Result<Self, SmmuError> {
        let mem = Frames::alloc(alloc, Queue::<EvtEntry>::memory_size(log2size) as u64)?;
        // SAFETY: mem covers memory_size(log2size) bytes and lives as long as
        // the queue
        let queue = unsafe {
            Queue::new(
                mem.as_mut_ptr(),
                mem.pa().as_u64(),
                log2size,
                SMMU_EVTQ_PROD,
                SMMU_EVTQ_CONS,
            )
        };
        Ok(Self {
            queue: Mutex::new(queue),
            _mem: Some(mem),
        })
    }

    /// Drain a queue whose memory someone else owns.
    ///
    /// # Safety
    ///
    /// `base` must be memory of at least
    /// `Queue::<EvtEntry>::memory_size(log2size)` bytes, reachable through
    /// the direct map, that outlives the returned queue.
    pub unsafe fn adopt(base: PhysAddr, log2size: u32) -> Self {
        // SAFETY: guaranteed by the caller
        let queue = unsafe {
            Queue::new(
                base.to_virt().as_mut_ptr(),
                base.as_u64(),
                log2size,
                SMMU_EVTQ_PROD,
                SMMU_EVTQ_CONS,
            )
        };
        Self {
            queue: Mutex::new(queue),
            _mem: None,
        }
    }

    /// Value for SMMU_EVTQ_BASE.
    #[must_use]
    pub fn base_register(&self) -> u64 {
        let queue = self.queue.lock();
        let mut reg = LocalRegisterCopy::<u64, Q_BASE::Register>::new(0);
        reg.write(
            Q_BASE::RWA::SET
                + Q_BASE::ADDR.val(queue.base() >> 5)
                + Q_BASE::LOG2SIZE.val(u64::from(queue.log2size())),
        );
        reg.get()
    }

    pub fn reset_indices(&self) {
        self.queue.lock().set_indices(0, 0);
    }

    /// Hand up to `budget` pending records to `f`.
    ///
    /// An overflow is reported once and acknowledged. Returns the number of
    /// records handled.
    pub fn drain<R, F>(&self, io: &R, budget: usize, mut f: F) -> usize
    where
        R: RegisterIo + ?Sized,
        F: FnMut(FaultRecord),
    {
        let mut queue = self.queue.lock();
        queue.sync_prod(io);
        if queue.overflowed() {
            log::warn!("evtq: overflow, events lost");
            queue.ack_overflow(io);
        }

        let mut handled = 0;
        while handled < budget {
            let Some(entry) = queue.consume(io) else {
                break;
            };
            f(FaultRecord::decode(&entry));
            handled += 1;
        }
        handled
    }
}

impl core::fmt::Debug for Evtq {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let queue = self.queue.lock();
        f.debug_struct("Evtq")
            .field("base", &format_args!("{:#x}", queue.base()))
            .field("log2size", &queue.log2size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use super::*;
    use crate::regs::{CR0, SMMU_CR0, SMMU_EVTQ_BASE};
    use crate::sim::{SimConfig, SimSmmu};
    use alloc::vec::Vec;
    use warden_common::HeapFrameAllocator;

    fn setup(log2size: u32) -> (SimSmmu, Evtq) {
        let sim = SimSmmu::new(SimConfig::default());
        let alloc: Arc<dyn FrameAllocator> = Arc::new(HeapFrameAllocator::new());
        let evtq = Evtq::new(&alloc, log2size).unwrap();
        sim.write64(SMMU_EVTQ_BASE, evtq.base_register());
        sim.write32(SMMU_CR0, CR0::EVTQEN::SET.value);
        (sim, evtq)
    }

    #[test]
    fn test_decode_translation_fault() {
        let entry = encode_event(0x10, 0x42, Some(3), 0xdead_b000, true);
        let record = FaultRecord::decode(&entry);
        assert_eq!(record.kind, EventKind::Translation);
        assert!(record.kind.is_translation_fault());
        assert_eq!(record.sid, 0x42);
        assert_eq!(record.ssid, Some(3));
        assert_eq!(record.addr, 0xdead_b000);
        assert!(record.read);
        assert!(!record.stage2);
    }

    #[test]
    fn test_unknown_event_id() {
        assert_eq!(EventKind::from(0x7e), EventKind::Unknown(0x7e));
        assert!(!EventKind::BadSte.is_translation_fault());
    }

    #[test]
    fn test_drain_respects_budget() {
        let (sim, evtq) = setup(3);
        for sid in 0..5 {
            sim.inject_event(encode_event(0x04, sid, None, 0, false));
        }

        let mut seen = Vec::new();
        assert_eq!(evtq.drain(&sim, 3, |r| seen.push(r.sid)), 3);
        assert_eq!(evtq.drain(&sim, 3, |r| seen.push(r.sid)), 2);
        assert_eq!(seen, [0, 1, 2, 3, 4]);
        assert_eq!(evtq.drain(&sim, 3, |_| {}), 0);
    }

    #[test]
    fn test_overflow_acknowledged() {
        let (sim, evtq) = setup(1);
        for sid in 0..3 {
            sim.inject_event(encode_event(0x10, sid, None, 0, false));
        }
        assert!(sim.evtq_overflowed());

        let mut seen = Vec::new();
        evtq.drain(&sim, 8, |r| seen.push(r.sid));
        assert_eq!(seen, [0, 1]);
        assert!(!sim.evtq_overflowed());
    }
}
