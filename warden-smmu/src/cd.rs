//! Context Descriptors
//!
//! A stage 1 STE points to a linear table of context descriptors, one per
//! substream. Substream 0 serves transactions without a PASID and anchors
//! the table: it is created with substream 0 and freed with it.
//!
//! # Layout (words 0, 1 and 3; the rest is unused)
//!
//! ```text
//! word 0  T0SZ[5:0] TG0[7:6] IRGN0[9:8] ORGN0[11:10] SH0[13:12] EPD0[14]
//!         EPD1[30] V[31] IPS[34:32] TBI0[38] AA64[41] R[45] A[46] ASET[47]
//!         ASID[63:48]
//! word 1  TTB0[51:4]
//! word 3  MAIR
//! ```

use alloc::sync::Arc;

use tock_registers::fields::Field;
use tock_registers::{LocalRegisterCopy, RegisterLongName, register_bitfields};
use warden_common::{FrameAllocator, PhysAddr};
use warden_mmio::RegisterIo;
use warden_pgtable::Stage1Regs;

use crate::cmd::Command;
use crate::cmdq::Cmdq;
use crate::entry::{ENTRY_QWORDS, EntrySlot, EntryWords, EntryWriter, RawEntry, WriteMode, write_entry};
use crate::error::SmmuError;
use crate::frames::Frames;

register_bitfields![u64,
    pub CD0 [
        T0SZ OFFSET(0) NUMBITS(6) [],
        TG0 OFFSET(6) NUMBITS(2) [],
        IRGN0 OFFSET(8) NUMBITS(2) [],
        ORGN0 OFFSET(10) NUMBITS(2) [],
        SH0 OFFSET(12) NUMBITS(2) [],
        EPD0 OFFSET(14) NUMBITS(1) [],
        EPD1 OFFSET(30) NUMBITS(1) [],
        V OFFSET(31) NUMBITS(1) [],
        IPS OFFSET(32) NUMBITS(3) [],
        TBI0 OFFSET(38) NUMBITS(1) [],
        AA64 OFFSET(41) NUMBITS(1) [],
        R OFFSET(45) NUMBITS(1) [],
        A OFFSET(46) NUMBITS(1) [],
        ASET OFFSET(47) NUMBITS(1) [],
        ASID OFFSET(48) NUMBITS(16) []
    ],
    pub CD1 [
        TTB0 OFFSET(4) NUMBITS(48) []
    ]
];

/// Bytes per CD
pub const CD_SIZE: usize = ENTRY_QWORDS * 8;

const fn bits<R: RegisterLongName>(field: Field<u64, R>) -> u64 {
    field.mask << field.shift
}

/// Translation-walk fields ignored while EPD0 is set
const CD0_WALK: u64 =
    bits(CD0::T0SZ) | bits(CD0::TG0) | bits(CD0::IRGN0) | bits(CD0::ORGN0) | bits(CD0::SH0);

const USED_DISABLED: EntryWords = [bits(CD0::V), 0, 0, 0, 0, 0, 0, 0];

const USED_VALID: EntryWords = [
    CD0_WALK
        | bits(CD0::EPD0)
        | bits(CD0::EPD1)
        | bits(CD0::V)
        | bits(CD0::IPS)
        | bits(CD0::TBI0)
        | bits(CD0::AA64)
        | bits(CD0::R)
        | bits(CD0::A)
        | bits(CD0::ASET)
        | bits(CD0::ASID),
    bits(CD1::TTB0),
    0,
    u64::MAX,
    0,
    0,
    0,
    0,
];

/// Bits of `entry` the controller interprets.
#[must_use]
pub fn used_bits(entry: &EntryWords) -> EntryWords {
    let w0 = LocalRegisterCopy::<u64, CD0::Register>::new(entry[0]);
    if !w0.is_set(CD0::V) {
        return USED_DISABLED;
    }
    let mut used = USED_VALID;
    if w0.is_set(CD0::EPD0) {
        used[0] &= !CD0_WALK;
        used[1] = 0;
    }
    used
}

/// Contents of one CD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cd(pub EntryWords);

impl Cd {
    #[must_use]
    pub const fn disabled() -> Self {
        Self([0; ENTRY_QWORDS])
    }

    /// A valid CD translating through the table described by `regs`.
    #[must_use]
    pub fn new(asid: u16, regs: &Stage1Regs) -> Self {
        let tcr = &regs.tcr;
        let mut w0 = LocalRegisterCopy::<u64, CD0::Register>::new(0);
        w0.write(
            CD0::T0SZ.val(u64::from(tcr.t0sz))
                + CD0::TG0.val(u64::from(tcr.tg0))
                + CD0::IRGN0.val(u64::from(tcr.irgn0))
                + CD0::ORGN0.val(u64::from(tcr.orgn0))
                + CD0::SH0.val(u64::from(tcr.sh0))
                + CD0::EPD1::SET
                + CD0::V::SET
                + CD0::IPS.val(u64::from(tcr.ips))
                + CD0::AA64::SET
                + CD0::R::SET
                + CD0::A::SET
                + CD0::ASET::SET
                + CD0::ASID.val(u64::from(asid)),
        );
        let mut w1 = LocalRegisterCopy::<u64, CD1::Register>::new(0);
        w1.write(CD1::TTB0.val(regs.ttbr >> 4));
        Self([w0.get(), w1.get(), 0, regs.mair, 0, 0, 0, 0])
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        LocalRegisterCopy::<u64, CD0::Register>::new(self.0[0]).is_set(CD0::V)
    }

    #[must_use]
    pub fn asid(&self) -> Option<u16> {
        let w0 = LocalRegisterCopy::<u64, CD0::Register>::new(self.0[0]);
        w0.is_set(CD0::V).then(|| w0.read(CD0::ASID) as u16)
    }

    /// Translation table base of a valid CD.
    #[must_use]
    pub fn ttb0(&self) -> Option<PhysAddr> {
        self.is_valid().then(|| {
            let w1 = LocalRegisterCopy::<u64, CD1::Register>::new(self.0[1]);
            PhysAddr::new(w1.read(CD1::TTB0) << 4)
        })
    }
}

/// Linear CD table of one stream.
pub struct CdTable {
    mem: Frames,
    ssid_bits: u32,
}

impl CdTable {
    /// Allocate a table for `2^ssid_bits` substreams.
    pub fn new(alloc: &Arc<dyn FrameAllocator>, ssid_bits: u32) -> Result<Self, SmmuError> {
        let bytes = (CD_SIZE as u64) << ssid_bits;
        Ok(Self {
            mem: Frames::alloc(alloc, bytes)?,
            ssid_bits,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysAddr {
        self.mem.pa()
    }

    /// log2 of the number of substreams (STE.S1CDMAX).
    #[inline]
    #[must_use]
    pub const fn ssid_bits(&self) -> u32 {
        self.ssid_bits
    }

    fn slot(&self, ssid: u32) -> Result<RawEntry, SmmuError> {
        if u64::from(ssid) >= 1u64 << self.ssid_bits {
            return Err(SmmuError::InvalidArgument);
        }
        let words = self.mem.as_mut_ptr::<u64>();
        // SAFETY: ssid is within the table, which holds 2^ssid_bits CDs
        Ok(unsafe { RawEntry::new(words.add(ssid as usize * ENTRY_QWORDS)) })
    }

    /// Contents of the CD for `ssid`.
    pub fn get(&self, ssid: u32) -> Result<Cd, SmmuError> {
        Ok(Cd(self.slot(ssid)?.load()))
    }

    /// Install `target` for `ssid` without a torn intermediate state.
    pub fn write<W: EntryWriter + ?Sized>(
        &mut self,
        ssid: u32,
        target: &Cd,
        writer: &mut W,
    ) -> Result<WriteMode, SmmuError> {
        let mut slot = self.slot(ssid)?;
        write_entry(&mut slot, &target.0, writer)
    }

    /// Check whether any substream other than 0 has a valid CD.
    #[must_use]
    pub fn has_secondary_substreams(&self) -> bool {
        (1..1u32 << self.ssid_bits).any(|ssid| self.get(ssid).is_ok_and(|cd| cd.is_valid()))
    }
}

impl core::fmt::Debug for CdTable {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CdTable")
            .field("base", &self.base())
            .field("ssid_bits", &self.ssid_bits)
            .finish()
    }
}

/// Invalidation half of a CD update: CFGI_CD for one substream, then sync.
pub struct CdSync<'a, R: RegisterIo + ?Sized> {
    cmdq: &'a Cmdq,
    io: &'a R,
    sid: u32,
    ssid: u32,
}

impl<'a, R: RegisterIo + ?Sized> CdSync<'a, R> {
    #[must_use]
    pub const fn new(cmdq: &'a Cmdq, io: &'a R, sid: u32, ssid: u32) -> Self {
        Self { cmdq, io, sid, ssid }
    }
}

impl<R: RegisterIo + ?Sized> EntryWriter for CdSync<'_, R> {
    fn used_bits(&self, entry: &EntryWords) -> EntryWords {
        used_bits(entry)
    }

    fn sync(&mut self) -> Result<(), SmmuError> {
        self.cmdq.issue_sync(
            self.io,
            Command::CfgiCd {
                sid: self.sid,
                ssid: self.ssid,
                leaf: true,
            },
        )
    }
}
