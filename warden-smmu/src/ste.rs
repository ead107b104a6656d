//! Stream Table Entries
//!
//! # Layout (words 0-3; words 4-7 are unused)
//!
//! ```text
//! word 0  V[0] CFG[3:1] S1FMT[5:4] S1CTXPTR[51:6] S1CDMAX[63:59]
//! word 1  S1DSS[1:0] S1CIR[3:2] S1COR[5:4] S1CSH[7:6] S1STALLD[27]
//!         EATS[29:28] STRW[31:30] SHCFG[45:44]
//! word 2  S2VMID[15:0] VTCR[50:32] S2AA64[51] S2ENDI[52] S2PTW[54] S2R[58]
//! word 3  S2TTB[51:4]
//! ```
//!
//! [`used_bits`] lists, per decoded configuration, which of these fields the
//! controller interprets. It drives the torn-write-safe writer in
//! [`entry`](crate::entry).

use tock_registers::fields::Field;
use tock_registers::{LocalRegisterCopy, RegisterLongName, register_bitfields};
use warden_common::PhysAddr;
use warden_mmio::RegisterIo;
use warden_pgtable::{Stage2Regs, Vtcr};

use crate::cmd::Command;
use crate::cmdq::Cmdq;
use crate::entry::{ENTRY_QWORDS, EntryWords, EntryWriter};
use crate::error::SmmuError;
use crate::regs::{CACHE_WB, SH_ISH};

register_bitfields![u64,
    pub STE0 [
        V OFFSET(0) NUMBITS(1) [],
        CFG OFFSET(1) NUMBITS(3) [
            Abort = 0b000,
            Bypass = 0b100,
            S1Trans = 0b101,
            S2Trans = 0b110
        ],
        S1FMT OFFSET(4) NUMBITS(2) [
            Linear = 0
        ],
        S1CTXPTR OFFSET(6) NUMBITS(46) [],
        S1CDMAX OFFSET(59) NUMBITS(5) []
    ],

    pub STE1 [
        S1DSS OFFSET(0) NUMBITS(2) [
            Terminate = 0,
            Bypass = 1,
            Ssid0 = 2
        ],
        S1CIR OFFSET(2) NUMBITS(2) [],
        S1COR OFFSET(4) NUMBITS(2) [],
        S1CSH OFFSET(6) NUMBITS(2) [],
        S1STALLD OFFSET(27) NUMBITS(1) [],
        EATS OFFSET(28) NUMBITS(2) [
            Abort = 0,
            Trans = 1
        ],
        STRW OFFSET(30) NUMBITS(2) [
            NsEl1 = 0,
            El2 = 2
        ],
        SHCFG OFFSET(44) NUMBITS(2) [
            Incoming = 1
        ]
    ],

    pub STE2 [
        S2VMID OFFSET(0) NUMBITS(16) [],
        VTCR OFFSET(32) NUMBITS(19) [],
        S2AA64 OFFSET(51) NUMBITS(1) [],
        S2ENDI OFFSET(52) NUMBITS(1) [],
        S2PTW OFFSET(54) NUMBITS(1) [],
        S2R OFFSET(58) NUMBITS(1) []
    ],

    pub STE3 [
        S2TTB OFFSET(4) NUMBITS(48) []
    ],

    /// VTCR as embedded in STE word 2
    pub STE_VTCR [
        T0SZ OFFSET(0) NUMBITS(6) [],
        SL0 OFFSET(6) NUMBITS(2) [],
        IR0 OFFSET(8) NUMBITS(2) [],
        OR0 OFFSET(10) NUMBITS(2) [],
        SH0 OFFSET(12) NUMBITS(2) [],
        TG OFFSET(14) NUMBITS(2) [],
        PS OFFSET(16) NUMBITS(3) []
    ]
];

/// Bytes per STE
pub const STE_SIZE: usize = ENTRY_QWORDS * 8;

const fn bits<R: RegisterLongName>(field: Field<u64, R>) -> u64 {
    field.mask << field.shift
}

// -- Used bits per configuration

const USED_DISABLED: EntryWords = [bits(STE0::V), 0, 0, 0, 0, 0, 0, 0];

const USED_ABORT: EntryWords = [bits(STE0::V) | bits(STE0::CFG), 0, 0, 0, 0, 0, 0, 0];

const USED_BYPASS: EntryWords = [
    bits(STE0::V) | bits(STE0::CFG),
    bits(STE1::SHCFG),
    0,
    0,
    0,
    0,
    0,
    0,
];

const USED_S1: EntryWords = [
    bits(STE0::V)
        | bits(STE0::CFG)
        | bits(STE0::S1FMT)
        | bits(STE0::S1CTXPTR)
        | bits(STE0::S1CDMAX),
    bits(STE1::S1DSS)
        | bits(STE1::S1CIR)
        | bits(STE1::S1COR)
        | bits(STE1::S1CSH)
        | bits(STE1::S1STALLD)
        | bits(STE1::EATS)
        | bits(STE1::STRW),
    0,
    0,
    0,
    0,
    0,
    0,
];

const USED_S2: EntryWords = [
    bits(STE0::V) | bits(STE0::CFG),
    bits(STE1::EATS) | bits(STE1::SHCFG),
    bits(STE2::S2VMID)
        | bits(STE2::VTCR)
        | bits(STE2::S2AA64)
        | bits(STE2::S2ENDI)
        | bits(STE2::S2PTW)
        | bits(STE2::S2R),
    bits(STE3::S2TTB),
    0,
    0,
    0,
    0,
];

/// Decoded configuration of an STE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteMode {
    /// V clear: the controller ignores every other field
    Disabled,
    Abort,
    Bypass,
    /// Stage 1 through a context descriptor table
    Stage1,
    /// Stage 2 directly from the STE
    Stage2,
    /// Reserved CFG encoding
    Reserved(u8),
}

/// Bits of `entry` the controller interprets.
#[must_use]
pub fn used_bits(entry: &EntryWords) -> EntryWords {
    match Ste(*entry).mode() {
        SteMode::Disabled => USED_DISABLED,
        SteMode::Abort | SteMode::Reserved(_) => USED_ABORT,
        SteMode::Bypass => USED_BYPASS,
        SteMode::Stage1 => USED_S1,
        SteMode::Stage2 => USED_S2,
    }
}

type Word0 = LocalRegisterCopy<u64, STE0::Register>;
type Word1 = LocalRegisterCopy<u64, STE1::Register>;
type Word2 = LocalRegisterCopy<u64, STE2::Register>;
type Word3 = LocalRegisterCopy<u64, STE3::Register>;

/// Contents of one STE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ste(pub EntryWords);

impl Ste {
    /// V clear.
    #[must_use]
    pub const fn disabled() -> Self {
        Self([0; ENTRY_QWORDS])
    }

    /// Valid, aborting every transaction.
    #[must_use]
    pub fn abort() -> Self {
        let mut w0 = Word0::new(0);
        w0.write(STE0::V::SET + STE0::CFG::Abort);
        Self([w0.get(), 0, 0, 0, 0, 0, 0, 0])
    }

    /// Valid, passing transactions through untranslated.
    #[must_use]
    pub fn bypass() -> Self {
        let mut w0 = Word0::new(0);
        w0.write(STE0::V::SET + STE0::CFG::Bypass);
        let mut w1 = Word1::new(0);
        w1.write(STE1::SHCFG::Incoming);
        Self([w0.get(), w1.get(), 0, 0, 0, 0, 0, 0])
    }

    /// Stage 1 through a linear CD table of `2^s1cdmax` entries.
    ///
    /// Transactions without a substream use CD 0.
    #[must_use]
    pub fn stage1(cd_table: PhysAddr, s1cdmax: u32, ats: bool, stall_disable: bool) -> Self {
        let mut w0 = Word0::new(0);
        w0.write(
            STE0::V::SET
                + STE0::CFG::S1Trans
                + STE0::S1FMT::Linear
                + STE0::S1CTXPTR.val(cd_table.as_u64() >> 6)
                + STE0::S1CDMAX.val(u64::from(s1cdmax)),
        );
        let mut w1 = Word1::new(0);
        w1.write(
            STE1::S1DSS::Ssid0
                + STE1::S1CIR.val(u64::from(CACHE_WB))
                + STE1::S1COR.val(u64::from(CACHE_WB))
                + STE1::S1CSH.val(u64::from(SH_ISH))
                + STE1::STRW::NsEl1,
        );
        if stall_disable {
            w1.modify(STE1::S1STALLD::SET);
        }
        if ats {
            w1.modify(STE1::EATS::Trans);
        }
        Self([w0.get(), w1.get(), 0, 0, 0, 0, 0, 0])
    }

    /// Stage 2 with the given VMID and table.
    #[must_use]
    pub fn stage2(vmid: u16, regs: &Stage2Regs, ats: bool) -> Self {
        let mut w0 = Word0::new(0);
        w0.write(STE0::V::SET + STE0::CFG::S2Trans);
        let mut w1 = Word1::new(0);
        w1.write(STE1::SHCFG::Incoming);
        if ats {
            w1.modify(STE1::EATS::Trans);
        }
        let mut w2 = Word2::new(0);
        w2.write(
            STE2::S2VMID.val(u64::from(vmid))
                + STE2::VTCR.val(encode_vtcr(&regs.vtcr))
                + STE2::S2AA64::SET
                + STE2::S2PTW::SET
                + STE2::S2R::SET,
        );
        let mut w3 = Word3::new(0);
        w3.write(STE3::S2TTB.val(regs.vttbr >> 4));
        Self([w0.get(), w1.get(), w2.get(), w3.get(), 0, 0, 0, 0])
    }

    #[inline]
    #[must_use]
    pub fn is_valid(&self) -> bool {
        Word0::new(self.0[0]).is_set(STE0::V)
    }

    #[must_use]
    pub fn mode(&self) -> SteMode {
        let w0 = Word0::new(self.0[0]);
        if !w0.is_set(STE0::V) {
            return SteMode::Disabled;
        }
        match w0.read_as_enum(STE0::CFG) {
            Some(STE0::CFG::Value::Abort) => SteMode::Abort,
            Some(STE0::CFG::Value::Bypass) => SteMode::Bypass,
            Some(STE0::CFG::Value::S1Trans) => SteMode::Stage1,
            Some(STE0::CFG::Value::S2Trans) => SteMode::Stage2,
            None => SteMode::Reserved(w0.read(STE0::CFG) as u8),
        }
    }

    /// CD table of a stage 1 entry.
    #[must_use]
    pub fn cd_table(&self) -> Option<PhysAddr> {
        (self.mode() == SteMode::Stage1)
            .then(|| PhysAddr::new(Word0::new(self.0[0]).read(STE0::S1CTXPTR) << 6))
    }

    /// VMID of a stage 2 entry.
    #[must_use]
    pub fn vmid(&self) -> Option<u16> {
        (self.mode() == SteMode::Stage2).then(|| Word2::new(self.0[2]).read(STE2::S2VMID) as u16)
    }

    /// Check whether the entry routes translated requests from ATS.
    #[must_use]
    pub fn ats_enabled(&self) -> bool {
        matches!(self.mode(), SteMode::Stage1 | SteMode::Stage2)
            && Word1::new(self.0[1]).matches_all(STE1::EATS::Trans)
    }
}

fn encode_vtcr(vtcr: &Vtcr) -> u64 {
    let mut reg = LocalRegisterCopy::<u64, STE_VTCR::Register>::new(0);
    reg.write(
        STE_VTCR::T0SZ.val(u64::from(vtcr.t0sz))
            + STE_VTCR::SL0.val(u64::from(vtcr.sl0))
            + STE_VTCR::IR0.val(u64::from(vtcr.irgn0))
            + STE_VTCR::OR0.val(u64::from(vtcr.orgn0))
            + STE_VTCR::SH0.val(u64::from(vtcr.sh0))
            + STE_VTCR::TG.val(u64::from(vtcr.tg0))
            + STE_VTCR::PS.val(u64::from(vtcr.ps)),
    );
    reg.get()
}

/// Invalidation half of an STE update: CFGI_STE for one stream, then sync.
pub struct SteSync<'a, R: RegisterIo + ?Sized> {
    cmdq: &'a Cmdq,
    io: &'a R,
    sid: u32,
}

impl<'a, R: RegisterIo + ?Sized> SteSync<'a, R> {
    #[must_use]
    pub const fn new(cmdq: &'a Cmdq, io: &'a R, sid: u32) -> Self {
        Self { cmdq, io, sid }
    }
}

impl<R: RegisterIo + ?Sized> EntryWriter for SteSync<'_, R> {
    fn used_bits(&self, entry: &EntryWords) -> EntryWords {
        used_bits(entry)
    }

    fn sync(&mut self) -> Result<(), SmmuError> {
        self.cmdq.issue_sync(
            self.io,
            Command::CfgiSte {
                sid: self.sid,
                leaf: true,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::tests::{Recorder, assert_no_torn_state};
    use crate::entry::{WriteMode, write_entry};

    struct CountingSync(usize);

    impl EntryWriter for CountingSync {
        fn used_bits(&self, entry: &EntryWords) -> EntryWords {
            used_bits(entry)
        }

        fn sync(&mut self) -> Result<(), SmmuError> {
            self.0 += 1;
            Ok(())
        }
    }

    fn s2_regs(vttbr: u64) -> Stage2Regs {
        Stage2Regs {
            vttbr,
            vtcr: Vtcr {
                t0sz: 16,
                sl0: 2,
                irgn0: 1,
                orgn0: 1,
                sh0: 3,
                tg0: 0,
                ps: 5,
            },
        }
    }

    fn transition(old: Ste, new: Ste) -> WriteMode {
        let mut slot = Recorder {
            words: old.0,
            ..Recorder::default()
        };
        let mut sync = CountingSync(0);
        let mode = write_entry(&mut slot, &new.0, &mut sync).unwrap();
        assert_eq!(slot.words, new.0);
        assert_no_torn_state(&slot.snapshots, &old.0, &new.0, 1, used_bits);
        mode
    }

    #[test]
    fn test_builders_only_set_used_bits() {
        let entries = [
            Ste::abort(),
            Ste::bypass(),
            Ste::stage1(PhysAddr::new(0x8000_0000), 10, true, true),
            Ste::stage2(7, &s2_regs(0x9000_0000), true),
        ];
        for ste in entries {
            let used = used_bits(&ste.0);
            for i in 0..ENTRY_QWORDS {
                assert_eq!(ste.0[i] & !used[i], 0, "{:?} word {i}", ste.mode());
            }
        }
    }

    #[test]
    fn test_mode_decoding() {
        assert_eq!(Ste::disabled().mode(), SteMode::Disabled);
        assert_eq!(Ste::abort().mode(), SteMode::Abort);
        assert_eq!(Ste::bypass().mode(), SteMode::Bypass);

        let s1 = Ste::stage1(PhysAddr::new(0x8000_0040), 0, false, false);
        assert_eq!(s1.mode(), SteMode::Stage1);
        assert_eq!(s1.cd_table(), Some(PhysAddr::new(0x8000_0040)));
        assert!(!s1.ats_enabled());

        let s2 = Ste::stage2(0x1234, &s2_regs(0x9000_0000), true);
        assert_eq!(s2.vmid(), Some(0x1234));
        assert!(s2.ats_enabled());
        assert_eq!(s2.0[3], 0x9000_0000);
        assert_eq!((s2.0[2] >> 32) & 0x3f, 16);

        assert_eq!(Ste([0b111, 0, 0, 0, 0, 0, 0, 0]).mode(), SteMode::Reserved(0b011));
    }

    #[test]
    fn test_disabled_uses_only_valid_bit() {
        let mut garbage = Ste::stage2(1, &s2_regs(0x1000), false).0;
        garbage[0] &= !1;
        assert_eq!(used_bits(&garbage), USED_DISABLED);
    }

    #[test]
    fn test_install_from_abort_never_torn() {
        let s1 = Ste::stage1(PhysAddr::new(0x8000_0000), 4, false, false);
        assert_ne!(transition(Ste::abort(), s1), WriteMode::Unchanged);

        let s2 = Ste::stage2(3, &s2_regs(0x9000_0000), false);
        assert_ne!(transition(Ste::abort(), s2), WriteMode::Unchanged);
        assert_ne!(transition(Ste::disabled(), s2), WriteMode::Unchanged);
    }

    #[test]
    fn test_stage_switch() {
        // Only CFG changes meaning: the other stage's words are ignored
        let s1 = Ste::stage1(PhysAddr::new(0x8000_0000), 4, false, false);
        let s2 = Ste::stage2(3, &s2_regs(0x9000_0000), false);
        assert_eq!(transition(s1, s2), WriteMode::Hitless);
        assert_eq!(transition(s2, s1), WriteMode::Hitless);

        // Dropping ATS as well changes a second live word
        let s1_ats = Ste::stage1(PhysAddr::new(0x8000_0000), 4, true, false);
        assert_eq!(transition(s1_ats, s2), WriteMode::Breaking);
    }

    #[test]
    fn test_stage2_retarget_never_torn() {
        let a = Ste::stage2(3, &s2_regs(0x9000_0000), false);
        let b = Ste::stage2(4, &s2_regs(0xA000_0000), false);
        assert_eq!(transition(a, b), WriteMode::Breaking);
        assert_eq!(transition(b, Ste::abort()), WriteMode::Hitless);
        assert_eq!(transition(a, Ste::bypass()), WriteMode::Hitless);
    }

    #[test]
    fn test_cd_table_swap_is_hitless() {
        let a = Ste::stage1(PhysAddr::new(0x8000_0000), 4, false, false);
        let b = Ste::stage1(PhysAddr::new(0x8800_0000), 4, false, false);
        assert_eq!(transition(a, b), WriteMode::Hitless);
    }
}
