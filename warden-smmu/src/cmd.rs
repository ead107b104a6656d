//! Command encoding
//!
//! Every command the driver issues is a [`Command`] variant carrying only
//! the fields that opcode uses. [`Command::encode`] produces the 2×64-bit
//! wire format; [`Command::decode`] is its inverse, for diagnostics and for
//! software models of the controller.
//!
//! Field layout (dword 0 / dword 1):
//!
//! ```text
//! all        OP[7:0]
//! CFGI_*     SSID[31:12] SID[63:32]          / LEAF[0] RANGE[4:0]
//! PREFETCH   SID[63:32]
//! TLBI_*     NUM[16:12] SCALE[24:20]         / LEAF[0] TTL[9:8] TG[11:10]
//!            VMID[47:32] ASID[63:48]           ADDR[63:12]
//! ATC_INV    SSV[11] GLOBAL[9] SSID[31:12]   / SIZE[5:0] ADDR[63:12]
//!            SID[63:32]
//! CMD_SYNC   CS[13:12]
//! ```

use tock_registers::{LocalRegisterCopy, register_bitfields};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

register_bitfields![u64,
    /// Command dword 0
    pub CMD0 [
        OP OFFSET(0) NUMBITS(8) [],
        ATC_GLOBAL OFFSET(9) NUMBITS(1) [],
        SSV OFFSET(11) NUMBITS(1) [],
        SSID OFFSET(12) NUMBITS(20) [],
        SID OFFSET(32) NUMBITS(32) [],
        NUM OFFSET(12) NUMBITS(5) [],
        SCALE OFFSET(20) NUMBITS(5) [],
        VMID OFFSET(32) NUMBITS(16) [],
        ASID OFFSET(48) NUMBITS(16) [],
        SYNC_CS OFFSET(12) NUMBITS(2) [
            Poll = 0,
            Irq = 1,
            Sev = 2
        ]
    ],

    /// Command dword 1
    pub CMD1 [
        LEAF OFFSET(0) NUMBITS(1) [],
        RANGE OFFSET(0) NUMBITS(5) [],
        ATC_SIZE OFFSET(0) NUMBITS(6) [],
        TTL OFFSET(8) NUMBITS(2) [],
        TG OFFSET(10) NUMBITS(2) [],
        ADDR OFFSET(12) NUMBITS(52) []
    ]
];

/// Wire opcodes
pub mod opcode {
    pub const PREFETCH_CFG: u8 = 0x01;
    pub const CFGI_STE: u8 = 0x03;
    pub const CFGI_ALL: u8 = 0x04;
    pub const CFGI_CD: u8 = 0x05;
    pub const CFGI_CD_ALL: u8 = 0x06;
    pub const TLBI_NH_ASID: u8 = 0x11;
    pub const TLBI_NH_VA: u8 = 0x12;
    pub const TLBI_S12_VMALL: u8 = 0x28;
    pub const TLBI_S2_IPA: u8 = 0x2a;
    pub const TLBI_NSNH_ALL: u8 = 0x30;
    pub const ATC_INV: u8 = 0x40;
    pub const CMD_SYNC: u8 = 0x46;
}

/// Address bits carried by stage 2 invalidations (IPA[51:12])
const IPA_MASK: u64 = ((1 << 52) - 1) & !0xFFF;

/// One command queue slot.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CmdEntry {
    pub dwords: [u64; 2],
}

/// Fields of a range or single-address TLB invalidation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TlbiRange {
    pub asid: u16,
    pub vmid: u16,
    /// Start address (VA for stage 1, IPA for stage 2)
    pub addr: u64,
    /// Only leaf entries need invalidating
    pub leaf: bool,
    /// Level hint (0 = unknown)
    pub ttl: u8,
    /// Translation granule (0 = no range; 1 = 4KB, 2 = 16KB, 3 = 64KB)
    pub tg: u8,
    /// Range: (num + 1) << scale granules
    pub num: u8,
    pub scale: u8,
}

/// How a CMD_SYNC signals completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncCompletion {
    /// Completion is observed by polling the consumer index
    None,
    /// Raise the sync interrupt
    Irq,
    /// Send an event (wakes WFE)
    Sev,
}

/// A command the driver can issue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    PrefetchConfig { sid: u32 },
    CfgiSte { sid: u32, leaf: bool },
    /// Invalidate every cached STE and CD
    CfgiAll,
    CfgiCd { sid: u32, ssid: u32, leaf: bool },
    CfgiCdAll { sid: u32 },
    TlbiNhAsid { asid: u16, vmid: u16 },
    TlbiNhVa(TlbiRange),
    TlbiS12Vmall { vmid: u16 },
    TlbiS2Ipa(TlbiRange),
    /// Invalidate all non-secure, non-hypervisor TLB entries
    TlbiNsnhAll,
    AtcInv { sid: u32, ssid: Option<u32>, addr: u64, size_log2: u8, global: bool },
    Sync { cs: SyncCompletion },
}

type Dword0 = LocalRegisterCopy<u64, CMD0::Register>;
type Dword1 = LocalRegisterCopy<u64, CMD1::Register>;

impl Command {
    /// Opcode of this command.
    #[must_use]
    pub const fn opcode(&self) -> u8 {
        match self {
            Self::PrefetchConfig { .. } => opcode::PREFETCH_CFG,
            Self::CfgiSte { .. } => opcode::CFGI_STE,
            Self::CfgiAll => opcode::CFGI_ALL,
            Self::CfgiCd { .. } => opcode::CFGI_CD,
            Self::CfgiCdAll { .. } => opcode::CFGI_CD_ALL,
            Self::TlbiNhAsid { .. } => opcode::TLBI_NH_ASID,
            Self::TlbiNhVa(_) => opcode::TLBI_NH_VA,
            Self::TlbiS12Vmall { .. } => opcode::TLBI_S12_VMALL,
            Self::TlbiS2Ipa(_) => opcode::TLBI_S2_IPA,
            Self::TlbiNsnhAll => opcode::TLBI_NSNH_ALL,
            Self::AtcInv { .. } => opcode::ATC_INV,
            Self::Sync { .. } => opcode::CMD_SYNC,
        }
    }

    /// Check whether the command is a TLB invalidation.
    #[must_use]
    pub const fn is_tlbi(&self) -> bool {
        matches!(
            self,
            Self::TlbiNhAsid { .. }
                | Self::TlbiNhVa(_)
                | Self::TlbiS12Vmall { .. }
                | Self::TlbiS2Ipa(_)
                | Self::TlbiNsnhAll
        )
    }

    /// Produce the wire format.
    #[must_use]
    pub fn encode(&self) -> CmdEntry {
        let mut d0 = Dword0::new(0);
        let mut d1 = Dword1::new(0);
        d0.write(CMD0::OP.val(u64::from(self.opcode())));

        match *self {
            Self::PrefetchConfig { sid } | Self::CfgiCdAll { sid } => {
                d0.modify(CMD0::SID.val(u64::from(sid)));
            }
            Self::CfgiSte { sid, leaf } => {
                d0.modify(CMD0::SID.val(u64::from(sid)));
                d1.modify(CMD1::LEAF.val(u64::from(leaf)));
            }
            Self::CfgiAll => d1.modify(CMD1::RANGE.val(31)),
            Self::CfgiCd { sid, ssid, leaf } => {
                d0.modify(CMD0::SID.val(u64::from(sid)) + CMD0::SSID.val(u64::from(ssid)));
                d1.modify(CMD1::LEAF.val(u64::from(leaf)));
            }
            Self::TlbiNhAsid { asid, vmid } => {
                d0.modify(CMD0::ASID.val(u64::from(asid)) + CMD0::VMID.val(u64::from(vmid)));
            }
            Self::TlbiS12Vmall { vmid } => d0.modify(CMD0::VMID.val(u64::from(vmid))),
            Self::TlbiNhVa(r) => {
                encode_range(&mut d0, &mut d1, &r);
                d0.modify(CMD0::ASID.val(u64::from(r.asid)));
                d1.set(d1.get() | (r.addr & !0xFFF));
            }
            Self::TlbiS2Ipa(r) => {
                encode_range(&mut d0, &mut d1, &r);
                d1.set(d1.get() | (r.addr & IPA_MASK));
            }
            Self::TlbiNsnhAll => {}
            Self::AtcInv {
                sid,
                ssid,
                addr,
                size_log2,
                global,
            } => {
                d0.modify(CMD0::SID.val(u64::from(sid)) + CMD0::ATC_GLOBAL.val(u64::from(global)));
                if let Some(ssid) = ssid {
                    d0.modify(CMD0::SSV::SET + CMD0::SSID.val(u64::from(ssid)));
                }
                d1.modify(CMD1::ATC_SIZE.val(u64::from(size_log2)));
                d1.set(d1.get() | (addr & !0xFFF));
            }
            Self::Sync { cs } => {
                let cs = match cs {
                    SyncCompletion::None => CMD0::SYNC_CS::Poll,
                    SyncCompletion::Irq => CMD0::SYNC_CS::Irq,
                    SyncCompletion::Sev => CMD0::SYNC_CS::Sev,
                };
                d0.modify(cs);
            }
        }

        CmdEntry {
            dwords: [d0.get(), d1.get()],
        }
    }

    /// Parse a queue slot, or `None` for an opcode the driver never issues.
    #[must_use]
    pub fn decode(entry: &CmdEntry) -> Option<Self> {
        let d0 = Dword0::new(entry.dwords[0]);
        let d1 = Dword1::new(entry.dwords[1]);
        let sid = d0.read(CMD0::SID) as u32;
        let leaf = d1.is_set(CMD1::LEAF);

        let cmd = match d0.read(CMD0::OP) as u8 {
            opcode::PREFETCH_CFG => Self::PrefetchConfig { sid },
            opcode::CFGI_STE => Self::CfgiSte { sid, leaf },
            opcode::CFGI_ALL => Self::CfgiAll,
            opcode::CFGI_CD => Self::CfgiCd {
                sid,
                ssid: d0.read(CMD0::SSID) as u32,
                leaf,
            },
            opcode::CFGI_CD_ALL => Self::CfgiCdAll { sid },
            opcode::TLBI_NH_ASID => Self::TlbiNhAsid {
                asid: d0.read(CMD0::ASID) as u16,
                vmid: d0.read(CMD0::VMID) as u16,
            },
            opcode::TLBI_NH_VA => Self::TlbiNhVa(TlbiRange {
                addr: entry.dwords[1] & !0xFFF,
                ..decode_range(&d0, &d1)
            }),
            opcode::TLBI_S12_VMALL => Self::TlbiS12Vmall {
                vmid: d0.read(CMD0::VMID) as u16,
            },
            opcode::TLBI_S2_IPA => Self::TlbiS2Ipa(TlbiRange {
                addr: entry.dwords[1] & IPA_MASK,
                asid: 0,
                ..decode_range(&d0, &d1)
            }),
            opcode::TLBI_NSNH_ALL => Self::TlbiNsnhAll,
            opcode::ATC_INV => Self::AtcInv {
                sid,
                ssid: d0
                    .is_set(CMD0::SSV)
                    .then(|| d0.read(CMD0::SSID) as u32),
                addr: entry.dwords[1] & !0xFFF,
                size_log2: d1.read(CMD1::ATC_SIZE) as u8,
                global: d0.is_set(CMD0::ATC_GLOBAL),
            },
            opcode::CMD_SYNC => Self::Sync {
                cs: match d0.read_as_enum(CMD0::SYNC_CS) {
                    Some(CMD0::SYNC_CS::Value::Irq) => SyncCompletion::Irq,
                    Some(CMD0::SYNC_CS::Value::Sev) => SyncCompletion::Sev,
                    _ => SyncCompletion::None,
                },
            },
            _ => return None,
        };
        Some(cmd)
    }
}

fn encode_range(d0: &mut Dword0, d1: &mut Dword1, r: &TlbiRange) {
    d0.modify(
        CMD0::VMID.val(u64::from(r.vmid))
            + CMD0::NUM.val(u64::from(r.num))
            + CMD0::SCALE.val(u64::from(r.scale)),
    );
    d1.modify(
        CMD1::LEAF.val(u64::from(r.leaf))
            + CMD1::TTL.val(u64::from(r.ttl))
            + CMD1::TG.val(u64::from(r.tg)),
    );
}

fn decode_range(d0: &Dword0, d1: &Dword1) -> TlbiRange {
    TlbiRange {
        asid: d0.read(CMD0::ASID) as u16,
        vmid: d0.read(CMD0::VMID) as u16,
        addr: 0,
        leaf: d1.is_set(CMD1::LEAF),
        ttl: d1.read(CMD1::TTL) as u8,
        tg: d1.read(CMD1::TG) as u8,
        num: d0.read(CMD0::NUM) as u8,
        scale: d0.read(CMD0::SCALE) as u8,
    }
}

impl From<Command> for CmdEntry {
    fn from(cmd: Command) -> Self {
        cmd.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cfgi_ste_layout() {
        let entry = Command::CfgiSte { sid: 0x1234, leaf: true }.encode();
        assert_eq!(entry.dwords[0], 0x03 | (0x1234 << 32));
        assert_eq!(entry.dwords[1], 1);
    }

    #[test]
    fn test_cfgi_all_uses_full_range() {
        let entry = Command::CfgiAll.encode();
        assert_eq!(entry.dwords, [0x04, 31]);
    }

    #[test]
    fn test_tlbi_nh_asid_layout() {
        let entry = Command::TlbiNhAsid { asid: 0xBEEF, vmid: 0 }.encode();
        assert_eq!(entry.dwords[0], 0x11 | (0xBEEF << 48));
    }

    #[test]
    fn test_tlbi_range_layout() {
        let range = TlbiRange {
            asid: 7,
            vmid: 0,
            addr: 0x4000_1000,
            leaf: true,
            ttl: 3,
            tg: 1,
            num: 4,
            scale: 2,
        };
        let entry = Command::TlbiNhVa(range).encode();
        assert_eq!(entry.dwords[0], 0x12 | (4 << 12) | (2 << 20) | (7 << 48));
        assert_eq!(entry.dwords[1], 0x4000_1000 | 1 | (3 << 8) | (1 << 10));
        assert_eq!(Command::decode(&entry), Some(Command::TlbiNhVa(range)));
    }

    #[test]
    fn test_stage2_ipa_masks_high_bits() {
        let range = TlbiRange {
            vmid: 3,
            addr: 0xFFF0_0000_0000_2000,
            ..TlbiRange::default()
        };
        let entry = Command::TlbiS2Ipa(range).encode();
        assert_eq!(entry.dwords[1], 0x2000);
        assert_eq!((entry.dwords[0] >> 32) & 0xFFFF, 3);
    }

    #[test]
    fn test_sync_completion_signal() {
        let entry = Command::Sync { cs: SyncCompletion::Sev }.encode();
        assert_eq!(entry.dwords[0], 0x46 | (2 << 12));
        assert_eq!(
            Command::decode(&entry),
            Some(Command::Sync { cs: SyncCompletion::Sev })
        );
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert_eq!(Command::decode(&CmdEntry { dwords: [0x7f, 0] }), None);
    }

    #[test]
    fn test_atc_inv_substream() {
        let cmd = Command::AtcInv {
            sid: 9,
            ssid: Some(3),
            addr: 0x10_0000,
            size_log2: 52,
            global: false,
        };
        assert_eq!(Command::decode(&cmd.encode()), Some(cmd));
    }
}
