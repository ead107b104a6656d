//! LPAE descriptor encoding
//!
//! Descriptor format (4KB granule):
//! ```text
//! +-----+----+--------+------------------------+----+----+----+----+-------+----+----+
//! | ... | XN |  ...   | Output address [47:12] | nG | AF | SH | AP | ATTR  | T  | V  |
//! +-----+----+--------+------------------------+----+----+----+----+-------+----+----+
//!        54            47                    12  11   10  9  8 7  6 5    2  1    0
//! ```
//!
//! Stage 1 uses bits [4:2] as a MAIR index and bits [7:6] as AP (bit 6
//! unprivileged access, bit 7 read-only). Stage 2 uses bits [5:2] as a direct
//! memory attribute and bits [7:6] as S2AP (bit 6 read, bit 7 write).
//!
//! At levels 0-2 `T=1` marks a table descriptor and `T=0` a block; at level 3
//! `T=1` marks a page.

use tock_registers::{LocalRegisterCopy, register_bitfields};
use warden_common::PhysAddr;

use crate::config::{IoPgtableFormat, MAIR_IDX_CACHE, MAIR_IDX_DEV, MAIR_IDX_NC};
use crate::prot::IommuProt;

register_bitfields![u64,
    /// I/O page table entry fields
    pub IOPTE [
        /// Entry is valid when set
        VALID OFFSET(0) NUMBITS(1) [],

        /// 0=Block, 1=Table (levels 0-2) or Page (level 3)
        TYPE OFFSET(1) NUMBITS(1) [
            Block = 0,
            TableOrPage = 1
        ],

        /// Stage 1 memory attribute index into MAIR
        ATTR_INDX OFFSET(2) NUMBITS(3) [],

        /// Stage 2 memory attributes
        MEMATTR OFFSET(2) NUMBITS(4) [
            Device = 0b0001,
            NonCacheable = 0b0101,
            WriteBack = 0b1111
        ],

        /// Stage 1: accessible from unprivileged transactions
        AP_UNPRIV OFFSET(6) NUMBITS(1) [],

        /// Stage 1: read-only
        AP_RDONLY OFFSET(7) NUMBITS(1) [],

        /// Stage 2: read permitted
        S2AP_READ OFFSET(6) NUMBITS(1) [],

        /// Stage 2: write permitted
        S2AP_WRITE OFFSET(7) NUMBITS(1) [],

        /// Shareability
        SH OFFSET(8) NUMBITS(2) [
            NonShareable = 0b00,
            OuterShareable = 0b10,
            InnerShareable = 0b11
        ],

        /// Access flag
        AF OFFSET(10) NUMBITS(1) [],

        /// Not global (stage 1, ASID-tagged)
        NG OFFSET(11) NUMBITS(1) [],

        /// Output address bits [47:12]
        OA OFFSET(12) NUMBITS(36) [],

        /// Execute never
        XN OFFSET(54) NUMBITS(1) []
    ]
];

type Pte = LocalRegisterCopy<u64, IOPTE::Register>;

/// Deepest level of a 4KB-granule walk.
pub const LEAF_LEVEL: u32 = 3;

/// Address bits resolved below `level` (12 at level 3, 39 at level 0).
#[inline]
#[must_use]
pub const fn level_shift(level: u32) -> u32 {
    12 + 9 * (LEAF_LEVEL - level)
}

/// Bytes covered by one entry at `level`.
#[inline]
#[must_use]
pub const fn level_size(level: u32) -> u64 {
    1 << level_shift(level)
}

/// Index of `iova` in a table at `level`.
#[inline]
#[must_use]
pub const fn level_index(iova: u64, level: u32) -> usize {
    ((iova >> level_shift(level)) & 0x1ff) as usize
}

/// Level at which a leaf of `pgsize` bytes lives.
#[inline]
#[must_use]
pub const fn leaf_level_for(pgsize: u64) -> Option<u32> {
    match pgsize {
        0x1000 => Some(3),
        0x20_0000 => Some(2),
        0x4000_0000 => Some(1),
        _ => None,
    }
}

#[inline]
#[must_use]
pub fn is_valid(raw: u64) -> bool {
    Pte::new(raw).is_set(IOPTE::VALID)
}

/// A table descriptor at `level` (never true at the leaf level).
#[inline]
#[must_use]
pub fn is_table(raw: u64, level: u32) -> bool {
    level < LEAF_LEVEL
        && is_valid(raw)
        && Pte::new(raw).matches_all(IOPTE::TYPE::TableOrPage)
}

/// Output address of a table, block or page descriptor.
#[inline]
#[must_use]
pub fn output_address(raw: u64) -> PhysAddr {
    PhysAddr::new(Pte::new(raw).read(IOPTE::OA) << 12)
}

/// Build a table descriptor pointing at `table`.
#[must_use]
pub fn table_descriptor(table: PhysAddr) -> u64 {
    let mut pte = Pte::new(0);
    pte.write(IOPTE::VALID::SET + IOPTE::TYPE::TableOrPage + IOPTE::OA.val(table.as_u64() >> 12));
    pte.get()
}

/// Build a block (levels 1-2) or page (level 3) descriptor.
#[must_use]
pub fn leaf_descriptor(pa: PhysAddr, level: u32, prot: IommuProt, fmt: IoPgtableFormat) -> u64 {
    let mut pte = Pte::new(0);
    let kind = if level == LEAF_LEVEL {
        IOPTE::TYPE::TableOrPage
    } else {
        IOPTE::TYPE::Block
    };
    pte.write(IOPTE::VALID::SET + kind + IOPTE::AF::SET + IOPTE::OA.val(pa.as_u64() >> 12));

    match fmt {
        IoPgtableFormat::Stage1 => {
            pte.modify(IOPTE::NG::SET);
            if prot.contains(IommuProt::READ) && !prot.contains(IommuProt::WRITE) {
                pte.modify(IOPTE::AP_RDONLY::SET);
            }
            if !prot.contains(IommuProt::PRIV) {
                pte.modify(IOPTE::AP_UNPRIV::SET);
            }
            let idx = if prot.contains(IommuProt::MMIO) {
                MAIR_IDX_DEV
            } else if prot.contains(IommuProt::CACHE) {
                MAIR_IDX_CACHE
            } else {
                MAIR_IDX_NC
            };
            pte.modify(IOPTE::ATTR_INDX.val(idx));
        }
        IoPgtableFormat::Stage2 => {
            if prot.contains(IommuProt::READ) {
                pte.modify(IOPTE::S2AP_READ::SET);
            }
            if prot.contains(IommuProt::WRITE) {
                pte.modify(IOPTE::S2AP_WRITE::SET);
            }
            let attr = if prot.contains(IommuProt::MMIO) {
                IOPTE::MEMATTR::Device
            } else if prot.contains(IommuProt::CACHE) {
                IOPTE::MEMATTR::WriteBack
            } else {
                IOPTE::MEMATTR::NonCacheable
            };
            pte.modify(attr);
        }
    }

    if prot.contains(IommuProt::CACHE) {
        pte.modify(IOPTE::SH::InnerShareable);
    } else {
        pte.modify(IOPTE::SH::OuterShareable);
    }
    if prot.contains(IommuProt::NOEXEC) {
        pte.modify(IOPTE::XN::SET);
    }
    pte.get()
}

/// Access a leaf descriptor grants, decoded back into [`IommuProt`].
#[must_use]
pub fn leaf_prot(raw: u64, fmt: IoPgtableFormat) -> IommuProt {
    let pte = Pte::new(raw);
    let mut prot = IommuProt::empty();
    match fmt {
        IoPgtableFormat::Stage1 => {
            prot |= IommuProt::READ;
            if !pte.is_set(IOPTE::AP_RDONLY) {
                prot |= IommuProt::WRITE;
            }
            if !pte.is_set(IOPTE::AP_UNPRIV) {
                prot |= IommuProt::PRIV;
            }
            match pte.read(IOPTE::ATTR_INDX) {
                MAIR_IDX_DEV => prot |= IommuProt::MMIO,
                MAIR_IDX_CACHE => prot |= IommuProt::CACHE,
                _ => {}
            }
        }
        IoPgtableFormat::Stage2 => {
            if pte.is_set(IOPTE::S2AP_READ) {
                prot |= IommuProt::READ;
            }
            if pte.is_set(IOPTE::S2AP_WRITE) {
                prot |= IommuProt::WRITE;
            }
            match pte.read_as_enum(IOPTE::MEMATTR) {
                Some(IOPTE::MEMATTR::Value::Device) => prot |= IommuProt::MMIO,
                Some(IOPTE::MEMATTR::Value::WriteBack) => prot |= IommuProt::CACHE,
                _ => {}
            }
        }
    }
    if pte.is_set(IOPTE::XN) {
        prot |= IommuProt::NOEXEC;
    }
    prot
}
