//! Page table configuration and controller register values
//!
//! An [`IoPgtableCfg`] fixes the translation stage, the input and output
//! address sizes and the page sizes the controller supports. Once the table
//! exists, [`IoPageTable::stage1_regs`](crate::IoPageTable::stage1_regs) or
//! [`IoPageTable::stage2_regs`](crate::IoPageTable::stage2_regs) produce the
//! values a controller writes into its context descriptor or stream table
//! entry.

use warden_common::memory::page;

use crate::SUPPORTED_PGSIZES;
use crate::error::PgtableError;

/// Translation stage of a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoPgtableFormat {
    /// VA→PA, tagged by ASID, installed through a context descriptor
    Stage1,
    /// IPA→PA, tagged by VMID, installed directly in the stream table entry
    Stage2,
}

impl IoPgtableFormat {
    /// Check whether tables of this format are tagged by ASID.
    #[inline]
    #[must_use]
    pub const fn is_stage1(self) -> bool {
        matches!(self, Self::Stage1)
    }
}

/// Page table configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IoPgtableCfg {
    /// Translation stage
    pub fmt: IoPgtableFormat,
    /// Page sizes the controller supports (bit n set = 2^n bytes)
    pub pgsize_bitmap: u64,
    /// Input address size in bits
    pub ias: u32,
    /// Output address size in bits
    pub oas: u32,
    /// The controller's table walks snoop CPU caches
    pub coherent_walk: bool,
}

// -- MAIR attribute encodings and indices

/// Normal memory, inner/outer non-cacheable
pub const MAIR_ATTR_NC: u64 = 0x44;
/// Normal memory, inner/outer write-back read/write-allocate
pub const MAIR_ATTR_WBRWA: u64 = 0xff;
/// Device-nGnRE
pub const MAIR_ATTR_DEVICE: u64 = 0x04;

/// MAIR index of non-cacheable memory
pub const MAIR_IDX_NC: u64 = 0;
/// MAIR index of cacheable memory
pub const MAIR_IDX_CACHE: u64 = 1;
/// MAIR index of device memory
pub const MAIR_IDX_DEV: u64 = 2;

/// MAIR value matching the indices above
pub const MAIR: u64 = (MAIR_ATTR_NC << (8 * MAIR_IDX_NC))
    | (MAIR_ATTR_WBRWA << (8 * MAIR_IDX_CACHE))
    | (MAIR_ATTR_DEVICE << (8 * MAIR_IDX_DEV));

/// Cacheability encoding for table walks: write-back, read/write-allocate
pub const RGN_WBWA: u8 = 0b01;
/// Cacheability encoding for table walks: non-cacheable
pub const RGN_NC: u8 = 0b00;
/// Shareability encoding: inner shareable
pub const SH_IS: u8 = 0b11;
/// Shareability encoding: outer shareable
pub const SH_OS: u8 = 0b10;
/// Granule encoding for 4KB (TG0 and VTCR.TG0)
pub const TG_4K: u8 = 0b00;

/// Stage 1 translation control fields (TCR format, TTB0 half).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tcr {
    pub t0sz: u8,
    pub tg0: u8,
    pub irgn0: u8,
    pub orgn0: u8,
    pub sh0: u8,
    pub ips: u8,
}

/// Values a controller needs to install a stage 1 table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage1Regs {
    pub ttbr: u64,
    pub tcr: Tcr,
    pub mair: u64,
}

/// Stage 2 translation control fields (VTCR format).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Vtcr {
    pub t0sz: u8,
    pub sl0: u8,
    pub irgn0: u8,
    pub orgn0: u8,
    pub sh0: u8,
    pub tg0: u8,
    pub ps: u8,
}

/// Values a controller needs to install a stage 2 table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stage2Regs {
    pub vttbr: u64,
    pub vtcr: Vtcr,
}

/// Encode a physical address size for TCR.IPS / VTCR.PS.
#[must_use]
pub const fn pa_size_encoding(bits: u32) -> Option<u8> {
    match bits {
        32 => Some(0b000),
        36 => Some(0b001),
        40 => Some(0b010),
        42 => Some(0b011),
        44 => Some(0b100),
        48 => Some(0b101),
        _ => None,
    }
}

impl IoPgtableCfg {
    /// Restrict the configuration to what this format supports.
    ///
    /// Page sizes outside 4KB/2MB/1GB are dropped from the bitmap; the
    /// configuration is rejected if nothing remains, if the input address
    /// size is outside 32..=48 bits or if the output size has no encoding.
    pub fn finalize(mut self) -> Result<Self, PgtableError> {
        self.pgsize_bitmap &= SUPPORTED_PGSIZES;
        if self.pgsize_bitmap & page::SIZE_4K == 0 {
            return Err(PgtableError::InvalidConfig);
        }
        if !(32..=48).contains(&self.ias) || pa_size_encoding(self.oas).is_none() {
            return Err(PgtableError::InvalidConfig);
        }
        Ok(self)
    }

    /// Number of translation levels needed to resolve `ias` bits.
    #[inline]
    #[must_use]
    pub const fn levels(&self) -> u32 {
        (self.ias - page::SHIFT_4K).div_ceil(9)
    }

    /// First level of the walk (0 for a four-level table).
    #[inline]
    #[must_use]
    pub const fn start_level(&self) -> u32 {
        4 - self.levels()
    }

    /// Smallest page size.
    #[inline]
    #[must_use]
    pub const fn granule(&self) -> u64 {
        1 << self.pgsize_bitmap.trailing_zeros()
    }

    /// Table walk cacheability for this configuration.
    #[inline]
    #[must_use]
    pub const fn walk_rgn(&self) -> u8 {
        if self.coherent_walk { RGN_WBWA } else { RGN_NC }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(ias: u32) -> IoPgtableCfg {
        IoPgtableCfg {
            fmt: IoPgtableFormat::Stage1,
            pgsize_bitmap: page::SIZE_4K | page::SIZE_2M | page::SIZE_1G | (1 << 16),
            ias,
            oas: 48,
            coherent_walk: true,
        }
    }

    #[test]
    fn test_levels_and_start_level() {
        assert_eq!(cfg(48).levels(), 4);
        assert_eq!(cfg(48).start_level(), 0);
        assert_eq!(cfg(39).levels(), 3);
        assert_eq!(cfg(39).start_level(), 1);
        assert_eq!(cfg(40).levels(), 4);
        assert_eq!(cfg(32).start_level(), 1);
    }

    #[test]
    fn test_finalize_masks_page_sizes() {
        let finalized = cfg(48).finalize().unwrap();
        assert_eq!(finalized.pgsize_bitmap, SUPPORTED_PGSIZES);
        assert_eq!(finalized.granule(), page::SIZE_4K);
    }

    #[test]
    fn test_finalize_rejects_bad_sizes() {
        let mut bad = cfg(48);
        bad.oas = 47;
        assert_eq!(bad.finalize(), Err(PgtableError::InvalidConfig));

        let mut bad = cfg(48);
        bad.pgsize_bitmap = 1 << 16;
        assert_eq!(bad.finalize(), Err(PgtableError::InvalidConfig));

        assert_eq!(cfg(52).finalize(), Err(PgtableError::InvalidConfig));
    }

    #[test]
    fn test_mair_layout() {
        assert_eq!(MAIR & 0xff, MAIR_ATTR_NC);
        assert_eq!((MAIR >> 8) & 0xff, MAIR_ATTR_WBRWA);
        assert_eq!((MAIR >> 16) & 0xff, MAIR_ATTR_DEVICE);
    }
}
