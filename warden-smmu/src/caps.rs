//! Capability probe
//!
//! Decodes the identification registers into a [`Features`] set and the
//! limits everything above depends on (identifier widths, address sizes,
//! page sizes, queue maxima), then selects the [`SmmuImplementation`] for
//! the hardware family once. The selected implementation is stored as a
//! `&'static dyn` reference and never re-dispatched per call.

use bitflags::bitflags;
use tock_registers::LocalRegisterCopy;
use warden_common::memory::page;
use warden_mmio::RegisterIo;

use crate::config::{DeviceDescriptor, SmmuConfig};
use crate::error::SmmuError;
use crate::regs::{
    IDR0, IDR1, IDR3, IDR5, IIDR, SMMU_IDR0, SMMU_IDR1, SMMU_IDR3, SMMU_IDR5, SMMU_IIDR,
    oas_bits,
};

bitflags! {
    /// Hardware features relevant to the driver.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        const TWO_LVL_STRTAB = 1 << 0;
        const TWO_LVL_CDTAB = 1 << 1;
        const TT_LE = 1 << 2;
        const TT_BE = 1 << 3;
        const PRI = 1 << 4;
        const ATS = 1 << 5;
        const SEV = 1 << 6;
        const MSI = 1 << 7;
        const COHERENCY = 1 << 8;
        const TRANS_S1 = 1 << 9;
        const TRANS_S2 = 1 << 10;
        const STALLS = 1 << 11;
        const HYP = 1 << 12;
        const STALL_FORCE = 1 << 13;
        const VAX = 1 << 14;
        const RANGE_INV = 1 << 15;
        const BTM = 1 << 16;
        const ASID16 = 1 << 17;
        const VMID16 = 1 << 18;
    }
}

bitflags! {
    /// Implementation-specific deviations from the architecture.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Quirks: u32 {
        /// PREFETCH_CFG is broken and must not be issued
        const SKIP_PREFETCH = 1 << 0;
        /// A CMD_SYNC is required before the queue may wrap under a batch
        const CMDQ_FORCE_SYNC = 1 << 1;
    }
}

/// An IOVA window devices must not use for DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedRegion {
    pub start: u64,
    pub size: u64,
    pub kind: ReservedKind,
}

/// Purpose of a reserved region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservedKind {
    /// Software-managed MSI doorbell window
    SoftwareMsi,
    /// Doorbell the implementation decodes itself
    HardwareMsi,
}

/// IOVA base of the software MSI window
pub const MSI_IOVA_BASE: u64 = 0x0800_0000;
/// Size of the software MSI window
pub const MSI_IOVA_LENGTH: u64 = 0x0010_0000;

const SW_MSI_WINDOW: [ReservedRegion; 1] = [ReservedRegion {
    start: MSI_IOVA_BASE,
    size: MSI_IOVA_LENGTH,
    kind: ReservedKind::SoftwareMsi,
}];

/// Behaviour that varies per hardware family.
pub trait SmmuImplementation: Send + Sync {
    /// Human-readable family name.
    fn name(&self) -> &'static str;

    /// Remove features the family advertises but cannot be trusted with.
    fn adjust_features(&self, features: Features) -> Features {
        features
    }

    /// Quirks the driver must honour.
    fn quirks(&self) -> Quirks {
        Quirks::empty()
    }

    /// IOVA windows to keep out of every domain.
    fn reserved_regions(&self) -> &'static [ReservedRegion] {
        &SW_MSI_WINDOW
    }
}

/// Any architecture-compliant implementation.
pub struct GenericSmmu;

impl SmmuImplementation for GenericSmmu {
    fn name(&self) -> &'static str {
        "generic"
    }
}

/// Arm CoreLink MMU-700.
pub struct ArmMmu700;

impl SmmuImplementation for ArmMmu700 {
    fn name(&self) -> &'static str {
        "arm,mmu-700"
    }

    // Errata 2812531: broadcast TLB maintenance is unreliable and a batch
    // that wraps the queue must be split by a CMD_SYNC.
    fn adjust_features(&self, features: Features) -> Features {
        features - Features::BTM
    }

    fn quirks(&self) -> Quirks {
        Quirks::CMDQ_FORCE_SYNC
    }
}

/// HiSilicon HIP08 (Hi1620).
pub struct HisiliconHip08;

const HIP08_MSI_WINDOWS: [ReservedRegion; 2] = [
    SW_MSI_WINDOW[0],
    ReservedRegion {
        start: 0x2_0000_0000,
        size: 0x10_0000,
        kind: ReservedKind::HardwareMsi,
    },
];

impl SmmuImplementation for HisiliconHip08 {
    fn name(&self) -> &'static str {
        "hisilicon,hip08"
    }

    fn quirks(&self) -> Quirks {
        Quirks::SKIP_PREFETCH
    }

    fn reserved_regions(&self) -> &'static [ReservedRegion] {
        &HIP08_MSI_WINDOWS
    }
}

static GENERIC: GenericSmmu = GenericSmmu;
static MMU_700: ArmMmu700 = ArmMmu700;
static HIP08: HisiliconHip08 = HisiliconHip08;

/// JEP106 code of Arm Ltd
pub const IIDR_IMPLEMENTER_ARM: u32 = 0x43B;
/// JEP106 code of HiSilicon
pub const IIDR_IMPLEMENTER_HISILICON: u32 = 0x736;
/// Product ID of MMU-700
pub const IIDR_PRODUCT_MMU_700: u32 = 0x487;
/// Product ID of HIP08
pub const IIDR_PRODUCT_HIP08: u32 = 0x502;

/// Select the implementation for an IIDR value.
#[must_use]
pub fn select_implementation(iidr: u32) -> &'static dyn SmmuImplementation {
    let iidr: LocalRegisterCopy<u32, IIDR::Register> = LocalRegisterCopy::new(iidr);
    match (iidr.read(IIDR::IMPLEMENTER), iidr.read(IIDR::PRODUCT_ID)) {
        (IIDR_IMPLEMENTER_ARM, IIDR_PRODUCT_MMU_700) => &MMU_700,
        (IIDR_IMPLEMENTER_HISILICON, IIDR_PRODUCT_HIP08) => &HIP08,
        _ => &GENERIC,
    }
}

/// Everything the probe learned about one controller.
#[derive(Clone, Copy)]
pub struct Caps {
    pub features: Features,
    pub quirks: Quirks,
    /// Stream ID width, capped by configuration
    pub sid_bits: u32,
    /// Substream ID width, capped by configuration
    pub ssid_bits: u32,
    pub asid_bits: u32,
    pub vmid_bits: u32,
    /// Input address size for stage 2 (and the stage 1 output size)
    pub ias: u32,
    /// Output address size
    pub oas: u32,
    pub pgsize_bitmap: u64,
    /// log2 of the largest command queue
    pub cmdq_max_log2: u32,
    /// log2 of the largest event queue
    pub evtq_max_log2: u32,
    pub implementation: &'static dyn SmmuImplementation,
}

impl Caps {
    /// Read and validate the identification registers.
    pub fn probe<R: RegisterIo + ?Sized>(
        io: &R,
        desc: &DeviceDescriptor,
        config: &SmmuConfig,
    ) -> Result<Self, SmmuError> {
        let idr0: LocalRegisterCopy<u32, IDR0::Register> =
            LocalRegisterCopy::new(io.read32(SMMU_IDR0));
        let idr1: LocalRegisterCopy<u32, IDR1::Register> =
            LocalRegisterCopy::new(io.read32(SMMU_IDR1));
        let idr3: LocalRegisterCopy<u32, IDR3::Register> =
            LocalRegisterCopy::new(io.read32(SMMU_IDR3));
        let idr5: LocalRegisterCopy<u32, IDR5::Register> =
            LocalRegisterCopy::new(io.read32(SMMU_IDR5));
        let iidr = io.read32(SMMU_IIDR);

        let mut features = Features::empty();
        if idr0.matches_all(IDR0::ST_LEVEL::TwoLevel) {
            features |= Features::TWO_LVL_STRTAB;
        }
        if idr0.is_set(IDR0::CD2L) {
            features |= Features::TWO_LVL_CDTAB;
        }
        match idr0.read_as_enum(IDR0::TTENDIAN) {
            Some(IDR0::TTENDIAN::Value::Mixed) => features |= Features::TT_LE | Features::TT_BE,
            Some(IDR0::TTENDIAN::Value::Little) => features |= Features::TT_LE,
            Some(IDR0::TTENDIAN::Value::Big) => features |= Features::TT_BE,
            None => {}
        }
        if !features.contains(Features::TT_LE) {
            log::error!("smmu: little-endian translation tables not supported");
            return Err(SmmuError::Configuration);
        }
        if !matches!(
            idr0.read_as_enum(IDR0::TTF),
            Some(IDR0::TTF::Value::AArch64 | IDR0::TTF::Value::Both)
        ) {
            log::error!("smmu: AArch64 translation tables not supported");
            return Err(SmmuError::Configuration);
        }

        let flag = |set: bool, f: Features| if set { f } else { Features::empty() };
        features |= flag(idr0.is_set(IDR0::PRI), Features::PRI);
        features |= flag(idr0.is_set(IDR0::ATS), Features::ATS);
        features |= flag(idr0.is_set(IDR0::SEV), Features::SEV);
        features |= flag(idr0.is_set(IDR0::MSI), Features::MSI);
        features |= flag(idr0.is_set(IDR0::HYP), Features::HYP);
        features |= flag(idr0.is_set(IDR0::BTM), Features::BTM);
        features |= flag(idr0.is_set(IDR0::S1P), Features::TRANS_S1);
        features |= flag(idr0.is_set(IDR0::S2P), Features::TRANS_S2);
        features |= flag(idr0.is_set(IDR0::ASID16), Features::ASID16);
        features |= flag(idr0.is_set(IDR0::VMID16), Features::VMID16);
        features |= flag(idr3.is_set(IDR3::RIL), Features::RANGE_INV);
        features |= flag(idr5.read(IDR5::VAX) == 1, Features::VAX);
        match idr0.read_as_enum(IDR0::STALL_MODEL) {
            Some(IDR0::STALL_MODEL::Value::Stall) => features |= Features::STALLS,
            Some(IDR0::STALL_MODEL::Value::Force) => {
                features |= Features::STALLS | Features::STALL_FORCE;
            }
            _ => {}
        }

        // The firmware description wins over IDR0.COHACC.
        if desc.coherent {
            features |= Features::COHERENCY;
        } else if idr0.is_set(IDR0::COHACC) {
            log::warn!("smmu: IDR0.COHACC set but firmware says non-coherent");
        }

        if !features.intersects(Features::TRANS_S1 | Features::TRANS_S2) {
            log::error!("smmu: no translation stage supported");
            return Err(SmmuError::Configuration);
        }

        if !config.enable_ats {
            features -= Features::ATS;
        }

        let implementation = select_implementation(iidr);
        let features = implementation.adjust_features(features);
        let quirks = desc.quirks.unwrap_or_else(|| implementation.quirks());

        if !idr5.is_set(IDR5::GRAN4K) {
            log::error!("smmu: 4KB granule not supported");
            return Err(SmmuError::Configuration);
        }
        let pgsize_bitmap = page::SIZE_4K | page::SIZE_2M | page::SIZE_1G;

        let Some(oas) = oas_bits(idr5.read(IDR5::OAS)) else {
            log::error!("smmu: unknown output address size");
            return Err(SmmuError::Configuration);
        };
        // Page tables are limited to 48-bit addresses.
        let oas = oas.min(48);
        let ias = oas.max(if features.contains(Features::TRANS_S1) { 48 } else { 0 }).min(48);

        let sid_bits = idr1.read(IDR1::SIDSIZE).min(config.max_sid_bits);
        let ssid_bits = idr1.read(IDR1::SSIDSIZE).min(config.max_ssid_bits);

        let caps = Self {
            features,
            quirks,
            sid_bits,
            ssid_bits,
            asid_bits: if features.contains(Features::ASID16) { 16 } else { 8 },
            vmid_bits: if features.contains(Features::VMID16) { 16 } else { 8 },
            ias,
            oas,
            pgsize_bitmap,
            cmdq_max_log2: idr1.read(IDR1::CMDQS),
            evtq_max_log2: idr1.read(IDR1::EVTQS),
            implementation,
        };

        log::info!(
            "smmu: {} features={:?} sid={} ssid={} ias={} oas={} cmdq<=2^{} evtq<=2^{}",
            implementation.name(),
            caps.features,
            caps.sid_bits,
            caps.ssid_bits,
            caps.ias,
            caps.oas,
            caps.cmdq_max_log2,
            caps.evtq_max_log2
        );
        Ok(caps)
    }

    /// Check whether the controller can translate at the given stage.
    #[inline]
    #[must_use]
    pub fn supports_stage(&self, stage1: bool) -> bool {
        if stage1 {
            self.features.contains(Features::TRANS_S1)
        } else {
            self.features.contains(Features::TRANS_S2)
        }
    }
}

impl core::fmt::Debug for Caps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Caps")
            .field("implementation", &self.implementation.name())
            .field("features", &self.features)
            .field("quirks", &self.quirks)
            .field("sid_bits", &self.sid_bits)
            .field("ssid_bits", &self.ssid_bits)
            .field("ias", &self.ias)
            .field("oas", &self.oas)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimConfig, SimSmmu};

    fn probe(sim_cfg: SimConfig) -> Result<Caps, SmmuError> {
        let sim = SimSmmu::new(sim_cfg);
        Caps::probe(&sim, &DeviceDescriptor::default(), &SmmuConfig::default())
    }

    #[test]
    fn test_probe_decodes_features() {
        let caps = probe(SimConfig::default()).unwrap();
        assert!(caps.features.contains(Features::TRANS_S1 | Features::TRANS_S2));
        assert!(caps.features.contains(Features::TWO_LVL_STRTAB));
        assert!(caps.features.contains(Features::RANGE_INV));
        assert_eq!(caps.asid_bits, 16);
        assert_eq!(caps.oas, 48);
        assert_eq!(caps.ias, 48);
        assert_eq!(caps.pgsize_bitmap, page::SIZE_4K | page::SIZE_2M | page::SIZE_1G);
        assert_eq!(caps.implementation.name(), "generic");
    }

    #[test]
    fn test_probe_caps_identifier_widths() {
        let caps = probe(SimConfig {
            sid_bits: 32,
            ssid_bits: 20,
            ..SimConfig::default()
        })
        .unwrap();
        assert_eq!(caps.sid_bits, SmmuConfig::default().max_sid_bits);
        assert_eq!(caps.ssid_bits, SmmuConfig::default().max_ssid_bits);
    }

    #[test]
    fn test_probe_rejects_missing_stages() {
        let err = probe(SimConfig {
            stage1: false,
            stage2: false,
            ..SimConfig::default()
        });
        assert_eq!(err.unwrap_err(), SmmuError::Configuration);
    }

    #[test]
    fn test_implementation_selection() {
        let mmu700 = (IIDR_PRODUCT_MMU_700 << 20) | IIDR_IMPLEMENTER_ARM;
        assert_eq!(select_implementation(mmu700).name(), "arm,mmu-700");
        assert_eq!(
            select_implementation(mmu700).quirks(),
            Quirks::CMDQ_FORCE_SYNC
        );
        let hip08 = (IIDR_PRODUCT_HIP08 << 20) | IIDR_IMPLEMENTER_HISILICON;
        assert!(select_implementation(hip08).quirks().contains(Quirks::SKIP_PREFETCH));
        assert_eq!(select_implementation(hip08).reserved_regions().len(), 2);
        assert_eq!(select_implementation(0).name(), "generic");
    }

    #[test]
    fn test_mmu700_drops_btm() {
        let caps = probe(SimConfig {
            iidr: (IIDR_PRODUCT_MMU_700 << 20) | IIDR_IMPLEMENTER_ARM,
            btm: true,
            ..SimConfig::default()
        })
        .unwrap();
        assert!(!caps.features.contains(Features::BTM));
        assert!(caps.quirks.contains(Quirks::CMDQ_FORCE_SYNC));
    }
}
