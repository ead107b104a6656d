//! ARM SMMUv3 register definitions
//!
//! Based on ARM System Memory Management Unit Architecture Specification
//! SMMU v3.0 to v3.3 (ARM IHI 0070). Offsets are relative to page 0 of the
//! register file; the event queue indices live in page 1 at +64KB.

use tock_registers::register_bitfields;

// -- Register Offsets

/// Identification Register 0
pub const SMMU_IDR0: usize = 0x000;
/// Identification Register 1
pub const SMMU_IDR1: usize = 0x004;
/// Identification Register 3
pub const SMMU_IDR3: usize = 0x00C;
/// Identification Register 5
pub const SMMU_IDR5: usize = 0x014;
/// Implementation Identification Register
pub const SMMU_IIDR: usize = 0x018;
/// Control Register 0
pub const SMMU_CR0: usize = 0x020;
/// Control Register 0 Acknowledgement
pub const SMMU_CR0ACK: usize = 0x024;
/// Control Register 1 (table and queue memory attributes)
pub const SMMU_CR1: usize = 0x028;
/// Control Register 2
pub const SMMU_CR2: usize = 0x02C;
/// Global Bypass Attribute
pub const SMMU_GBPA: usize = 0x044;
/// Interrupt enables
pub const SMMU_IRQ_CTRL: usize = 0x050;
/// Interrupt enables acknowledgement
pub const SMMU_IRQ_CTRLACK: usize = 0x054;
/// Global Error status
pub const SMMU_GERROR: usize = 0x060;
/// Global Error acknowledgement
pub const SMMU_GERRORN: usize = 0x064;
/// Stream Table Base
pub const SMMU_STRTAB_BASE: usize = 0x080;
/// Stream Table Base Configuration
pub const SMMU_STRTAB_BASE_CFG: usize = 0x088;
/// Command Queue Base
pub const SMMU_CMDQ_BASE: usize = 0x090;
/// Command Queue Producer Index
pub const SMMU_CMDQ_PROD: usize = 0x098;
/// Command Queue Consumer Index
pub const SMMU_CMDQ_CONS: usize = 0x09C;
/// Event Queue Base
pub const SMMU_EVTQ_BASE: usize = 0x0A0;
/// Offset of register page 1
pub const SMMU_PAGE1: usize = 0x10000;
/// Event Queue Producer Index (page 1)
pub const SMMU_EVTQ_PROD: usize = SMMU_PAGE1 + 0x0A8;
/// Event Queue Consumer Index (page 1)
pub const SMMU_EVTQ_CONS: usize = SMMU_PAGE1 + 0x0AC;

/// Size of the register file (two 64KB pages)
pub const SMMU_MMIO_SIZE: usize = 2 * SMMU_PAGE1;

// -- Identification registers

register_bitfields![u32,
    /// Identification Register 0
    pub IDR0 [
        /// Stage 2 translation supported
        S2P OFFSET(0) NUMBITS(1) [],
        /// Stage 1 translation supported
        S1P OFFSET(1) NUMBITS(1) [],
        /// Translation table formats
        TTF OFFSET(2) NUMBITS(2) [
            AArch32 = 0b01,
            AArch64 = 0b10,
            Both = 0b11
        ],
        /// Coherent access to tables and queues
        COHACC OFFSET(4) NUMBITS(1) [],
        /// Broadcast TLB maintenance
        BTM OFFSET(5) NUMBITS(1) [],
        /// EL2 translation supported
        HYP OFFSET(9) NUMBITS(1) [],
        /// PCIe ATS supported
        ATS OFFSET(10) NUMBITS(1) [],
        /// 16-bit ASIDs
        ASID16 OFFSET(12) NUMBITS(1) [],
        /// MSI interrupts
        MSI OFFSET(13) NUMBITS(1) [],
        /// WFE wake-up on CMD_SYNC completion
        SEV OFFSET(14) NUMBITS(1) [],
        /// PRI supported
        PRI OFFSET(16) NUMBITS(1) [],
        /// 16-bit VMIDs
        VMID16 OFFSET(18) NUMBITS(1) [],
        /// Two-level context descriptor tables
        CD2L OFFSET(19) NUMBITS(1) [],
        /// Table endianness
        TTENDIAN OFFSET(21) NUMBITS(2) [
            Mixed = 0b00,
            Little = 0b10,
            Big = 0b11
        ],
        /// Stall model
        STALL_MODEL OFFSET(24) NUMBITS(2) [
            Stall = 0b00,
            Terminate = 0b01,
            Force = 0b10
        ],
        /// Stream table levels
        ST_LEVEL OFFSET(27) NUMBITS(2) [
            Linear = 0b00,
            TwoLevel = 0b01
        ]
    ],

    /// Identification Register 1
    pub IDR1 [
        /// Stream ID width
        SIDSIZE OFFSET(0) NUMBITS(6) [],
        /// Substream ID width
        SSIDSIZE OFFSET(6) NUMBITS(5) [],
        /// log2 of the maximum event queue size
        EVTQS OFFSET(16) NUMBITS(5) [],
        /// log2 of the maximum command queue size
        CMDQS OFFSET(21) NUMBITS(5) [],
        /// Queue base registers are fixed by the implementation
        QUEUES_PRESET OFFSET(29) NUMBITS(1) [],
        /// Table base registers are fixed by the implementation
        TABLES_PRESET OFFSET(30) NUMBITS(1) []
    ],

    /// Identification Register 3
    pub IDR3 [
        /// Range-based TLB invalidation
        RIL OFFSET(10) NUMBITS(1) []
    ],

    /// Identification Register 5
    pub IDR5 [
        /// Output address size
        OAS OFFSET(0) NUMBITS(3) [
            Bits32 = 0,
            Bits36 = 1,
            Bits40 = 2,
            Bits42 = 3,
            Bits44 = 4,
            Bits48 = 5,
            Bits52 = 6
        ],
        /// 4KB granule supported
        GRAN4K OFFSET(4) NUMBITS(1) [],
        /// 16KB granule supported
        GRAN16K OFFSET(5) NUMBITS(1) [],
        /// 64KB granule supported
        GRAN64K OFFSET(6) NUMBITS(1) [],
        /// Virtual address extension
        VAX OFFSET(10) NUMBITS(2) []
    ],

    /// Implementation Identification Register
    pub IIDR [
        IMPLEMENTER OFFSET(0) NUMBITS(12) [],
        REVISION OFFSET(12) NUMBITS(4) [],
        VARIANT OFFSET(16) NUMBITS(4) [],
        PRODUCT_ID OFFSET(20) NUMBITS(12) []
    ]
];

// -- Control registers

register_bitfields![u32,
    /// Control Register 0 (and CR0ACK)
    pub CR0 [
        SMMUEN OFFSET(0) NUMBITS(1) [],
        PRIQEN OFFSET(1) NUMBITS(1) [],
        EVTQEN OFFSET(2) NUMBITS(1) [],
        CMDQEN OFFSET(3) NUMBITS(1) [],
        ATSCHK OFFSET(4) NUMBITS(1) []
    ],

    /// Control Register 1
    pub CR1 [
        QUEUE_IC OFFSET(0) NUMBITS(2) [],
        QUEUE_OC OFFSET(2) NUMBITS(2) [],
        QUEUE_SH OFFSET(4) NUMBITS(2) [],
        TABLE_IC OFFSET(6) NUMBITS(2) [],
        TABLE_OC OFFSET(8) NUMBITS(2) [],
        TABLE_SH OFFSET(10) NUMBITS(2) []
    ],

    /// Control Register 2
    pub CR2 [
        E2H OFFSET(0) NUMBITS(1) [],
        RECINVSID OFFSET(1) NUMBITS(1) [],
        PTM OFFSET(2) NUMBITS(1) []
    ],

    /// Global Bypass Attribute
    pub GBPA [
        ABORT OFFSET(20) NUMBITS(1) [],
        UPDATE OFFSET(31) NUMBITS(1) []
    ],

    /// Interrupt enables (and IRQ_CTRLACK)
    pub IRQ_CTRL [
        GERROR_IRQEN OFFSET(0) NUMBITS(1) [],
        PRIQ_IRQEN OFFSET(1) NUMBITS(1) [],
        EVTQ_IRQEN OFFSET(2) NUMBITS(1) []
    ],

    /// Global Error (and GERRORN)
    pub GERROR [
        CMDQ_ERR OFFSET(0) NUMBITS(1) [],
        EVTQ_ABT_ERR OFFSET(2) NUMBITS(1) [],
        PRIQ_ABT_ERR OFFSET(3) NUMBITS(1) [],
        MSI_CMDQ_ABT_ERR OFFSET(4) NUMBITS(1) [],
        MSI_EVTQ_ABT_ERR OFFSET(5) NUMBITS(1) [],
        MSI_PRIQ_ABT_ERR OFFSET(6) NUMBITS(1) [],
        MSI_GERROR_ABT_ERR OFFSET(7) NUMBITS(1) [],
        SFM_ERR OFFSET(8) NUMBITS(1) []
    ],

    /// Stream Table Base Configuration
    pub STRTAB_BASE_CFG [
        LOG2SIZE OFFSET(0) NUMBITS(6) [],
        SPLIT OFFSET(6) NUMBITS(5) [],
        FMT OFFSET(16) NUMBITS(2) [
            Linear = 0b00,
            TwoLevel = 0b01
        ]
    ],

    /// Command queue consumer index
    pub CMDQ_CONS [
        /// Error code of the command at the consumer index
        ERR OFFSET(24) NUMBITS(7) [
            NoError = 0,
            Illegal = 1,
            Abort = 2,
            AtcInvSync = 3
        ]
    ]
];

register_bitfields![u64,
    /// Stream table base
    pub STRTAB_BASE [
        ADDR OFFSET(6) NUMBITS(46) [],
        RA OFFSET(62) NUMBITS(1) []
    ],

    /// Command and event queue base
    pub Q_BASE [
        LOG2SIZE OFFSET(0) NUMBITS(5) [],
        ADDR OFFSET(5) NUMBITS(47) [],
        RWA OFFSET(62) NUMBITS(1) []
    ]
];

// -- Memory attribute encodings used in CR1 and table descriptors

/// Non-cacheable
pub const CACHE_NC: u32 = 0b00;
/// Write-back, read/write-allocate
pub const CACHE_WB: u32 = 0b01;
/// Inner shareable
pub const SH_ISH: u32 = 0b11;
/// Non-shareable
pub const SH_NSH: u32 = 0b00;

/// Address bits of a queue or table base register
pub const BASE_ADDR_MASK: u64 = ((1 << 52) - 1) & !0x3F;

/// Decode an address-size field (IDR5.OAS encoding) into bits.
#[must_use]
pub const fn oas_bits(encoding: u32) -> Option<u32> {
    match encoding {
        0 => Some(32),
        1 => Some(36),
        2 => Some(40),
        3 => Some(42),
        4 => Some(44),
        5 => Some(48),
        6 => Some(52),
        _ => None,
    }
}
