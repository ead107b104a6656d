//! Driver configuration and firmware inputs

use warden_mmio::PollConfig;

use crate::caps::Quirks;

/// Commands accumulated before a batch is flushed to the queue
pub const BATCH_ENTRIES: usize = 64;

/// Stream table split for two-level tables (256 STEs per leaf)
pub const STRTAB_SPLIT: u32 = 8;

/// Largest linear context descriptor table (64KB, 1024 substreams)
pub const MAX_CD_TABLE_SSID_BITS: u32 = 10;

/// Tunables for one controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmmuConfig {
    /// Requested log2 command queue size, clamped to the hardware maximum
    pub cmdq_log2size: u32,
    /// Requested log2 event queue size, clamped to the hardware maximum
    pub evtq_log2size: u32,
    /// Stream ID widths up to this use a linear stream table
    pub linear_strtab_max_bits: u32,
    /// Cap on the stream ID width
    pub max_sid_bits: u32,
    /// Cap on the substream ID width
    pub max_ssid_bits: u32,
    /// Events handled per call to the event handler
    pub evtq_budget: usize,
    /// Budget for queue and register waits
    pub poll: PollConfig,
    /// Allow PCIe ATS
    pub enable_ats: bool,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            cmdq_log2size: 8,
            evtq_log2size: 7,
            linear_strtab_max_bits: 8,
            max_sid_bits: 16,
            max_ssid_bits: MAX_CD_TABLE_SSID_BITS,
            evtq_budget: 64,
            poll: PollConfig::default(),
            enable_ats: false,
        }
    }
}

/// What firmware (ACPI IORT or device tree) says about one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    /// Physical base of the register file
    pub base: u64,
    /// Size of the register file
    pub size: u64,
    /// Table walks and queue accesses snoop CPU caches
    pub coherent: bool,
    /// Replace the implementation's quirks
    pub quirks: Option<Quirks>,
}
