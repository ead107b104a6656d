//! I/O Page Tables
//!
//! LPAE-format translation tables walked by an SMMU, for stage 1 (VA→PA,
//! tagged by ASID) and stage 2 (IPA→PA, tagged by VMID), 4KB granule with
//! 2MB and 1GB block mappings.
//!
//! # Architecture
//!
//! - `config`: format selection, address sizes and the register values
//!   (TCR/MAIR or VTCR, translation table base) a controller programs
//! - `prot`: [`IommuProt`] access flags requested by callers
//! - `descriptors`: descriptor encoding with `tock-registers` bitfields
//! - `gather`: [`IotlbGather`] and the [`FlushOps`] callbacks the controller
//!   supplies to invalidate its TLBs
//! - `table`: [`IoPageTable`] with map, unmap, lookup, walk and teardown
//!
//! Table frames come from a [`FrameAllocator`](warden_common::FrameAllocator)
//! and are accessed through the direct map
//! ([`phys_to_virt`](warden_common::phys_to_virt)).
//!
//! # Invalidation Contract
//!
//! Unmapping never invalidates leaf entries itself. Cleared leaves are
//! reported through [`FlushOps::add_page`] into an [`IotlbGather`]; the caller
//! issues one invalidation for the gathered range and only then releases the
//! tables the unmap freed ([`IoPageTable::release_freelist`]). Removal of
//! intermediate tables is invalidated immediately via
//! [`FlushOps::flush_walk`].

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod config;
pub mod descriptors;
pub mod error;
pub mod gather;
pub mod prot;
pub mod table;

pub use config::{IoPgtableCfg, IoPgtableFormat, Stage1Regs, Stage2Regs, Tcr, Vtcr};
pub use error::PgtableError;
pub use gather::{FlushOps, IotlbGather};
pub use prot::IommuProt;
pub use table::{IoPageTable, Lookup};

/// Number of entries per table (4KB granule)
pub const ENTRIES_PER_TABLE: usize = 512;

/// Page sizes this format can map: 4KB pages, 2MB and 1GB blocks
pub const SUPPORTED_PGSIZES: u64 = warden_common::memory::page::SIZE_4K
    | warden_common::memory::page::SIZE_2M
    | warden_common::memory::page::SIZE_1G;

const _: () = assert!(
    ENTRIES_PER_TABLE * 8 == warden_common::memory::page::SIZE_4K as usize,
    "one table fills one 4KB frame"
);
