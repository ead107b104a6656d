//! # warden-common
//!
//! Shared types for the Warden IOMMU crates:
//! - [`PhysAddr`] / [`VirtAddr`]: address newtypes used in every table format
//! - [`memory::page`]: page and block size constants
//! - [`FrameAllocator`]: source of zeroed, naturally aligned page frames for
//!   queues, stream tables, context tables and I/O page tables
//! - [`HeapFrameAllocator`] (feature `heap`): frames carved from the global
//!   heap, for hosted tests
//!
//! # Physical-to-Virtual Mapping
//!
//! Table memory is written by software through a direct map. By default the
//! direct map is the identity (physical == virtual), which is what the
//! hypervisor mirror and the software SMMU model use. A kernel with a linear
//! map at an offset calls [`set_phys_to_virt_offset`] once during init.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "heap")]
extern crate alloc;

pub mod addr;
pub mod memory;

pub use addr::{PhysAddr, VirtAddr, phys_to_virt, set_phys_to_virt_offset};
pub use memory::FrameAllocator;
#[cfg(feature = "heap")]
pub use memory::HeapFrameAllocator;
