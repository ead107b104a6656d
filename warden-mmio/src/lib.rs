//! MMIO Abstraction Layer for Warden IOMMU Drivers
//!
//! Reusable building blocks shared by the SMMU driver and its hypervisor
//! mirror.
//!
//! # Modules
//!
//! - [`region`]: the [`RegisterIo`] seam and [`MmioRegion`], its volatile
//!   implementation over mapped device memory
//! - [`poll`]: bounded spin/backoff/timeout polling ([`PollConfig`])
//! - [`barrier`]: memory barrier helpers for device memory ordering
//! - [`queue`]: wrap-bit circular queue engine shared by the command and
//!   event queues
//!
//! # Example
//!
//! ```ignore
//! use warden_mmio::{MmioRegion, RegisterIo, barrier};
//!
//! let mmio = unsafe { MmioRegion::new(0x0900_0000, 0x2_0000) };
//! let idr0 = mmio.read32(0x00);
//! mmio.write32(0x20, 0);
//! barrier::write_barrier();
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod barrier;
pub mod poll;
pub mod queue;
pub mod region;

pub use barrier::{dsb, read_barrier, write_barrier};
pub use poll::{Backoff, PollConfig, PollTimeout, poll_until};
pub use queue::{Queue, QueueEntry, QueueError, clamp_log2size};
pub use region::{MmioRegion, RegisterIo};
