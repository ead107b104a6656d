//! Hypervisor SMMU Mirror
//!
//! Takes SMMUs away from an untrusted host driver. The hypervisor owns the
//! command queue, stream table and page tables; the host asks for
//! attachments and mappings through [`Gate`] and keeps read access to the
//! event queue.
//!
//! # Architecture
//!
//! - [`ownership`]: per-page owner (host, hypervisor, shared) and DMA pins
//! - [`pool`]: frame allocator over donated pages
//! - [`smmu`]: one captured controller and its state machine
//! - [`domain`]: translation domains that only map host pages
//! - [`idmap`]: identity domains kept in step with ownership
//! - [`gate`]: host call entry point and errno mapping

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod domain;
pub mod gate;
pub mod idmap;
pub mod ownership;
pub mod pool;
pub mod smmu;

pub use domain::HypDomain;
pub use gate::{Gate, HypCall, to_errno};
pub use idmap::HostIdmap;
pub use ownership::{Donation, OwnershipMap, PageState};
pub use pool::DonatedPool;
pub use smmu::{HypSmmu, HypState, MmioAccess};
