//! SMMUv3 Driver
//!
//! Driver for Arm SMMUv3-class IOMMUs: capability probe, command and event
//! queues, stream and context descriptor tables, and translation domains
//! built on [`warden_pgtable`].
//!
//! # Architecture
//!
//! - [`regs`]: register offsets and `tock-registers` bitfields
//! - [`caps`]: ID register decoding and per-family behaviour
//!   ([`SmmuImplementation`])
//! - [`cmd`], [`range`], [`cmdq`]: the command set, range invalidation
//!   decomposition and the command queue with batching and error recovery
//! - [`entry`], [`ste`], [`strtab`], [`cd`]: hardware-cached table entries
//!   and the torn-write-free writer that updates them
//! - [`evtq`]: event queue and fault decoding
//! - [`device`]: one controller, its reset sequence and stream attachment
//! - [`domain`]: page table plus ASID/VMID shared by attached streams
//! - [`registry`]: [`SmmuRegistry`], the entry point owning all of the above
//! - `sim` (feature `sim`): software model of a controller
//!
//! # Example
//!
//! ```ignore
//! use warden_smmu::{DeviceDescriptor, DomainKind, SmmuConfig, SmmuRegistry};
//!
//! let registry = SmmuRegistry::init(SmmuConfig::default(), frames);
//! let smmu = registry.probe_device(mmio, DeviceDescriptor { base, size, ..Default::default() })?;
//! let dom = registry.domain_alloc(DomainKind::Stage1);
//! registry.attach(dom, smmu, sid, None)?;
//! registry.map(dom, iova, paddr, 0x1000, IommuProt::RW_CACHED)?;
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

pub mod caps;
pub mod cd;
pub mod cmd;
pub mod cmdq;
pub mod config;
pub mod device;
pub mod domain;
pub mod entry;
pub mod error;
pub mod evtq;
pub mod frames;
pub mod ids;
pub mod range;
pub mod regs;
pub mod registry;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod ste;
pub mod strtab;

pub use caps::{Caps, Features, Quirks, ReservedKind, ReservedRegion, SmmuImplementation};
pub use cd::{Cd, CdTable};
pub use cmd::{CmdEntry, Command, SyncCompletion, TlbiRange};
pub use cmdq::{Cmdq, CommandBatch};
pub use config::{BATCH_ENTRIES, DeviceDescriptor, SmmuConfig};
pub use device::{DeviceParts, SmmuDevice};
pub use domain::{Domain, DomainKind};
pub use entry::{EntryWriter, WriteMode};
pub use error::SmmuError;
pub use evtq::{EventKind, Evtq, FaultHandler, FaultRecord};
pub use ids::IdAllocator;
pub use range::{InvChunk, InvRange};
pub use registry::{DeviceId, DomainId, SmmuRegistry};
pub use ste::{Ste, SteMode};
pub use strtab::{StreamTable, StrtabLayout};
