//! Memory Barrier Helpers
//!
//! Ordering primitives for structures shared with the SMMU: queue entries,
//! stream table entries, context descriptors and I/O page tables.
//!
//! # ARM64 Memory Model
//!
//! ARM64 has a weakly-ordered memory model. The barriers provided here map to:
//! - `read_barrier()`: Acquire semantics (loads before this complete first)
//! - `write_barrier()`: Release semantics (stores before this complete first)
//! - `dsb()`: Data Synchronisation Barrier (all memory ops complete)
//! - `dsb_ishst()`: stores complete within the inner-shareable domain
//! - `wfe()`: wait for event, used while polling a queue the device drains
//!
//! On other architectures (host-side tests with a software device model) the
//! architectural barriers degrade to sequentially consistent fences.
//!
//! # Usage Patterns
//!
//! ## Command Queue (Driver writes, Device reads)
//!
//! ```ignore
//! // Write commands to the reserved slots
//! queue.write_entry(prod, &cmd);
//! write_barrier();             // Entries visible before the index update
//! regs.write32(CMDQ_PROD, new_prod);
//! ```
//!
//! ## Event Queue (Device writes, Driver reads)
//!
//! ```ignore
//! let prod = regs.read32(EVTQ_PROD);
//! read_barrier();              // Entry reads happen after the index read
//! let event = queue.read_entry(cons);
//! ```

use core::sync::atomic::{Ordering, fence};

/// Read barrier (acquire semantics).
///
/// Use before reading shared memory that may have been written by a device.
#[inline]
pub fn read_barrier() {
    fence(Ordering::Acquire);
}

/// Write barrier (release semantics).
///
/// Use before writing a producer index to publish new entries to a device.
#[inline]
pub fn write_barrier() {
    fence(Ordering::Release);
}

/// Full memory barrier.
#[inline]
pub fn full_barrier() {
    fence(Ordering::SeqCst);
}

/// Data Synchronisation Barrier (DSB SY).
///
/// Ensures all memory accesses (including device memory) complete before
/// continuing.
#[inline]
pub fn dsb() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB is always safe to execute
    unsafe {
        core::arch::asm!("dsb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::SeqCst);
}

/// Inner-shareable store barrier (DSB ISHST).
///
/// Makes table updates visible to a table walker before the walker is told
/// about them.
#[inline]
pub fn dsb_ishst() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: DSB ISHST is always safe to execute
    unsafe {
        core::arch::asm!("dsb ishst", options(nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    fence(Ordering::Release);
}

/// Wait For Event.
///
/// Sleeps until an event is signalled (for example by the SMMU completing a
/// `CMD_SYNC` with SEV completion) or a spurious wakeup occurs.
#[inline]
pub fn wfe() {
    #[cfg(target_arch = "aarch64")]
    // SAFETY: WFE has no side effects beyond suspending the core
    unsafe {
        core::arch::asm!("wfe", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(target_arch = "aarch64"))]
    core::hint::spin_loop();
}
