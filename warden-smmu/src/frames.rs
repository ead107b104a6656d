//! Owned runs of table frames

use alloc::sync::Arc;

use warden_common::memory::page;
use warden_common::{FrameAllocator, PhysAddr};

use crate::error::SmmuError;

/// Zeroed, naturally aligned frames returned to their allocator on drop.
///
/// Owners must make the memory unreachable by the controller (disable the
/// queue or invalidate the table) before dropping it.
pub struct Frames {
    pa: PhysAddr,
    order: u32,
    alloc: Arc<dyn FrameAllocator>,
}

impl Frames {
    /// Allocate enough frames for `bytes`.
    pub fn alloc(alloc: &Arc<dyn FrameAllocator>, bytes: u64) -> Result<Self, SmmuError> {
        let order = page::order_for(bytes);
        let pa = alloc.alloc_zeroed(order).ok_or(SmmuError::OutOfMemory)?;
        Ok(Self {
            pa,
            order,
            alloc: Arc::clone(alloc),
        })
    }

    #[inline]
    #[must_use]
    pub const fn pa(&self) -> PhysAddr {
        self.pa
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        page::SIZE_4K << self.order
    }

    /// CPU pointer to the start of the run.
    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.pa.to_virt().as_mut_ptr()
    }
}

impl Drop for Frames {
    fn drop(&mut self) {
        // SAFETY: pa came from alloc_zeroed(order) on this allocator and the
        // owner has detached it from the hardware
        unsafe { self.alloc.free(self.pa, self.order) }
    }
}

impl core::fmt::Debug for Frames {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Frames")
            .field("pa", &self.pa)
            .field("order", &self.order)
            .finish()
    }
}
