//! Address Types
//!
//! SMMU structures are linked by the addresses the controller fetches from
//! (bus addresses, [`PhysAddr`]), while software edits them through the CPU
//! direct map ([`VirtAddr`]). Keeping the two apart catches the classic bug of
//! programming a base register with a kernel pointer.

use core::fmt;

use spin::Once;

use crate::memory::page;

/// Direct map offset, added to a bus address to reach it from the CPU.
static DIRECT_MAP: Once<u64> = Once::new();

/// Install the direct map offset. The first call wins.
pub fn set_phys_to_virt_offset(offset: u64) {
    DIRECT_MAP.call_once(|| offset);
}

/// CPU address of `phys` through the direct map (identity until configured).
#[inline]
#[must_use]
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    let offset = DIRECT_MAP.get().copied().unwrap_or(0);
    VirtAddr(phys.0.wrapping_add(offset))
}

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(pub u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(addr: u64) -> Self {
                Self(addr)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// `self + offset`, wrapping.
            #[inline]
            #[must_use]
            pub const fn offset(self, offset: u64) -> Self {
                Self(self.0.wrapping_add(offset))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, " {:#x}"), self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

address_type!(
    /// Bus address: what the SMMU fetches from and what DMA masters target.
    PhysAddr,
    "pa"
);

address_type!(
    /// CPU address of a structure, normally through the direct map.
    VirtAddr,
    "va"
);

impl PhysAddr {
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// 4KB frame number.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> u64 {
        self.0 >> page::SHIFT_4K
    }

    #[inline]
    #[must_use]
    pub const fn from_pfn(pfn: u64) -> Self {
        Self(pfn << page::SHIFT_4K)
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.0 & page::MASK_4K == 0
    }

    /// `align` must be a power of two.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub fn to_virt(self) -> VirtAddr {
        phys_to_virt(self)
    }
}

impl VirtAddr {
    #[inline]
    #[must_use]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    #[must_use]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}
