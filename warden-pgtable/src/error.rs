//! Page table errors

/// Errors that can occur during page table operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "page table errors must be handled"]
pub enum PgtableError {
    /// Address sizes or page sizes this format cannot express
    InvalidConfig,
    /// Page size not in the table's page-size bitmap
    UnsupportedPageSize(u64),
    /// IOVA or physical address not aligned to the page size
    NotAligned,
    /// IOVA or physical address beyond the configured address size
    OutOfRange,
    /// The IOVA is already mapped
    AlreadyMapped,
    /// Failed to allocate a table
    AllocationFailed,
}

impl core::fmt::Display for PgtableError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::InvalidConfig => write!(f, "unsupported page table configuration"),
            Self::UnsupportedPageSize(size) => write!(f, "unsupported page size {size:#x}"),
            Self::NotAligned => write!(f, "address not aligned to page size"),
            Self::OutOfRange => write!(f, "address beyond the configured address size"),
            Self::AlreadyMapped => write!(f, "IOVA is already mapped"),
            Self::AllocationFailed => write!(f, "failed to allocate page table"),
        }
    }
}
