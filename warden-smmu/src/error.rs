//! Error types for the SMMU driver

use core::fmt;

use warden_mmio::{PollTimeout, QueueError};
use warden_pgtable::PgtableError;

/// Errors reported by the SMMU driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmmuError {
    /// A queue did not drain or a register did not acknowledge in time
    Timeout,
    /// Unsupported feature combination, bad identifier width or a queue too
    /// small for one command batch
    Configuration,
    /// Table or queue allocation failed
    OutOfMemory,
    /// The mirror was asked to touch a page it does not own
    OwnershipViolation,
    /// The controller rejected a command (error code from CMDQ_CONS.ERR) or
    /// reported a fatal global error
    HardwareFault(u8),
    /// The stream, substream or domain is in use
    Busy,
    /// Stream ID beyond the stream table
    InvalidStreamId,
    /// Malformed request (alignment, size, substream range)
    InvalidArgument,
    /// No such device, domain or attachment
    NotFound,
}

impl SmmuError {
    /// Check whether retrying the operation later may succeed.
    ///
    /// Callers retrying after a [`Timeout`](Self::Timeout) must check the
    /// controller's error state first: the command may still complete.
    #[inline]
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Timeout | Self::Busy | Self::OutOfMemory)
    }
}

impl fmt::Display for SmmuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for the SMMU"),
            Self::Configuration => write!(f, "unsupported SMMU configuration"),
            Self::OutOfMemory => write!(f, "out of memory for SMMU structures"),
            Self::OwnershipViolation => write!(f, "page not owned by the hypervisor"),
            Self::HardwareFault(code) => write!(f, "SMMU hardware fault (code {code:#x})"),
            Self::Busy => write!(f, "resource busy"),
            Self::InvalidStreamId => write!(f, "stream ID out of range"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
        }
    }
}

impl From<QueueError> for SmmuError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Timeout => Self::Timeout,
            QueueError::TooLarge { .. } | QueueError::Capacity { .. } => Self::Configuration,
        }
    }
}

impl From<PollTimeout> for SmmuError {
    fn from(_: PollTimeout) -> Self {
        Self::Timeout
    }
}

impl From<PgtableError> for SmmuError {
    fn from(err: PgtableError) -> Self {
        match err {
            PgtableError::AllocationFailed => Self::OutOfMemory,
            PgtableError::AlreadyMapped => Self::Busy,
            PgtableError::InvalidConfig => Self::Configuration,
            PgtableError::UnsupportedPageSize(_)
            | PgtableError::NotAligned
            | PgtableError::OutOfRange => Self::InvalidArgument,
        }
    }
}
