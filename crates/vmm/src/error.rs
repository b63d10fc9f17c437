use core::fmt;

use crate::frame_allocator::AllocError;

/// Errors returned by address-space, fork, heap and protection operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// A frame or page-table allocation failed.
    OutOfMemory,
    /// The operation targets a virtual page with no mapping.
    Unmapped,
    /// The virtual page is already mapped.
    AlreadyMapped,
    /// An address that must be page-aligned is not.
    Misaligned,
    /// The byte range overflows or leaves the user address space.
    InvalidRange,
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Unmapped => write!(f, "virtual page is not mapped"),
            Self::AlreadyMapped => write!(f, "virtual page is already mapped"),
            Self::Misaligned => write!(f, "address is not page-aligned"),
            Self::InvalidRange => write!(f, "address range is invalid"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<AllocError> for VmError {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory => Self::OutOfMemory,
        }
    }
}
