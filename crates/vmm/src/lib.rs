#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager is the page-table and physical-frame layer of the
//! Polaris kernel's user memory. It provides:
//!
//! - A single-frame physical allocator with per-frame reference counts.
//! - Per-process address spaces over frame-backed hierarchical page tables.
//! - Copy-on-write fork, with fault-driven privatization of shared pages.
//! - Page-granular protection changes (`mprotect`) and the user-facing system calls.
//! - Software emulation of paging, physical memory and user accesses for testing in
//!   non-kernel environments.

extern crate alloc;

/// Logs per-page detail when the `detailed-logging` feature is enabled.
macro_rules! trace_page {
    ($($arg:tt)*) => {
        if cfg!(feature = "detailed-logging") {
            log::trace!($($arg)*);
        }
    };
}
pub(crate) use trace_page;

mod address;
mod address_space;
mod arch;
mod error;
mod fault;
mod fork;
mod frame;
mod frame_allocator;
mod memory_manager;
#[cfg(any(test, feature = "software-emulation"))]
mod mmu;
mod numbers;
mod page_directory;
mod protection;
mod ref_table;
#[cfg(test)]
mod scenarios;
pub mod syscall;
mod tlb;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::AddressSpace;
pub use error::VmError;
pub use fault::{
    AccessKind, FaultCause, FaultClass, FaultResolution, SegmentationFault, classify,
    handle_page_fault,
};
pub use fork::fork_address_space;
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use frame_allocator::{AllocError, FrameAllocator};
pub use memory_manager::{MemoryConfig, MemoryManager};
pub use numbers::{FrameNumber, PageNumber, PageRange};
pub use page_directory::PageDirectory;
pub use protection::{Protection, set_protection};
pub use ref_table::{FrameKind, FrameRefTable};
#[cfg(any(test, feature = "software-emulation"))]
pub use tlb::RecordingTlb;
pub use tlb::TlbInvalidator;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::EmulatedMemory;
pub use arch::{HardwareTlb, PAGE_SIZE, PageEntry, PageFlags};
