//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated architecture that can run on any host.
//! It's designed for testing and development without requiring actual hardware access.
//!
//! The software-emulated architecture follows the RISC-V Sv39 layout:
//! - 39-bit virtual addresses (sign-extended from bit 38)
//! - 3 levels of page tables with 9-bit indexes (512 entries per table)
//! - 12-bit page offset (4 KiB pages)
//! - Separate readable, writable and executable permission bits
//!
//! This provides realistic paging behavior, including read-less executable pages, while
//! keeping the emulated physical memory small.

mod entry;
mod flags;
mod table;

pub use entry::PageEntry;
pub use flags::PageFlags;
pub use table::PageTable;

use crate::{VirtualAddress, tlb::TlbInvalidator};

#[cfg(any(test, feature = "software-emulation"))]
use crate::PhysicalAddress;
#[cfg(any(test, feature = "software-emulation"))]
use core::{alloc::Layout, ptr::NonNull};

/// Maximum number of bits in a physical address for software emulation.
pub const MAX_PHYSICAL_BITS: usize = 56;

/// Maximum number of bits in a virtual address for software emulation.
pub const MAX_VIRTUAL_BITS: usize = 39;

/// Page size in bytes (4 KiB = 2^12).
pub const PAGE_SIZE: usize = 4096;

/// Number of page table levels (3 levels: level 2, 1, 0).
pub const PAGE_TABLE_LEVELS: usize = 3;

/// Returns the page table index for a given virtual address at the specified level.
///
/// For software emulation:
/// - Level 0: Bits 12-20 (leaf table)
/// - Level 1: Bits 21-29 (middle directory)
/// - Level 2: Bits 30-38 (root)
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(
        level < PAGE_TABLE_LEVELS,
        "level out of range for software emulation (0-2)"
    );
    let shift = 12 + (level * 9);
    (address >> shift) & 0x1FF
}

/// Validates a physical address for software emulation.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1 << MAX_PHYSICAL_BITS)
}

/// Validates a virtual address for software emulation.
///
/// Virtual addresses must be canonical (bits 39-63 must be sign-extended from bit 38).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

/// Canonicalizes a virtual address for software emulation.
///
/// This sign-extends bit 38 to bits 39-63.
#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    const LOW_MASK: usize = (1 << MAX_VIRTUAL_BITS) - 1;
    if (addr & (1 << (MAX_VIRTUAL_BITS - 1))) != 0 {
        addr | !LOW_MASK
    } else {
        addr & LOW_MASK
    }
}

/// Translation-cache control for the software architecture.
///
/// Software paging re-walks the tables on every access, so there is nothing to invalidate.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareTlb;

impl TlbInvalidator for HardwareTlb {
    fn invalidate(&self, _page: VirtualAddress) {}
}

/// Emulated physical memory for software simulation.
///
/// This provides a simulated physical memory space, starting at an arbitrary physical base
/// address, so page tables and frame contents can live in "RAM" without hardware support.
/// The buffer is page-aligned so page tables can be placed in it directly.
#[cfg(any(test, feature = "software-emulation"))]
pub struct EmulatedMemory {
    /// Physical address of the first byte of the buffer.
    base: PhysicalAddress,
    /// The underlying memory buffer.
    memory: NonNull<u8>,
    layout: Layout,
}

// SAFETY: The buffer is only reached through raw pointers handed out by `translate`;
// synchronizing access to the memory behind them is the caller's responsibility, exactly as
// it is for real physical memory.
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Send for EmulatedMemory {}
#[cfg(any(test, feature = "software-emulation"))]
unsafe impl Sync for EmulatedMemory {}

#[cfg(any(test, feature = "software-emulation"))]
impl EmulatedMemory {
    /// Creates a zero-filled emulated memory region of `size` bytes starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned or `size` is not a non-zero multiple of the
    /// page size.
    pub fn new(base: PhysicalAddress, size: usize) -> Self {
        assert!(
            base.is_aligned(PAGE_SIZE),
            "emulated memory base must be page-aligned"
        );
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "emulated memory size must be a non-zero multiple of the page size"
        );
        assert!(
            validate_physical(base.as_usize() + size - 1),
            "emulated memory exceeds the physical address width"
        );

        let layout = Layout::from_size_align(size, PAGE_SIZE)
            .expect("emulated memory size overflows the host address space");
        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let memory = NonNull::new(raw).unwrap_or_else(|| alloc::alloc::handle_alloc_error(layout));

        Self {
            base,
            memory,
            layout,
        }
    }

    /// Translates a physical address to a pointer into the buffer.
    ///
    /// # Panics
    ///
    /// Panics if the address lies outside the emulated region.
    pub fn translate(&self, phys: PhysicalAddress) -> *mut u8 {
        let offset = phys.as_usize().wrapping_sub(self.base.as_usize());
        assert!(
            phys >= self.base && offset < self.layout.size(),
            "physical address {} outside emulated memory",
            phys
        );
        // SAFETY: The offset was bounds-checked against the allocation above.
        unsafe { self.memory.as_ptr().add(offset) }
    }

    /// Returns the physical address of the first byte of the region.
    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.layout.size()
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: The buffer was allocated in `new` with this exact layout.
        unsafe { alloc::alloc::dealloc(self.memory.as_ptr(), self.layout) };
    }
}
