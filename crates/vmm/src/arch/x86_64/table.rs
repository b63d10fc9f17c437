//! Page table structure for x86_64 architecture.

use x86_64::structures::paging::page_table::PageTableEntry;

use super::entry::PageEntry;

/// Number of entries in an x86_64 page table.
const ENTRY_COUNT: usize = 512;

/// A page table for x86_64 architecture.
///
/// This represents a single level in the page table hierarchy. On x86_64 with
/// 4-level paging, there are four levels: PML4 (level 3), PDPT (level 2),
/// PD (level 1), and PT (level 0). The table occupies exactly one frame.
#[repr(transparent)]
pub struct PageTable(x86_64::structures::paging::PageTable);

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub const fn new() -> Self {
        Self(x86_64::structures::paging::PageTable::new())
    }

    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: PageTableEntry and PageEntry are both transparent wrappers over a
        // 64-bit value with the same layout.
        unsafe { *(&self.0[index] as *const PageTableEntry as *const PageEntry) }
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        // SAFETY: We're reinterpreting the page table entry as our PageEntry type.
        // Both are 64-bit values with the same layout.
        unsafe { &mut *(&mut self.0[index] as *mut PageTableEntry as *mut PageEntry) }
    }

    /// Returns the number of entries in this page table.
    pub const fn len(&self) -> usize {
        ENTRY_COUNT
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}
