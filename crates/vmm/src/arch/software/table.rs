//! Page table structure for software emulation.

use super::entry::PageEntry;

/// Number of entries in a software-emulated page table.
/// With 9-bit indexes, we have 512 entries per table.
const ENTRY_COUNT: usize = 512;

/// A page table for software emulation.
///
/// A table is exactly one page of entries and is placed directly inside a physical frame,
/// the same way hardware expects to find it.
///
/// Address layout:
/// - Bits 0-11: Page offset (4 KiB)
/// - Bits 12-20: Level 0 index
/// - Bits 21-29: Level 1 index
/// - Bits 30-38: Level 2 index (root)
#[repr(C, align(4096))]
pub struct PageTable {
    /// The entries in this page table.
    entries: [PageEntry; ENTRY_COUNT],
}

impl PageTable {
    /// Creates a new, empty page table.
    ///
    /// All entries are initialized to zero (not present).
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::EMPTY; ENTRY_COUNT],
        }
    }

    /// Returns a copy of the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry(&self, index: usize) -> PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        self.entries[index]
    }

    /// Returns a mutable reference to the entry at the given index.
    ///
    /// # Panics
    /// Panics if index >= 512.
    pub fn entry_mut(&mut self, index: usize) -> &mut PageEntry {
        assert!(index < ENTRY_COUNT, "page table index out of bounds");
        &mut self.entries[index]
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
