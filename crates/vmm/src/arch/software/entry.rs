//! Page table entry for software emulation.

use crate::PhysicalAddress;

use super::flags::PageFlags;

/// A single page table entry for software emulation.
///
/// The entry format follows Sv39:
/// - Bits 0-9: Flags
/// - Bits 10-53: Physical page number (physical address >> 12)
/// - Bits 54-63: Reserved (zero)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageEntry(usize);

impl PageEntry {
    /// Physical page number field, after shifting the entry right by `PPN_SHIFT`.
    const PPN_MASK: usize = (1 << 44) - 1;

    /// Position of the physical page number within the entry.
    const PPN_SHIFT: usize = 10;

    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Creates a new page table entry.
    ///
    /// The physical address must be page-aligned (lowest 12 bits must be zero).
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        debug_assert!(
            address.as_usize() & 0xFFF == 0,
            "physical address must be page-aligned"
        );

        let ppn = (address.as_usize() >> 12) & Self::PPN_MASK;
        Self((ppn << Self::PPN_SHIFT) | (flags.to_raw() & PageFlags::MASK))
    }

    /// Returns the physical address stored in this entry.
    ///
    /// Returns None if the entry is not present.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_present() {
            let ppn = (self.0 >> Self::PPN_SHIFT) & Self::PPN_MASK;
            Some(PhysicalAddress::new(ppn << 12))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub fn flags(self) -> PageFlags {
        PageFlags::from_raw(self.0)
    }

    /// Sets the flags for this entry, preserving the address.
    pub fn set_flags(&mut self, flags: PageFlags) {
        let addr_bits = self.0 & !PageFlags::MASK;
        self.0 = addr_bits | (flags.to_raw() & PageFlags::MASK);
    }

    /// Returns whether this entry is present (valid).
    pub fn is_present(self) -> bool {
        self.flags().is_present()
    }

    /// Clears this entry (sets it to zero).
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Returns the raw usize value of this entry.
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl Default for PageEntry {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_and_flags_round_trip() {
        let mut flags = PageFlags::empty();
        flags.set_present(true);
        flags.set_readable(true);
        flags.set_cow(true);

        let entry = PageEntry::new(PhysicalAddress::new(0x8012_3000), flags);
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x8012_3000)));
        assert_eq!(entry.flags(), flags);
    }

    #[test]
    fn set_flags_preserves_address() {
        let mut flags = PageFlags::table();
        let mut entry = PageEntry::new(PhysicalAddress::new(0x8000_5000), flags);

        flags.set_writable(true);
        entry.set_flags(flags);

        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x8000_5000)));
        assert!(entry.flags().is_writable());
    }

    #[test]
    fn non_present_entry_has_no_address() {
        let entry = PageEntry::new(PhysicalAddress::new(0x8000_5000), PageFlags::empty());
        assert_eq!(entry.address(), None);
        assert_eq!(PageEntry::default().as_usize(), 0);
    }
}
