//! Page table entry flags for x86_64 architecture.

use x86_64::structures::paging::PageTableFlags;

/// Page table entry flags for x86_64.
///
/// This wraps the x86_64 crate's page table entry flags. The hardware has no read
/// permission separate from presence, so readability is tracked in an available bit
/// (`BIT_10`) and every present leaf is readable. A mapping that grants no access keeps
/// `PRESENT` clear and sets available bit `BIT_11` instead. Copy-on-write uses available
/// bit `BIT_9`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(PageTableFlags);

impl PageFlags {
    /// Available bit carrying the copy-on-write marker.
    const COW: PageTableFlags = PageTableFlags::BIT_9;

    /// Available bit recording that the page was granted read access.
    const READABLE: PageTableFlags = PageTableFlags::BIT_10;

    /// Available bit marking a mapping that is not present to the hardware.
    const INACCESSIBLE: PageTableFlags = PageTableFlags::BIT_11;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(PageTableFlags::empty())
    }

    /// Returns the flags for an entry that points at a lower-level table.
    ///
    /// Permissions are the intersection of every level on x86_64, so intermediate entries
    /// grant everything and leave enforcement to the leaf.
    pub const fn table() -> Self {
        Self(
            PageTableFlags::from_bits_truncate(
                PageTableFlags::PRESENT.bits()
                    | PageTableFlags::WRITABLE.bits()
                    | PageTableFlags::USER_ACCESSIBLE.bits(),
            ),
        )
    }

    /// Creates page flags from a raw usize value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(PageTableFlags::from_bits_truncate(raw as u64))
    }

    /// Returns the raw usize value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0.bits() as usize
    }

    /// Returns whether the entry holds a mapping, accessible or not.
    pub fn is_present(self) -> bool {
        self.0.intersects(PageTableFlags::PRESENT | Self::INACCESSIBLE)
    }

    /// Sets or clears the present bit. Clearing also drops the inaccessible marker.
    pub fn set_present(&mut self, present: bool) {
        self.0.remove(Self::INACCESSIBLE);
        self.0.set(PageTableFlags::PRESENT, present);
    }

    /// Returns whether the hardware translates through this entry.
    pub fn is_accessible(self) -> bool {
        self.0.contains(PageTableFlags::PRESENT)
    }

    /// Marks these flags as a leaf mapping.
    ///
    /// Any present page can be read, so an execute-only leaf becomes readable. A leaf
    /// granting nothing stays non-present and is tagged inaccessible.
    pub fn set_leaf_present(&mut self) {
        let accessible = self.is_readable() || self.is_writable() || self.is_executable();
        self.0.set(Self::READABLE, accessible);
        self.0.set(PageTableFlags::PRESENT, accessible);
        self.0.set(Self::INACCESSIBLE, !accessible);
    }

    /// Returns whether the page was granted read access.
    pub fn is_readable(self) -> bool {
        self.0.contains(Self::READABLE)
    }

    /// Records whether the page is granted read access.
    pub fn set_readable(&mut self, readable: bool) {
        self.0.set(Self::READABLE, readable);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        self.0.contains(PageTableFlags::WRITABLE)
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.0.set(PageTableFlags::WRITABLE, writable);
    }

    /// Returns whether instruction fetches are allowed (no-execute bit clear).
    pub fn is_executable(self) -> bool {
        !self.0.contains(PageTableFlags::NO_EXECUTE)
    }

    /// Sets or clears the no-execute bit.
    pub fn set_executable(&mut self, executable: bool) {
        self.0.set(PageTableFlags::NO_EXECUTE, !executable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        self.0.contains(PageTableFlags::USER_ACCESSIBLE)
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.0.set(PageTableFlags::USER_ACCESSIBLE, user);
    }

    /// Returns whether the copy-on-write bit is set.
    pub fn is_cow(self) -> bool {
        self.0.contains(Self::COW)
    }

    /// Sets or clears the copy-on-write bit.
    pub fn set_cow(&mut self, cow: bool) {
        self.0.set(Self::COW, cow);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
