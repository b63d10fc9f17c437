//! Page table entry flags for software emulation.

/// Page table entry flags for software emulation.
///
/// Flags occupy the low ten bits of an entry, in the Sv39 positions. Bits 8 and 9 are the
/// two bits Sv39 reserves for supervisor software: bit 8 carries the copy-on-write marker
/// and bit 9 marks a mapping that grants no access. Sv39 reads a valid entry without
/// permission bits as a pointer to the next level, so such a mapping keeps V clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageFlags(usize);

impl PageFlags {
    /// Valid bit (bit 0).
    const PRESENT: usize = 1 << 0;

    /// Readable bit (bit 1).
    const READABLE: usize = 1 << 1;

    /// Writable bit (bit 2).
    const WRITABLE: usize = 1 << 2;

    /// Executable bit (bit 3).
    const EXECUTABLE: usize = 1 << 3;

    /// User-accessible bit (bit 4).
    const USER: usize = 1 << 4;

    /// Copy-on-write pending bit (bit 8, software-reserved).
    const COW: usize = 1 << 8;

    /// Mapped-but-inaccessible bit (bit 9, software-reserved).
    const INACCESSIBLE: usize = 1 << 9;

    /// All bits an entry stores as flags.
    pub(super) const MASK: usize = 0x3FF;

    /// Creates empty page flags (page not present).
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns the flags for an entry that points at a lower-level table.
    ///
    /// Sv39 marks a non-leaf entry as valid with no permission bits.
    pub const fn table() -> Self {
        Self(Self::PRESENT)
    }

    /// Creates page flags from a raw usize value.
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw & Self::MASK)
    }

    /// Returns the raw usize value of these flags.
    pub const fn to_raw(self) -> usize {
        self.0
    }

    fn set_bit(&mut self, bit: usize, value: bool) {
        if value {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }

    /// Returns whether the entry holds a mapping, accessible or not.
    pub fn is_present(self) -> bool {
        (self.0 & (Self::PRESENT | Self::INACCESSIBLE)) != 0
    }

    /// Sets or clears the valid bit. Clearing also drops the inaccessible marker.
    pub fn set_present(&mut self, present: bool) {
        self.set_bit(Self::INACCESSIBLE, false);
        self.set_bit(Self::PRESENT, present);
    }

    /// Returns whether the hardware translates through this entry (V set).
    pub fn is_accessible(self) -> bool {
        (self.0 & Self::PRESENT) != 0
    }

    /// Marks these flags as a leaf mapping.
    ///
    /// A leaf granting no permission is stored invalid and tagged inaccessible.
    pub fn set_leaf_present(&mut self) {
        let accessible = (self.0 & (Self::READABLE | Self::WRITABLE | Self::EXECUTABLE)) != 0;
        self.set_bit(Self::PRESENT, accessible);
        self.set_bit(Self::INACCESSIBLE, !accessible);
    }

    /// Returns whether the readable bit is set.
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READABLE) != 0
    }

    /// Sets or clears the readable bit.
    pub fn set_readable(&mut self, readable: bool) {
        self.set_bit(Self::READABLE, readable);
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        self.set_bit(Self::WRITABLE, writable);
    }

    /// Returns whether the executable bit is set.
    pub fn is_executable(self) -> bool {
        (self.0 & Self::EXECUTABLE) != 0
    }

    /// Sets or clears the executable bit.
    pub fn set_executable(&mut self, executable: bool) {
        self.set_bit(Self::EXECUTABLE, executable);
    }

    /// Returns whether the user-accessible bit is set.
    pub fn is_user(self) -> bool {
        (self.0 & Self::USER) != 0
    }

    /// Sets or clears the user-accessible bit.
    pub fn set_user(&mut self, user: bool) {
        self.set_bit(Self::USER, user);
    }

    /// Returns whether the copy-on-write bit is set.
    pub fn is_cow(self) -> bool {
        (self.0 & Self::COW) != 0
    }

    /// Sets or clears the copy-on-write bit.
    pub fn set_cow(&mut self, cow: bool) {
        self.set_bit(Self::COW, cow);
    }
}

impl Default for PageFlags {
    fn default() -> Self {
        Self::empty()
    }
}
