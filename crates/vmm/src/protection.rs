//! Page-level protection changes.
//!
//! Protection requests name a byte range but act on every page the range touches. The
//! whole range is validated before any entry changes, so a request either applies to every
//! page or to none.
//!
//! Granting write access on a page whose frame is still shared after a fork does not copy
//! the frame. The copy-on-write marker is cleared and the page becomes writable while still
//! shared, so every address space mapping that frame writably sees the others' writes.

use core::fmt;
use core::ops::BitOr;

use crate::address_space::AddressSpace;
use crate::error::VmError;
use crate::{PageRange, VirtualAddress};

/// A set of user access permissions.
#[derive(Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Protection(u8);

impl Protection {
    /// No access at all.
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXEC: Self = Self(1 << 2);

    const ALL: u8 = Self::READ.0 | Self::WRITE.0 | Self::EXEC.0;

    /// Converts a raw permission bitset, returning `None` if it contains unknown bits.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits & !(Self::ALL as u32) != 0 {
            None
        } else {
            Some(Self(bits as u8))
        }
    }

    /// Returns the raw permission bitset.
    pub const fn bits(self) -> u32 {
        self.0 as u32
    }

    pub const fn readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }

    pub const fn executable(self) -> bool {
        self.0 & Self::EXEC.0 != 0
    }
}

impl BitOr for Protection {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Protection({}{}{})",
            if self.readable() { 'r' } else { '-' },
            if self.writable() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' }
        )
    }
}

/// Rewrites the permissions of every page overlapping `[start, start + length)` to exactly
/// `requested`, returning the page range that was changed.
///
/// Write access implies read access. The copy-on-write marker is cleared on every page in
/// the range. Fails with [`VmError::Unmapped`] if any page in the range has no user mapping,
/// and with [`VmError::InvalidRange`] if the range overflows or leaves user space; no page
/// changes in either case. A zero-length request succeeds and changes nothing.
pub fn set_protection(
    space: &AddressSpace,
    start: VirtualAddress,
    length: usize,
    requested: Protection,
) -> Result<PageRange, VmError> {
    let range = PageRange::covering(start, length).ok_or(VmError::InvalidRange)?;
    if range.is_empty() {
        return Ok(range);
    }

    let mm = space.memory();
    if range.end() > mm.config().user_limit.page_number() {
        return Err(VmError::InvalidRange);
    }

    let mut inner = space.lock();
    let directory = &mut inner.directory;

    for page in range.pages() {
        match directory.lookup(mm, page.start()) {
            Some(entry) if entry.flags().is_user() => {}
            _ => return Err(VmError::Unmapped),
        }
    }

    for page in range.pages() {
        let Some(entry) = directory.leaf_mut(mm, page.start()) else {
            unreachable!("{} unmapped after validation", page.start());
        };
        let mut flags = entry.flags();
        flags.apply_protection(requested);
        crate::trace_page!("{}: {} -> {}", page.start(), entry.flags(), flags);
        entry.set_flags(flags);
    }

    mm.tlb().invalidate_range(range);
    log::debug!(
        "protection of {} pages at {} set to {:?}",
        range.len(),
        range.start().start(),
        requested
    );
    Ok(range)
}
