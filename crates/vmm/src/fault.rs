//! Page fault classification and copy-on-write resolution.
//!
//! The trap dispatcher hands every user page fault to [`handle_page_fault`]. The fault is
//! classified from the faulting entry alone:
//!
//! | entry                      | access        | outcome                          |
//! |----------------------------|---------------|----------------------------------|
//! | missing                    | any           | segmentation fault (not mapped)  |
//! | not user-accessible        | any           | segmentation fault (denied)      |
//! | copy-on-write and writable | write         | internal inconsistency           |
//! | copy-on-write              | write         | copy-on-write resolution         |
//! | required flag present      | any           | internal inconsistency           |
//! | required flag absent       | any           | segmentation fault (denied)      |
//!
//! The copy-on-write marker only matters for writes. A read or execute fault on a
//! copy-on-write page whose required flag is missing is a plain protection fault.

use core::fmt;

use crate::address_space::AddressSpace;
use crate::arch::PageEntry;
use crate::memory_manager::MemoryManager;
use crate::page_directory::PageDirectory;
use crate::ref_table::FrameKind;
use crate::{FrameNumber, VirtualAddress, arch};

/// The kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
}

impl fmt::Display for AccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Execute => write!(f, "execute"),
        }
    }
}

/// Why a fault could not be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultCause {
    /// No user mapping exists for the address.
    NotMapped,
    /// The mapping does not grant the access.
    AccessDenied,
    /// A private copy of a shared page could not be allocated.
    OutOfMemory,
    /// The address is not aligned for the access, such as a fetch off an instruction
    /// boundary.
    Misaligned,
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotMapped => write!(f, "address not mapped"),
            Self::AccessDenied => write!(f, "access denied"),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Misaligned => write!(f, "misaligned address"),
        }
    }
}

/// A fault the kernel cannot resolve. The faulting thread of control must be terminated;
/// no memory state has been changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentationFault {
    pub address: VirtualAddress,
    pub access: AccessKind,
    pub cause: FaultCause,
}

impl fmt::Display for SegmentationFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "segmentation fault: {} at {}: {}",
            self.access, self.address, self.cause
        )
    }
}

impl core::error::Error for SegmentationFault {}

/// The outcome of classifying a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultClass {
    /// The access is not allowed. Deliver a segmentation fault.
    Violation(FaultCause),
    /// A write hit a shared page. Privatize or upgrade it.
    CopyOnWrite,
    /// The entry and the fault contradict each other.
    Inconsistent(&'static str),
}

/// How a copy-on-write fault was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultResolution {
    /// The page was shared: its contents were copied into a new private frame.
    Privatized { from: FrameNumber, to: FrameNumber },
    /// The page was the last reference to its frame and was made writable in place.
    Upgraded { frame: FrameNumber },
}

/// Classifies a fault on the entry currently translating the faulting address.
pub fn classify(entry: Option<PageEntry>, access: AccessKind) -> FaultClass {
    let Some(entry) = entry.filter(|entry| entry.is_present()) else {
        return FaultClass::Violation(FaultCause::NotMapped);
    };

    let flags = entry.flags();
    if !flags.is_user() {
        return FaultClass::Violation(FaultCause::AccessDenied);
    }

    match access {
        AccessKind::Write if flags.is_cow() && flags.is_writable() => {
            FaultClass::Inconsistent("copy-on-write entry is also writable")
        }
        AccessKind::Write if flags.is_cow() => FaultClass::CopyOnWrite,
        _ if flags.permits(access) => FaultClass::Inconsistent("access is already permitted"),
        _ => FaultClass::Violation(FaultCause::AccessDenied),
    }
}

/// Handles a page fault raised by `access` at `address` in `space`.
///
/// Returns how a copy-on-write fault was resolved, after which the faulting instruction
/// may be retried. Returns a [`SegmentationFault`] if the access must not proceed.
///
/// # Panics
///
/// Panics on an internal inconsistency: a spurious fault, a page that is both writable
/// and copy-on-write, or a copy-on-write frame with no references.
pub fn handle_page_fault(
    space: &AddressSpace,
    address: VirtualAddress,
    access: AccessKind,
) -> Result<FaultResolution, SegmentationFault> {
    let mut inner = space.lock();
    handle_locked(space.memory(), &mut inner.directory, address, access)
}

/// Handles a fault on a directory whose address-space lock the caller already holds.
pub(crate) fn handle_locked(
    mm: &MemoryManager,
    directory: &mut PageDirectory,
    address: VirtualAddress,
    access: AccessKind,
) -> Result<FaultResolution, SegmentationFault> {
    let entry = directory.leaf_mut(mm, address);
    match classify(entry.as_deref().copied(), access) {
        FaultClass::Violation(cause) => {
            let fault = SegmentationFault {
                address,
                access,
                cause,
            };
            log::warn!("{}", fault);
            Err(fault)
        }
        FaultClass::Inconsistent(reason) => {
            panic!("inconsistent {} fault at {}: {}", access, address, reason)
        }
        FaultClass::CopyOnWrite => match entry {
            Some(entry) => resolve_copy_on_write(mm, entry, address),
            None => unreachable!("copy-on-write fault without an entry"),
        },
    }
}

fn resolve_copy_on_write(
    mm: &MemoryManager,
    entry: &mut PageEntry,
    address: VirtualAddress,
) -> Result<FaultResolution, SegmentationFault> {
    let page = address.align_down(arch::PAGE_SIZE);
    let Some(old) = entry.address().map(|addr| addr.frame_number()) else {
        unreachable!("copy-on-write fault on a non-present entry");
    };

    let mut flags = entry.flags();
    flags.set_writable(true);
    flags.set_cow(false);

    let resolution = match mm.refs().count(old) {
        0 => panic!("copy-on-write fault at {} on unreferenced {:?}", page, old),
        1 => {
            entry.set_flags(flags);
            FaultResolution::Upgraded { frame: old }
        }
        _ => {
            let new = mm.allocate_frame(FrameKind::Data).map_err(|err| {
                let fault = SegmentationFault {
                    address,
                    access: AccessKind::Write,
                    cause: FaultCause::OutOfMemory,
                };
                log::warn!("{} ({})", fault, err);
                fault
            })?;
            mm.frames().copy_frame(old, new);
            *entry = PageEntry::new(new.start(), flags);
            mm.release_frame(old);
            FaultResolution::Privatized { from: old, to: new }
        }
    };

    mm.tlb().invalidate(page);
    log::debug!("copy-on-write at {}: {:?}", page, resolution);
    Ok(resolution)
}
