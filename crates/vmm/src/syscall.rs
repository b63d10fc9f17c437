//! System call entry points for the memory subsystem.
//!
//! These wrappers take raw register values and flatten errors into the user ABI: `0` or
//! `-1` for status results, and `usize::MAX` for lookups that find nothing.

use crate::address_space::AddressSpace;
use crate::error::VmError;
use crate::fork::fork_address_space;
use crate::memory_manager::MemoryManager;
use crate::protection::{Protection, set_protection};
use crate::VirtualAddress;

pub const PROT_NONE: u32 = Protection::NONE.bits();
pub const PROT_READ: u32 = Protection::READ.bits();
pub const PROT_WRITE: u32 = Protection::WRITE.bits();
pub const PROT_EXEC: u32 = Protection::EXEC.bits();

/// Returned by lookups that find no mapping, and by a failed `sbrk`.
pub const NOT_MAPPED: usize = usize::MAX;

/// Changes the protection of every page overlapping `[addr, addr + len)`.
///
/// Returns `0` on success and `-1` on unknown protection bits, an invalid range, or a
/// range containing an unmapped page.
pub fn sys_mprotect(space: &AddressSpace, addr: usize, len: usize, prot: u32) -> isize {
    let Some(protection) = Protection::from_bits(prot) else {
        log::debug!("mprotect: unknown protection bits {:#x}", prot);
        return -1;
    };
    let Some(start) = VirtualAddress::try_new(addr) else {
        log::debug!("mprotect: non-canonical address {:#x}", addr);
        return -1;
    };

    match set_protection(space, start, len, protection) {
        Ok(_) => 0,
        Err(err) => {
            log::debug!("mprotect({:#x}, {:#x}, {:#x}) failed: {}", addr, len, prot, err);
            -1
        }
    }
}

/// Returns the raw flags of the entry translating `va`, or [`NOT_MAPPED`].
pub fn sys_pteflags(space: &AddressSpace, va: usize) -> usize {
    VirtualAddress::try_new(va)
        .and_then(|va| space.pte_flags(va))
        .map_or(NOT_MAPPED, |flags| flags.to_raw())
}

/// Returns the physical address of the frame backing `va`, or [`NOT_MAPPED`].
pub fn sys_ptepa(space: &AddressSpace, va: usize) -> usize {
    VirtualAddress::try_new(va)
        .and_then(|va| space.pte_physical(va))
        .map_or(NOT_MAPPED, |phys| phys.as_usize())
}

/// Moves the heap top by `delta` bytes and returns the previous top, or `usize::MAX` if
/// the heap cannot move that far.
pub fn sys_sbrk(space: &AddressSpace, delta: isize) -> usize {
    let bytes = delta.unsigned_abs();
    // The previous top is derived from the new one, which grow and shrink compute under
    // the same lock as the move itself.
    let result = match delta {
        0 => return space.heap_top().as_usize(),
        d if d > 0 => space.grow(bytes).map(|top| top.as_usize() - bytes),
        _ => space.shrink(bytes).map(|top| top.as_usize() + bytes),
    };

    match result {
        Ok(previous) => previous,
        Err(err) => {
            log::debug!("sbrk({}) failed: {}", delta, err);
            usize::MAX
        }
    }
}

/// Returns the number of free frames in the pool.
pub fn sys_freepages(memory: &MemoryManager) -> usize {
    memory.free_frames()
}

/// Duplicates `space` for a new child process.
pub fn sys_fork(space: &AddressSpace) -> Result<AddressSpace, VmError> {
    fork_address_space(space)
}
