//! Copy-on-write address space duplication.
//!
//! Forking happens in two phases while the parent's lock is held:
//!
//! 1. Stage: copy the parent's translation structure into a new directory whose user leaves
//!    point at the parent's frames. This allocates page tables and is the only step that
//!    can fail. On failure the staged tables are freed and the parent is untouched.
//! 2. Commit: add a reference to every shared frame and downgrade every writable page to
//!    copy-on-write in both the parent and the child. Nothing here allocates, so nothing
//!    here can fail.

use crate::address_space::AddressSpace;
use crate::error::VmError;

/// Creates a child address space sharing every user page of `parent`.
///
/// Writable pages become read-only and copy-on-write in both address spaces; the first
/// write by either side takes a private copy. Read-only pages are shared as they are. The
/// child starts with the parent's heap top.
pub fn fork_address_space(parent: &AddressSpace) -> Result<AddressSpace, VmError> {
    let mm = parent.memory();
    let mut inner = parent.lock();

    let mut child = inner
        .directory
        .duplicate_structure(mm, |entry| entry.flags().is_user())
        .inspect_err(|err| log::warn!("fork failed while copying page tables: {}", err))?;

    let mut shared = 0;
    let mut downgraded = 0;
    inner.directory.for_each_leaf_mut(mm, |page, entry| {
        let mut flags = entry.flags();
        if !flags.is_user() {
            return;
        }

        let Some(frame) = entry.address().map(|addr| addr.frame_number()) else {
            return;
        };
        let references = mm.refs().increment(frame);
        shared += 1;

        if flags.is_writable() {
            flags.set_writable(false);
            flags.set_cow(true);
            entry.set_flags(flags);
            if child.set_flags(mm, page, flags).is_err() {
                panic!("staged child has no entry for {}", page);
            }
            mm.tlb().invalidate(page);
            downgraded += 1;
        }

        crate::trace_page!(
            "fork: {} -> {:?} ({} references) {}",
            page,
            frame,
            references,
            flags
        );
    });

    log::debug!(
        "fork: {} pages shared, {} downgraded to copy-on-write",
        shared,
        downgraded
    );
    Ok(AddressSpace::from_parts(mm.clone(), child, inner.heap_top))
}
