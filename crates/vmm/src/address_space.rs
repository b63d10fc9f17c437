//! Address space management.
//!
//! This module provides the per-process address space: a page directory and heap top
//! behind the process's own lock, backed by the frame pool every address space shares.

use alloc::sync::Arc;

use spin::{Mutex, MutexGuard};

use crate::arch::{self, PageEntry, PageFlags};
use crate::error::VmError;
use crate::memory_manager::MemoryManager;
use crate::page_directory::PageDirectory;
use crate::protection::Protection;
use crate::ref_table::FrameKind;
use crate::{FrameNumber, PageNumber, PageRange, PhysicalAddress, VirtualAddress};

/// The lock-protected state of an address space.
pub(crate) struct AddressSpaceInner {
    pub(crate) directory: PageDirectory,
    pub(crate) heap_top: VirtualAddress,
}

/// An address space is an architecture-independent representation of a user process's
/// virtual memory.
///
/// Each address space owns a page directory that maps its virtual pages to frames of the
/// shared pool, and holds one reference on every frame it maps. Dropping it drops those
/// references and frees its page tables.
pub struct AddressSpace {
    memory: Arc<MemoryManager>,
    inner: Mutex<AddressSpaceInner>,
}

impl AddressSpace {
    /// Creates an empty address space whose heap starts at the configured heap base.
    pub fn new(memory: Arc<MemoryManager>) -> Result<Self, VmError> {
        let directory = PageDirectory::new(&memory)?;
        let heap_top = memory.config().heap_base;
        Ok(Self::from_parts(memory, directory, heap_top))
    }

    pub(crate) fn from_parts(
        memory: Arc<MemoryManager>,
        directory: PageDirectory,
        heap_top: VirtualAddress,
    ) -> Self {
        Self {
            memory,
            inner: Mutex::new(AddressSpaceInner {
                directory,
                heap_top,
            }),
        }
    }

    /// Returns the memory manager this address space draws frames from.
    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Acquires the per-process lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, AddressSpaceInner> {
        self.inner.lock()
    }

    /// Returns the present entry translating `virt`, rounded down to its page.
    pub fn lookup(&self, virt: VirtualAddress) -> Option<PageEntry> {
        self.lock().directory.lookup(&self.memory, virt)
    }

    /// Maps a page-aligned virtual address to `frame`.
    ///
    /// The mapping takes over one reference to `frame` from the caller.
    pub fn map(
        &self,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        self.lock().directory.map(&self.memory, virt, frame, flags)
    }

    /// Removes the mapping of a page-aligned virtual address and returns its frame.
    ///
    /// The mapping's reference passes to the caller, who must drop it.
    pub fn unmap(&self, virt: VirtualAddress) -> Result<FrameNumber, VmError> {
        let frame = self.lock().directory.unmap(&self.memory, virt)?;
        self.memory.tlb().invalidate(virt);
        Ok(frame)
    }

    /// Overwrites the flags of an existing mapping in place.
    pub fn set_flags(&self, virt: VirtualAddress, flags: PageFlags) -> Result<(), VmError> {
        self.lock().directory.set_flags(&self.memory, virt, flags)?;
        self.memory.tlb().invalidate(virt.align_down(arch::PAGE_SIZE));
        Ok(())
    }

    /// Returns the current end of the heap.
    pub fn heap_top(&self) -> VirtualAddress {
        self.lock().heap_top
    }

    /// Extends the heap by `bytes`, returning the new heap top.
    ///
    /// Every page the heap newly reaches gets a fresh zeroed frame mapped read-write. If
    /// any frame or table cannot be allocated, pages mapped by this call are removed again
    /// and the heap is unchanged.
    pub fn grow(&self, bytes: usize) -> Result<VirtualAddress, VmError> {
        let mut inner = self.lock();
        let old_top = inner.heap_top;
        let new_top = old_top
            .as_usize()
            .checked_add(bytes)
            .filter(|&top| top <= self.memory.config().user_limit.as_usize())
            .map(VirtualAddress::new)
            .ok_or(VmError::OutOfMemory)?;

        let pages = heap_pages(old_top, new_top);
        for page in pages.pages() {
            if let Err(err) = self.map_fresh(&mut inner.directory, page) {
                log::warn!(
                    "heap growth to {} failed at {}: {}",
                    new_top,
                    page.start(),
                    err
                );
                let mapped = PageRange::new(pages.start(), page);
                self.unmap_range(&mut inner.directory, mapped);
                return Err(err);
            }
        }

        inner.heap_top = new_top;
        Ok(new_top)
    }

    /// Shrinks the heap by `bytes`, returning the new heap top.
    ///
    /// Pages the heap no longer reaches are unmapped and their references dropped.
    pub fn shrink(&self, bytes: usize) -> Result<VirtualAddress, VmError> {
        let mut inner = self.lock();
        let old_top = inner.heap_top;
        let new_top = old_top
            .as_usize()
            .checked_sub(bytes)
            .filter(|&top| top >= self.memory.config().heap_base.as_usize())
            .map(VirtualAddress::new)
            .ok_or(VmError::InvalidRange)?;

        self.unmap_range(&mut inner.directory, heap_pages(new_top, old_top));
        inner.heap_top = new_top;
        Ok(new_top)
    }

    fn map_fresh(&self, directory: &mut PageDirectory, page: PageNumber) -> Result<(), VmError> {
        let frame = self.memory.allocate_frame(FrameKind::Data)?;
        let flags = PageFlags::user(Protection::READ | Protection::WRITE);
        directory
            .map(&self.memory, page.start(), frame, flags)
            .inspect_err(|_| {
                self.memory.release_frame(frame);
            })
    }

    fn unmap_range(&self, directory: &mut PageDirectory, range: PageRange) {
        for page in range.pages() {
            if let Ok(frame) = directory.unmap(&self.memory, page.start()) {
                self.memory.tlb().invalidate(page.start());
                self.memory.release_frame(frame);
            }
        }
    }

    /// Returns the flags of the entry translating `virt`.
    pub fn pte_flags(&self, virt: VirtualAddress) -> Option<PageFlags> {
        self.lookup(virt).map(PageEntry::flags)
    }

    /// Returns the physical address of the frame backing the page containing `virt`.
    pub fn pte_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.lookup(virt).and_then(PageEntry::address)
    }

    /// Returns the number of pages currently mapped.
    pub fn mapped_pages(&self) -> usize {
        let mut count = 0;
        self.lock()
            .directory
            .for_each_leaf(&self.memory, |_, _| count += 1);
        count
    }

    /// Tears the address space down, dropping every mapping's frame reference.
    pub fn destroy(self) {
        drop(self);
    }
}

/// Returns the pages covered by a heap spanning `[from, to)`, excluding a page `from`
/// already reaches.
fn heap_pages(from: VirtualAddress, to: VirtualAddress) -> PageRange {
    let start = from.align_up(arch::PAGE_SIZE).page_number();
    let end = to.align_up(arch::PAGE_SIZE).page_number();
    PageRange::new(start, end)
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        let memory = &self.memory;
        let inner = self.inner.get_mut();
        let cleared = inner.directory.clear_leaves(memory);
        inner.directory.release_structure(memory);
        log::debug!(
            "address space destroyed: {} mappings dropped, {} frames free",
            cleared,
            memory.free_frames()
        );
    }
}
