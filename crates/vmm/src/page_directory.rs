//! Architecture-independent page table management.
//!
//! This module provides the `PageDirectory` type, which owns the frame holding a root
//! `PageTable` and every intermediate table below it, and provides the walking, mapping and
//! structural-copy operations address spaces are built on.
//!
//! Page tables live in frames drawn from the same pool as page contents. A directory never
//! touches the reference count of a leaf frame except when it is told to drop its leaves;
//! reference bookkeeping for mappings belongs to the caller.

use crate::error::VmError;
use crate::frame_allocator::AllocError;
use crate::memory_manager::MemoryManager;
use crate::ref_table::FrameKind;
use crate::{
    FrameNumber, VirtualAddress,
    arch::{self, PageEntry, PageFlags, PageTable},
};

/// Number of virtual address bits consumed by each table level.
const INDEX_BITS: usize = 9;

/// Returns a reference to the page table held in `frame`.
///
/// # Safety
///
/// `frame` must hold a page table belonging to a directory the caller has exclusive access
/// to, and no other reference to that table may be live for `'a`.
unsafe fn table_at<'a>(mm: &MemoryManager, frame: FrameNumber) -> &'a mut PageTable {
    // SAFETY: Upheld by the caller. Table frames are page-aligned and fully mapped.
    unsafe { &mut *mm.frames().table_ptr(frame) }
}

/// Returns the frame an entry points at, if it is present.
fn target(entry: PageEntry) -> Option<FrameNumber> {
    entry.address().map(|addr| addr.frame_number())
}

/// Returns the number of bytes of address space covered by one entry at `level`.
fn level_span(level: usize) -> usize {
    arch::PAGE_SIZE << (INDEX_BITS * level)
}

/// The translation structure of one address space.
///
/// The directory owns the frames of its tables, each claimed with a single reference. The
/// owning address space tears it down explicitly; dropping a bare directory leaks its
/// frames.
#[derive(Debug)]
pub struct PageDirectory {
    /// Frame holding the root page table.
    root: FrameNumber,
}

impl PageDirectory {
    /// Creates a directory with an empty root table.
    pub fn new(mm: &MemoryManager) -> Result<Self, AllocError> {
        let root = mm.allocate_frame(FrameKind::PageTable)?;
        Ok(Self { root })
    }

    /// Returns the frame holding the root page table.
    pub fn root(&self) -> FrameNumber {
        self.root
    }

    /// Returns the present leaf entry translating `virt`, rounding it down to its page.
    pub fn lookup(&self, mm: &MemoryManager, virt: VirtualAddress) -> Option<PageEntry> {
        let mut frame = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: The borrow of `self` keeps the structure alive and unmodified.
            let table = unsafe { table_at(mm, frame) };
            frame = target(table.entry(virt.page_index(level)))?;
        }

        // SAFETY: As above.
        let entry = unsafe { table_at(mm, frame) }.entry(virt.page_index(0));
        entry.is_present().then_some(entry)
    }

    /// Returns the present leaf entry translating `virt` for in-place modification.
    pub(crate) fn leaf_mut<'a>(
        &'a mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
    ) -> Option<&'a mut PageEntry> {
        self.walk_mut(mm, virt).filter(|entry| entry.is_present())
    }

    /// Walks the hierarchy to the leaf entry for a virtual address.
    ///
    /// Returns None if any intermediate table is not present. The leaf itself may be empty.
    fn walk_mut<'a>(
        &'a mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
    ) -> Option<&'a mut PageEntry> {
        let mut frame = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: The exclusive borrow of `self` covers every table in the structure.
            let table = unsafe { table_at(mm, frame) };
            frame = target(table.entry(virt.page_index(level)))?;
        }

        // SAFETY: As above.
        let table: &'a mut PageTable = unsafe { table_at(mm, frame) };
        Some(table.entry_mut(virt.page_index(0)))
    }

    /// Walks the hierarchy to the leaf entry for a virtual address, creating intermediate
    /// tables as needed.
    ///
    /// Tables created before an allocation failure stay linked in, empty, and are freed
    /// with the rest of the structure.
    fn walk_or_create<'a>(
        &'a mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
    ) -> Result<&'a mut PageEntry, AllocError> {
        let mut frame = self.root;
        for level in (1..arch::PAGE_TABLE_LEVELS).rev() {
            // SAFETY: The exclusive borrow of `self` covers every table in the structure.
            let entry = unsafe { table_at(mm, frame) }.entry_mut(virt.page_index(level));
            frame = match target(*entry) {
                Some(next) => next,
                None => {
                    let next = mm.allocate_frame(FrameKind::PageTable)?;
                    *entry = PageEntry::new(next.start(), PageFlags::table());
                    next
                }
            };
        }

        // SAFETY: As above.
        let table: &'a mut PageTable = unsafe { table_at(mm, frame) };
        Ok(table.entry_mut(virt.page_index(0)))
    }

    /// Maps a page-aligned virtual address to `frame` with the given flags.
    ///
    /// The entry is always marked as a leaf mapping. The caller's reference to `frame`
    /// passes to the mapping.
    pub fn map(
        &mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
        frame: FrameNumber,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        if !virt.is_aligned(arch::PAGE_SIZE) {
            return Err(VmError::Misaligned);
        }

        let entry = self.walk_or_create(mm, virt)?;
        if entry.is_present() {
            return Err(VmError::AlreadyMapped);
        }

        let mut flags = flags;
        flags.set_leaf_present();
        *entry = PageEntry::new(frame.start(), flags);
        Ok(())
    }

    /// Clears the mapping of a page-aligned virtual address and returns its frame.
    ///
    /// The mapping's reference passes back to the caller, who must drop it.
    pub fn unmap(
        &mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
    ) -> Result<FrameNumber, VmError> {
        if !virt.is_aligned(arch::PAGE_SIZE) {
            return Err(VmError::Misaligned);
        }

        let entry = self.walk_mut(mm, virt).ok_or(VmError::Unmapped)?;
        let frame = target(*entry).ok_or(VmError::Unmapped)?;
        entry.clear();
        Ok(frame)
    }

    /// Overwrites the flags of an existing mapping, preserving its frame.
    pub fn set_flags(
        &mut self,
        mm: &MemoryManager,
        virt: VirtualAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let entry = self.leaf_mut(mm, virt).ok_or(VmError::Unmapped)?;

        let mut flags = flags;
        flags.set_leaf_present();
        entry.set_flags(flags);
        Ok(())
    }

    /// Calls `f` with every present leaf entry, in ascending address order.
    pub fn for_each_leaf(&self, mm: &MemoryManager, mut f: impl FnMut(VirtualAddress, PageEntry)) {
        fn visit(
            mm: &MemoryManager,
            frame: FrameNumber,
            level: usize,
            base: usize,
            f: &mut dyn FnMut(VirtualAddress, PageEntry),
        ) {
            // SAFETY: The caller holds a shared borrow of the directory.
            let table = unsafe { table_at(mm, frame) };
            for index in 0..table.len() {
                let entry = table.entry(index);
                let Some(next) = target(entry) else {
                    continue;
                };
                let addr = base + index * level_span(level);
                if level == 0 {
                    f(VirtualAddress::new(arch::canonicalize_virtual(addr)), entry);
                } else {
                    visit(mm, next, level - 1, addr, f);
                }
            }
        }

        visit(mm, self.root, arch::PAGE_TABLE_LEVELS - 1, 0, &mut f);
    }

    /// Calls `f` with a mutable reference to every present leaf entry, in ascending address
    /// order.
    pub fn for_each_leaf_mut(
        &mut self,
        mm: &MemoryManager,
        mut f: impl FnMut(VirtualAddress, &mut PageEntry),
    ) {
        fn visit(
            mm: &MemoryManager,
            frame: FrameNumber,
            level: usize,
            base: usize,
            f: &mut dyn FnMut(VirtualAddress, &mut PageEntry),
        ) {
            // SAFETY: The caller holds an exclusive borrow of the directory, and each table
            // is borrowed only while its own entries are visited.
            let table = unsafe { table_at(mm, frame) };
            for index in 0..table.len() {
                let entry = table.entry_mut(index);
                let Some(next) = target(*entry) else {
                    continue;
                };
                let addr = base + index * level_span(level);
                if level == 0 {
                    f(VirtualAddress::new(arch::canonicalize_virtual(addr)), entry);
                } else {
                    visit(mm, next, level - 1, addr, f);
                }
            }
        }

        visit(mm, self.root, arch::PAGE_TABLE_LEVELS - 1, 0, &mut f);
    }

    /// Builds a new directory with the same shape whose leaves point at the same frames.
    ///
    /// Only leaves for which `keep` returns true are copied. Entries are copied verbatim:
    /// no reference counts change and no flags are rewritten. If a table cannot be
    /// allocated, every table frame of the partial copy is freed again and this directory
    /// is left untouched.
    pub fn duplicate_structure(
        &self,
        mm: &MemoryManager,
        keep: impl Fn(PageEntry) -> bool,
    ) -> Result<PageDirectory, AllocError> {
        fn copy(
            mm: &MemoryManager,
            source: FrameNumber,
            dest: FrameNumber,
            level: usize,
            keep: &dyn Fn(PageEntry) -> bool,
        ) -> Result<(), AllocError> {
            // SAFETY: `source` belongs to the borrowed directory and `dest` to the copy being
            // built. They are distinct frames.
            let (from, to) = unsafe { (table_at(mm, source), table_at(mm, dest)) };
            for index in 0..from.len() {
                let entry = from.entry(index);
                let Some(next) = target(entry) else {
                    continue;
                };
                if level == 0 {
                    if keep(entry) {
                        *to.entry_mut(index) = entry;
                    }
                    continue;
                }

                let table = mm.allocate_frame(FrameKind::PageTable)?;
                *to.entry_mut(index) = PageEntry::new(table.start(), PageFlags::table());
                copy(mm, next, table, level - 1, keep)?;
            }
            Ok(())
        }

        let mut copied = PageDirectory::new(mm)?;
        match copy(mm, self.root, copied.root, arch::PAGE_TABLE_LEVELS - 1, &keep) {
            Ok(()) => Ok(copied),
            Err(err) => {
                copied.release_structure(mm);
                Err(err)
            }
        }
    }

    /// Clears every leaf mapping and drops its frame reference, returning how many were
    /// cleared. Frames whose count reaches zero go back to the pool.
    pub fn clear_leaves(&mut self, mm: &MemoryManager) -> usize {
        let mut cleared = 0;
        self.for_each_leaf_mut(mm, |virt, entry| {
            let Some(frame) = target(*entry) else {
                return;
            };
            entry.clear();
            mm.tlb().invalidate(virt);
            let freed = mm.release_frame(frame);
            crate::trace_page!("unmapped {} from {:?} (freed: {})", virt, frame, freed);
            cleared += 1;
        });
        cleared
    }

    /// Frees every table frame of the directory, root included.
    ///
    /// Leaf entries are discarded without touching their frames' reference counts, so
    /// this is only correct once the leaves have been cleared or were never counted. The
    /// directory must not be used afterwards.
    pub(crate) fn release_structure(&mut self, mm: &MemoryManager) {
        fn release(mm: &MemoryManager, frame: FrameNumber, level: usize) {
            if level > 0 {
                // SAFETY: The caller holds the directory exclusively and abandons it.
                let table = unsafe { table_at(mm, frame) };
                for index in 0..table.len() {
                    if let Some(next) = target(table.entry(index)) {
                        release(mm, next, level - 1);
                    }
                }
            }
            mm.release_frame(frame);
        }

        release(mm, self.root, arch::PAGE_TABLE_LEVELS - 1);
    }
}
