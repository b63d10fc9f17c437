//! Per-frame reference counting.
//!
//! Every physical frame handed out by the allocator carries a count of the mappings (or,
//! for page-table frames, the one directory) that reference it. Frames shared between
//! address spaces after a fork are only returned to the allocator once the last of those
//! references is dropped.
//!
//! Counts are atomics stored beside each frame's metadata, so deciding whether a frame is
//! shared never requires any address space's lock.

use alloc::boxed::Box;

use crate::frame::{Frame, FrameFlag};
use crate::FrameNumber;

/// What a freshly allocated frame will hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Page contents mapped into an address space.
    Data,
    /// A page table belonging to exactly one page directory.
    PageTable,
}

/// Reference counts for every frame in the pool.
pub struct FrameRefTable {
    first: FrameNumber,
    frames: Box<[Frame]>,
}

impl FrameRefTable {
    /// Creates a table covering `count` frames starting at `first`, all unreferenced.
    pub fn new(first: FrameNumber, count: usize) -> Self {
        let frames = (0..count).map(|_| Frame::default()).collect();
        Self { first, frames }
    }

    /// Returns the metadata of a frame.
    ///
    /// # Panics
    ///
    /// Panics if the frame lies outside the pool.
    pub fn frame(&self, frame: FrameNumber) -> &Frame {
        frame
            .as_usize()
            .checked_sub(self.first.as_usize())
            .and_then(|index| self.frames.get(index))
            .unwrap_or_else(|| panic!("{:?} is outside the managed frame pool", frame))
    }

    /// Records the first reference to a frame that was just allocated.
    ///
    /// # Panics
    ///
    /// Panics if the frame is already in use.
    pub fn claim(&self, frame: FrameNumber, kind: FrameKind) {
        let entry = self.frame(frame);
        assert!(
            !entry.flags.atomic_test_and_set(FrameFlag::Allocated),
            "{:?} claimed while already allocated",
            frame
        );
        assert_eq!(
            entry.references(),
            0,
            "{:?} claimed with live references",
            frame
        );
        if kind == FrameKind::PageTable {
            entry.flags.atomic_set(FrameFlag::PageTable);
        }
        entry.set_references(1);
    }

    /// Adds a reference to a frame that is already referenced, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no references: a mapping cannot be shared before it exists.
    pub fn increment(&self, frame: FrameNumber) -> usize {
        let previous = self.frame(frame).acquire();
        assert!(previous > 0, "reference added to unreferenced {:?}", frame);
        previous + 1
    }

    /// Drops a reference to a frame, returning the new count.
    ///
    /// A result of zero means the caller now owns the frame and must hand it back to the
    /// allocator.
    ///
    /// # Panics
    ///
    /// Panics if the count is already zero.
    pub fn decrement(&self, frame: FrameNumber) -> usize {
        match self.frame(frame).release() {
            Some(previous) => previous - 1,
            None => panic!("reference count underflow on {:?}", frame),
        }
    }

    /// Returns the number of references to a frame.
    pub fn count(&self, frame: FrameNumber) -> usize {
        self.frame(frame).references()
    }

    /// Returns whether a frame holds a page table.
    pub fn is_page_table(&self, frame: FrameNumber) -> bool {
        self.frame(frame).flags.atomic_test(FrameFlag::PageTable)
    }

    /// Marks an unreferenced frame as free again.
    ///
    /// # Panics
    ///
    /// Panics if the frame is still referenced or was not allocated.
    pub(crate) fn retire(&self, frame: FrameNumber) {
        let entry = self.frame(frame);
        assert_eq!(
            entry.references(),
            0,
            "{:?} freed while still referenced",
            frame
        );
        assert!(
            entry.flags.atomic_test(FrameFlag::Allocated),
            "{:?} freed twice",
            frame
        );
        entry.flags.atomic_clear(FrameFlag::PageTable);
        entry.flags.atomic_clear(FrameFlag::Allocated);
    }

    /// Returns the sum of the reference counts of all frames holding data.
    pub fn data_references(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| !frame.flags.atomic_test(FrameFlag::PageTable))
            .map(Frame::references)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> FrameRefTable {
        FrameRefTable::new(FrameNumber::new(100), 4)
    }

    #[test]
    fn claim_starts_at_one() {
        let refs = table();
        refs.claim(FrameNumber::new(101), FrameKind::Data);
        assert_eq!(refs.count(FrameNumber::new(101)), 1);
        assert!(!refs.is_page_table(FrameNumber::new(101)));
    }

    #[test]
    fn increment_and_decrement() {
        let refs = table();
        let frame = FrameNumber::new(102);
        refs.claim(frame, FrameKind::Data);
        assert_eq!(refs.increment(frame), 2);
        assert_eq!(refs.decrement(frame), 1);
        assert_eq!(refs.decrement(frame), 0);
        refs.retire(frame);
        assert_eq!(refs.data_references(), 0);
    }

    #[test]
    fn page_tables_are_excluded_from_data_references() {
        let refs = table();
        refs.claim(FrameNumber::new(100), FrameKind::PageTable);
        refs.claim(FrameNumber::new(101), FrameKind::Data);
        assert!(refs.is_page_table(FrameNumber::new(100)));
        assert_eq!(refs.data_references(), 1);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn decrement_of_zero_is_fatal() {
        table().decrement(FrameNumber::new(100));
    }

    #[test]
    #[should_panic(expected = "unreferenced")]
    fn increment_of_unreferenced_is_fatal() {
        table().increment(FrameNumber::new(100));
    }

    #[test]
    #[should_panic(expected = "still referenced")]
    fn retire_of_referenced_is_fatal() {
        let refs = table();
        refs.claim(FrameNumber::new(100), FrameKind::Data);
        refs.retire(FrameNumber::new(100));
    }

    #[test]
    #[should_panic(expected = "freed twice")]
    fn double_retire_is_fatal() {
        let refs = table();
        let frame = FrameNumber::new(100);
        refs.claim(frame, FrameKind::Data);
        refs.decrement(frame);
        refs.retire(frame);
        refs.retire(frame);
    }

    #[test]
    #[should_panic(expected = "outside the managed frame pool")]
    fn frames_outside_pool_are_rejected() {
        table().count(FrameNumber::new(99));
    }
}
