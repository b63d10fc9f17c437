use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Holds metadata for a physical memory frame.
///
/// Modeled after Linux's `struct page`, this data structure holds the bookkeeping the memory
/// manager keeps for every frame in the pool: what the frame is used for and how many
/// mappings currently reference it.
#[derive(Default)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    /// Number of live references to this frame.
    references: AtomicUsize,
}

impl Frame {
    /// Returns the current reference count.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Sets the reference count of a frame nobody else can observe yet.
    pub(crate) fn set_references(&self, count: usize) {
        self.references.store(count, Ordering::Release);
    }

    /// Adds one reference, returning the previous count.
    pub(crate) fn acquire(&self) -> usize {
        self.references.fetch_add(1, Ordering::AcqRel)
    }

    /// Drops one reference, returning the previous count, or `None` if the count was
    /// already zero (in which case it is left untouched).
    pub(crate) fn release(&self) -> Option<usize> {
        self.references
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            })
            .ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
    /// Frame holds a page table rather than user data.
    PageTable = 1 << 1,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Sets the given flag atomically.
    pub fn atomic_set(&self, flag: FrameFlag) {
        let mask = flag as u64;
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        let mask = !(flag as u64);
        self.0.fetch_and(mask, Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        let value = self.0.load(Ordering::Acquire);
        (value & mask) != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        let old = self.0.fetch_or(mask, Ordering::AcqRel);
        (old & mask) != 0
    }
}
