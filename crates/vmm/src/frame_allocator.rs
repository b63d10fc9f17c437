//! Single-frame physical memory allocator.
//!
//! The pool is a contiguous run of physical frames. Free frames are kept on an intrusive
//! LIFO list: the number of the next free frame is written into the first word of each free
//! frame, so the allocator needs no storage of its own beyond the list head.

use core::fmt;
use core::ptr;

use spin::Mutex;

use crate::address::AddressTranslator;
use crate::arch::{self, PageTable};
use crate::ref_table::FrameRefTable;
use crate::FrameNumber;

/// Marks the end of the intrusive free list.
const END_OF_LIST: usize = usize::MAX;

/// Errors that can occur during physical frame allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Every frame in the pool is in use.
    OutOfMemory,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of physical frames"),
        }
    }
}

impl core::error::Error for AllocError {}

/// Head of the intrusive free list.
struct FreeList {
    head: Option<FrameNumber>,
    count: usize,
}

/// Hands out and takes back single physical frames.
///
/// The allocator knows nothing about address spaces. It does consult the reference table
/// when a frame is returned, so a frame that is still mapped somewhere can never re-enter
/// the pool.
pub struct FrameAllocator {
    translator: AddressTranslator,
    first: FrameNumber,
    frame_count: usize,
    free: Mutex<FreeList>,
}

impl FrameAllocator {
    /// Creates an allocator owning `frame_count` frames starting at `first`, all free.
    ///
    /// The translator must be able to reach every frame in the pool.
    pub fn new(translator: AddressTranslator, first: FrameNumber, frame_count: usize) -> Self {
        let allocator = Self {
            translator,
            first,
            frame_count,
            free: Mutex::new(FreeList {
                head: None,
                count: 0,
            }),
        };

        {
            let mut free = allocator.free.lock();
            // Push in reverse so the lowest frame is handed out first.
            for index in (0..frame_count).rev() {
                allocator.push(&mut free, first + index);
            }
        }

        allocator
    }

    /// Allocates one zero-filled frame.
    pub fn allocate(&self) -> Result<FrameNumber, AllocError> {
        let frame = {
            let mut free = self.free.lock();
            let frame = free.head.ok_or(AllocError::OutOfMemory)?;
            // SAFETY: Every frame on the free list stores the next link in its first word.
            let next = unsafe { self.frame_ptr(frame).cast::<usize>().read() };
            free.head = (next != END_OF_LIST).then(|| FrameNumber::new(next));
            free.count -= 1;
            frame
        };

        self.zero_frame(frame);
        Ok(frame)
    }

    /// Returns a frame to the pool.
    ///
    /// # Panics
    ///
    /// Panics if the frame is outside the pool, still referenced, or already free. Callers
    /// must decrement the frame's count and only free it once the count reaches zero.
    pub fn free(&self, frame: FrameNumber, refs: &FrameRefTable) {
        assert!(
            self.contains(frame),
            "{:?} is outside the managed frame pool",
            frame
        );
        refs.retire(frame);

        let mut free = self.free.lock();
        self.push(&mut free, frame);
    }

    fn push(&self, free: &mut FreeList, frame: FrameNumber) {
        let next = free.head.map_or(END_OF_LIST, FrameNumber::as_usize);
        // SAFETY: The frame is owned by the pool and is not referenced by anyone.
        unsafe { self.frame_ptr(frame).cast::<usize>().write(next) };
        free.head = Some(frame);
        free.count += 1;
    }

    /// Returns the number of frames currently free.
    pub fn free_count(&self) -> usize {
        self.free.lock().count
    }

    /// Returns the number of frames in the pool.
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Returns the first frame of the pool.
    pub fn first_frame(&self) -> FrameNumber {
        self.first
    }

    /// Returns whether the frame belongs to this pool.
    pub fn contains(&self, frame: FrameNumber) -> bool {
        frame >= self.first && frame - self.first < self.frame_count
    }

    /// Returns a pointer to the first byte of a frame.
    pub fn frame_ptr(&self, frame: FrameNumber) -> *mut u8 {
        self.translator.phys_to_ptr(frame.start())
    }

    /// Returns a pointer to the page table stored in a frame.
    pub(crate) fn table_ptr(&self, frame: FrameNumber) -> *mut PageTable {
        self.translator.phys_to_ptr(frame.start())
    }

    /// Fills a frame with zeroes.
    pub fn zero_frame(&self, frame: FrameNumber) {
        // SAFETY: The translator maps the whole frame, and the caller owns it.
        unsafe { ptr::write_bytes(self.frame_ptr(frame), 0, arch::PAGE_SIZE) };
    }

    /// Copies the full contents of one frame into another.
    ///
    /// # Panics
    ///
    /// Panics if the two frames are the same.
    pub fn copy_frame(&self, from: FrameNumber, to: FrameNumber) {
        assert_ne!(from, to, "frame copied onto itself");
        // SAFETY: Distinct frames never overlap, and the translator maps both in full.
        unsafe {
            ptr::copy_nonoverlapping(self.frame_ptr(from), self.frame_ptr(to), arch::PAGE_SIZE)
        };
    }
}
