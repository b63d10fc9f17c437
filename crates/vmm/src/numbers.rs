//! Page and frame number types for memory management.
//!
//! This module provides newtypes for physical frame numbers and virtual page numbers,
//! which are used throughout the memory management subsystem, and the page-granular
//! range every byte-range request is normalized to.

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};
use core::{
    fmt,
    ops::{Add, Sub},
};

/// Macro to define common page/frame number functionality.
///
/// This macro generates the basic structure and methods common to both frame
/// and page number types, reducing code duplication.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Represents a physical memory frame, which is the physical memory equivalent of a page.\n\
     Frame numbers are zero-indexed and correspond to PAGE_SIZE-aligned physical addresses."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Represents a virtual memory page. Page numbers are zero-indexed and correspond to\n\
     PAGE_SIZE-aligned virtual addresses."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}

/// A half-open range of whole virtual pages, `[start, end)`.
///
/// Protection and copy-on-write operate at page granularity only, so every byte range
/// handed in by a caller is widened to the pages it touches before anything acts on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRange {
    start: PageNumber,
    end: PageNumber,
}

impl PageRange {
    /// Creates a range from explicit page bounds.
    ///
    /// # Panics
    ///
    /// Panics if `end` precedes `start`.
    pub fn new(start: PageNumber, end: PageNumber) -> Self {
        assert!(start <= end, "page range end precedes start");
        Self { start, end }
    }

    /// Returns the minimal page range covering every byte of `[start, start + length)`.
    ///
    /// A page is included if any of its bytes overlaps the byte range. A zero-length
    /// request covers no pages. Returns `None` if the byte range overflows the address
    /// space or ends at a non-canonical address.
    pub fn covering(start: VirtualAddress, length: usize) -> Option<Self> {
        let first = start.page_number();
        if length == 0 {
            return Some(Self::new(first, first));
        }
        let last_byte = start.as_usize().checked_add(length - 1)?;
        let last = VirtualAddress::try_new(last_byte)?.page_number();
        Some(Self::new(first, last + 1))
    }

    /// Returns the first page in the range.
    pub const fn start(&self) -> PageNumber {
        self.start
    }

    /// Returns the page after the last page in the range.
    pub const fn end(&self) -> PageNumber {
        self.end
    }

    /// Returns the number of pages in the range.
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    /// Returns true if the range covers no pages.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Returns true if the page lies within the range.
    pub fn contains(&self, page: PageNumber) -> bool {
        self.start <= page && page < self.end
    }

    /// Iterates over the pages in the range in ascending order.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> + use<> {
        (self.start.as_usize()..self.end.as_usize()).map(PageNumber::new)
    }
}
