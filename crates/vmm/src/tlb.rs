//! Translation lookaside buffer invalidation.

use alloc::sync::Arc;

use crate::{PageRange, VirtualAddress};

/// Drops cached translations after a page-table entry changes.
///
/// Every operation that downgrades, repoints or removes a mapping calls through this trait
/// before it returns. Cross-core shootdown is the implementation's business.
pub trait TlbInvalidator: Send + Sync {
    /// Invalidates the cached translation of a single page.
    fn invalidate(&self, page: VirtualAddress);

    /// Invalidates the cached translations of every page in `range`.
    fn invalidate_range(&self, range: PageRange) {
        for page in range.pages() {
            self.invalidate(page.start());
        }
    }
}

impl<T: TlbInvalidator + ?Sized> TlbInvalidator for Arc<T> {
    fn invalidate(&self, page: VirtualAddress) {
        (**self).invalidate(page)
    }

    fn invalidate_range(&self, range: PageRange) {
        (**self).invalidate_range(range)
    }
}

/// Records every invalidated page so tests can assert on it.
#[cfg(any(test, feature = "software-emulation"))]
#[derive(Debug, Default)]
pub struct RecordingTlb {
    pages: spin::Mutex<alloc::vec::Vec<VirtualAddress>>,
}

#[cfg(any(test, feature = "software-emulation"))]
impl RecordingTlb {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns and forgets every page invalidated so far, in order.
    pub fn take(&self) -> alloc::vec::Vec<VirtualAddress> {
        core::mem::take(&mut *self.pages.lock())
    }

    /// Returns whether `page` has been invalidated since the last `take`.
    pub fn contains(&self, page: VirtualAddress) -> bool {
        self.pages.lock().contains(&page)
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl TlbInvalidator for RecordingTlb {
    fn invalidate(&self, page: VirtualAddress) {
        self.pages.lock().push(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PageNumber;

    #[test]
    fn range_invalidates_each_page() {
        let tlb = RecordingTlb::new();
        tlb.invalidate_range(PageRange::new(PageNumber::new(2), PageNumber::new(4)));
        assert_eq!(
            tlb.take(),
            vec![VirtualAddress::new(0x2000), VirtualAddress::new(0x3000)]
        );
        assert!(tlb.take().is_empty());
    }

    #[test]
    fn shared_recorder_sees_invalidations() {
        let tlb = Arc::new(RecordingTlb::new());
        let boxed: alloc::boxed::Box<dyn TlbInvalidator> = alloc::boxed::Box::new(tlb.clone());
        boxed.invalidate(VirtualAddress::new(0x5000));
        assert!(tlb.contains(VirtualAddress::new(0x5000)));
    }
}
