//! The shared state behind every address space: the frame pool, its reference counts, and
//! the translation-cache hook.

use alloc::boxed::Box;

use crate::address::AddressTranslator;
use crate::frame_allocator::{AllocError, FrameAllocator};
use crate::ref_table::{FrameKind, FrameRefTable};
use crate::tlb::TlbInvalidator;
use crate::{FrameNumber, PhysicalAddress, VirtualAddress, arch};

/// Tunables for a [`MemoryManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    /// First physical address of the frame pool.
    pub physical_base: PhysicalAddress,
    /// Number of frames in the pool.
    pub frame_count: usize,
    /// Virtual address at which the heap of every new address space starts.
    pub heap_base: VirtualAddress,
    /// Exclusive upper bound of user virtual addresses.
    pub user_limit: VirtualAddress,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            physical_base: PhysicalAddress::new(0x8000_0000),
            frame_count: 1024,
            heap_base: VirtualAddress::new(0x1000),
            // The lower half of the address space, less the top page.
            user_limit: VirtualAddress::new((1 << (arch::MAX_VIRTUAL_BITS - 1)) - arch::PAGE_SIZE),
        }
    }
}

impl MemoryConfig {
    fn validate(&self) {
        assert!(
            self.physical_base.is_aligned(arch::PAGE_SIZE),
            "physical base {} is not page-aligned",
            self.physical_base
        );
        assert!(self.frame_count > 0, "frame pool must not be empty");
        assert!(
            self.heap_base.is_aligned(arch::PAGE_SIZE),
            "heap base {} is not page-aligned",
            self.heap_base
        );
        assert!(
            self.user_limit.is_aligned(arch::PAGE_SIZE),
            "user limit {} is not page-aligned",
            self.user_limit
        );
        assert!(
            self.heap_base < self.user_limit,
            "heap base {} is not below user limit {}",
            self.heap_base,
            self.user_limit
        );
    }
}

/// Physical memory shared by every address space: the frame pool, a reference count per
/// frame, and the TLB invalidation primitive.
///
/// Address spaces hold it behind an `Arc`, so a fork child and its parent always draw from
/// and return to the same pool.
pub struct MemoryManager {
    config: MemoryConfig,
    frames: FrameAllocator,
    refs: FrameRefTable,
    tlb: Box<dyn TlbInvalidator>,
}

impl MemoryManager {
    /// Creates a manager over the frames described by `config`.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid.
    pub fn new(
        config: MemoryConfig,
        translator: AddressTranslator,
        tlb: Box<dyn TlbInvalidator>,
    ) -> Self {
        config.validate();

        let first = config.physical_base.frame_number();
        let manager = Self {
            config,
            frames: FrameAllocator::new(translator, first, config.frame_count),
            refs: FrameRefTable::new(first, config.frame_count),
            tlb,
        };

        log::debug!(
            "memory manager: {} frames at {}, user space {}..{}",
            config.frame_count,
            config.physical_base,
            config.heap_base,
            config.user_limit
        );
        manager
    }

    /// Creates a manager whose frames live in a host buffer.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(config: MemoryConfig) -> Self {
        Self::emulated_with_tlb(config, Box::new(arch::HardwareTlb))
    }

    /// Creates a manager whose frames live in a host buffer, with a custom TLB hook.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated_with_tlb(config: MemoryConfig, tlb: Box<dyn TlbInvalidator>) -> Self {
        config.validate();
        let translator =
            AddressTranslator::emulated(config.physical_base, config.frame_count * arch::PAGE_SIZE);
        Self::new(config, translator, tlb)
    }

    /// Allocates a zeroed frame and records its first reference.
    pub fn allocate_frame(&self, kind: FrameKind) -> Result<FrameNumber, AllocError> {
        let frame = self.frames.allocate()?;
        self.refs.claim(frame, kind);
        Ok(frame)
    }

    /// Drops one reference to a frame, returning it to the pool when none remain.
    ///
    /// Returns true if the frame was freed.
    pub fn release_frame(&self, frame: FrameNumber) -> bool {
        if self.refs.decrement(frame) > 0 {
            return false;
        }
        self.frames.free(frame, &self.refs);
        true
    }

    /// Returns the number of free frames in the pool.
    pub fn free_frames(&self) -> usize {
        self.frames.free_count()
    }

    /// Returns the manager's configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the frame pool.
    pub fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    /// Returns the per-frame reference counts.
    pub fn refs(&self) -> &FrameRefTable {
        &self.refs
    }

    /// Returns the TLB invalidation hook.
    pub fn tlb(&self) -> &dyn TlbInvalidator {
        self.tlb.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> MemoryConfig {
        MemoryConfig {
            frame_count: 8,
            ..MemoryConfig::default()
        }
    }

    #[test]
    fn default_user_limit_is_canonical_and_aligned() {
        let config = MemoryConfig::default();
        assert!(config.user_limit.is_aligned(arch::PAGE_SIZE));
        assert!(config.heap_base < config.user_limit);
    }

    #[test]
    fn allocate_claims_one_reference() {
        let mm = MemoryManager::emulated(small());
        let frame = mm.allocate_frame(FrameKind::Data).unwrap();
        assert_eq!(mm.refs().count(frame), 1);
        assert_eq!(mm.free_frames(), 7);
    }

    #[test]
    fn release_frees_only_at_zero() {
        let mm = MemoryManager::emulated(small());
        let frame = mm.allocate_frame(FrameKind::Data).unwrap();
        mm.refs().increment(frame);

        assert!(!mm.release_frame(frame));
        assert_eq!(mm.free_frames(), 7);
        assert!(mm.release_frame(frame));
        assert_eq!(mm.free_frames(), 8);
    }

    #[test]
    fn exhausted_pool_reports_out_of_memory() {
        let mm = MemoryManager::emulated(MemoryConfig {
            frame_count: 1,
            ..MemoryConfig::default()
        });
        mm.allocate_frame(FrameKind::Data).unwrap();
        assert_eq!(mm.allocate_frame(FrameKind::Data), Err(AllocError::OutOfMemory));
    }

    #[test]
    #[should_panic(expected = "not page-aligned")]
    fn misaligned_base_is_rejected() {
        MemoryManager::emulated(MemoryConfig {
            physical_base: PhysicalAddress::new(0x8000_0010),
            ..small()
        });
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn releasing_an_unreferenced_frame_is_fatal() {
        let mm = MemoryManager::emulated(small());
        let frame = mm.allocate_frame(FrameKind::Data).unwrap();
        mm.release_frame(frame);
        mm.release_frame(frame);
    }
}
