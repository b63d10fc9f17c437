//! A software model of user memory accesses.
//!
//! Each access checks the translating entry the way the hardware would: the page must be
//! present, user-accessible and grant the access kind. A failed check traps into the fault
//! handler and the access is retried once. The address-space lock is held from the first
//! check to the retry, so concurrent faults on one address space serialize.

use crate::address_space::{AddressSpace, AddressSpaceInner};
use crate::fault::{AccessKind, FaultCause, SegmentationFault, handle_locked};
use crate::memory_manager::MemoryManager;
use crate::page_directory::PageDirectory;
use crate::VirtualAddress;

/// Returns a pointer to the byte at `address` if the current entry permits `access`.
fn permitted(
    mm: &MemoryManager,
    directory: &PageDirectory,
    address: VirtualAddress,
    access: AccessKind,
) -> Option<*mut u8> {
    let entry = directory.lookup(mm, address)?;
    if !entry.flags().permits(access) {
        return None;
    }
    let frame = entry.address()?.frame_number();
    // SAFETY: The page offset is below the page size, so the pointer stays in the frame.
    Some(unsafe { mm.frames().frame_ptr(frame).add(address.page_offset()) })
}

impl AddressSpace {
    fn access(
        &self,
        inner: &mut AddressSpaceInner,
        address: VirtualAddress,
        access: AccessKind,
    ) -> Result<*mut u8, SegmentationFault> {
        let mm = self.memory();
        if let Some(ptr) = permitted(mm, &inner.directory, address, access) {
            return Ok(ptr);
        }

        let resolution = handle_locked(mm, &mut inner.directory, address, access)?;
        match permitted(mm, &inner.directory, address, access) {
            Some(ptr) => Ok(ptr),
            None => panic!(
                "{} at {} still faults after {:?}",
                access, address, resolution
            ),
        }
    }

    /// Reads one byte as user code would.
    pub fn read_byte(&self, address: VirtualAddress) -> Result<u8, SegmentationFault> {
        let mut inner = self.lock();
        let ptr = self.access(&mut inner, address, AccessKind::Read)?;
        // SAFETY: The pointer addresses a byte of a frame this address space maps.
        Ok(unsafe { ptr.read() })
    }

    /// Writes one byte as user code would, taking a private copy of a shared page first.
    pub fn write_byte(&self, address: VirtualAddress, value: u8) -> Result<(), SegmentationFault> {
        let mut inner = self.lock();
        let ptr = self.access(&mut inner, address, AccessKind::Write)?;
        // SAFETY: As in `read_byte`. The page is now private or deliberately shared writable.
        unsafe { ptr.write(value) };
        Ok(())
    }

    /// Fetches the 32-bit little-endian instruction word at `address`.
    ///
    /// A fetch that is not 4-byte aligned faults without consulting the page tables.
    pub fn fetch_instruction(&self, address: VirtualAddress) -> Result<u32, SegmentationFault> {
        if !address.is_aligned(4) {
            let fault = SegmentationFault {
                address,
                access: AccessKind::Execute,
                cause: FaultCause::Misaligned,
            };
            log::warn!("{}", fault);
            return Err(fault);
        }
        let mut inner = self.lock();
        let ptr = self.access(&mut inner, address, AccessKind::Execute)?;
        // SAFETY: An aligned word never crosses a page boundary.
        let bytes = unsafe { ptr.cast::<[u8; 4]>().read() };
        Ok(u32::from_le_bytes(bytes))
    }

    /// Reads `buf.len()` bytes starting at `address`, stopping at the first fault.
    pub fn read_bytes(&self, address: VirtualAddress, buf: &mut [u8]) -> Result<(), SegmentationFault> {
        for (offset, byte) in buf.iter_mut().enumerate() {
            *byte = self.read_byte(address + offset)?;
        }
        Ok(())
    }

    /// Writes `data` starting at `address`, stopping at the first fault.
    pub fn write_bytes(&self, address: VirtualAddress, data: &[u8]) -> Result<(), SegmentationFault> {
        for (offset, &byte) in data.iter().enumerate() {
            self.write_byte(address + offset, byte)?;
        }
        Ok(())
    }
}
