//! End-to-end checks of fork, copy-on-write and protection through the system call layer,
//! with the emulated MMU standing in for user code.

use alloc::sync::Arc;
use alloc::vec::Vec;
use std::collections::HashMap;
use std::thread;

use crate::syscall::*;
use crate::tlb::RecordingTlb;
use crate::{
    AddressSpace, FaultCause, FrameNumber, MemoryConfig, MemoryManager, PAGE_SIZE, PageFlags,
    SegmentationFault, VirtualAddress, fork_address_space,
};

fn memory(frames: usize) -> Arc<MemoryManager> {
    Arc::new(MemoryManager::emulated(MemoryConfig {
        frame_count: frames,
        ..MemoryConfig::default()
    }))
}

fn process(frames: usize) -> AddressSpace {
    AddressSpace::new(memory(frames)).unwrap()
}

fn va(addr: usize) -> VirtualAddress {
    VirtualAddress::new(addr)
}

fn flags(space: &AddressSpace, addr: usize) -> PageFlags {
    PageFlags::from_raw(sys_pteflags(space, addr))
}

/// Allocates heap memory the way user code does and returns its start.
fn sbrk(space: &AddressSpace, bytes: usize) -> usize {
    let start = sys_sbrk(space, bytes as isize);
    assert_ne!(start, usize::MAX, "sbrk({}) failed", bytes);
    start
}

/// Runs `f` in a forked child, which is then killed or exits, and reports whether it
/// completed without a segmentation fault.
fn in_child(
    parent: &AddressSpace,
    f: impl FnOnce(&AddressSpace) -> Result<(), SegmentationFault>,
) -> bool {
    let child = fork_address_space(parent).unwrap();
    let outcome = f(&child);
    child.destroy();
    outcome.is_ok()
}

fn read_ok(parent: &AddressSpace, addr: usize) -> bool {
    in_child(parent, |child| child.read_byte(va(addr)).map(drop))
}

fn write_ok(parent: &AddressSpace, addr: usize) -> bool {
    in_child(parent, |child| {
        let value = child.read_byte(va(addr)).unwrap_or(0);
        child.write_byte(va(addr), value ^ 1)
    })
}

fn exec_ok(parent: &AddressSpace, addr: usize) -> bool {
    in_child(parent, |child| child.fetch_instruction(va(addr)).map(drop))
}

/// Returns the total number of mappings across `spaces`.
fn live_mappings(spaces: &[&AddressSpace]) -> usize {
    spaces.iter().map(|space| space.mapped_pages()).sum()
}

/// Checks the copy-on-write bookkeeping of `spaces`, which must be every live address
/// space of one memory manager.
///
/// Every frame's count equals the number of mappings to it. A copy-on-write entry is never
/// writable. Its frame may have a count of one once every sibling is gone, in which case
/// the next write upgrades it in place.
fn assert_cow_bookkeeping(spaces: &[&AddressSpace]) {
    let mm = spaces[0].memory();
    let mut holders: HashMap<FrameNumber, usize> = HashMap::new();
    for space in spaces {
        space.lock().directory.for_each_leaf(mm, |_, entry| {
            if let Some(phys) = entry.address() {
                *holders.entry(phys.frame_number()).or_default() += 1;
            }
        });
    }

    for space in spaces {
        space.lock().directory.for_each_leaf(mm, |page, entry| {
            let Some(frame) = entry.address().map(|phys| phys.frame_number()) else {
                return;
            };
            let flags = entry.flags();
            let count = mm.refs().count(frame);
            assert_eq!(count, holders[&frame], "{} maps {:?}", page, frame);
            if flags.is_cow() {
                assert!(!flags.is_writable(), "{} is writable and copy-on-write", page);
                assert!(count >= 1, "{} is copy-on-write on a free frame", page);
            }
        });
    }
}

mod scenario {
    use super::*;

    #[test]
    fn a_cow_self_check() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let start = sys_freepages(&mm);

        let p = sbrk(&parent, PAGE_SIZE);
        parent.write_byte(va(p), b'A').unwrap();
        let pa_parent = sys_ptepa(&parent, p);
        assert!(flags(&parent, p).is_writable());
        assert!(!flags(&parent, p).is_cow());

        let child = fork_address_space(&parent).unwrap();

        assert_eq!(sys_ptepa(&child, p), pa_parent);
        assert!(!flags(&child, p).is_writable());
        assert!(flags(&child, p).is_cow());

        child.write_byte(va(p), b'C').unwrap();

        assert_ne!(sys_ptepa(&child, p), pa_parent);
        assert!(flags(&child, p).is_writable());
        assert!(!flags(&child, p).is_cow());
        assert_eq!(sys_ptepa(&parent, p), pa_parent);
        assert_eq!(parent.read_byte(va(p)), Ok(b'A'));

        child.destroy();

        let free = sys_freepages(&mm);
        parent.write_byte(va(p), b'P').unwrap();

        assert_eq!(sys_ptepa(&parent, p), pa_parent);
        assert!(flags(&parent, p).is_writable());
        assert!(!flags(&parent, p).is_cow());
        assert_eq!(sys_freepages(&mm), free);

        parent.destroy();
        assert_eq!(sys_freepages(&mm), start + 1);
    }

    #[test]
    fn b_read_only_misaligned_range() {
        let space = process(64);
        let data = sbrk(&space, 3 * PAGE_SIZE);
        space.write_bytes(va(data), &[b'A'; 3 * PAGE_SIZE]).unwrap();
        let mid = data + 500;

        assert_eq!(sys_mprotect(&space, mid, 5000, PROT_READ), 0);

        for addr in [data, mid, data + PAGE_SIZE, data + 2 * PAGE_SIZE - 1] {
            assert!(read_ok(&space, addr), "read at {:#x}", addr);
            assert!(!write_ok(&space, addr), "write at {:#x}", addr);
        }
        // The third page lies outside the normalized range.
        assert!(write_ok(&space, data + 2 * PAGE_SIZE));

        let fault = space.write_byte(va(mid), 0).unwrap_err();
        assert_eq!(fault.cause, FaultCause::AccessDenied);
        assert_eq!(space.read_byte(va(mid)), Ok(b'A'));
    }

    #[test]
    fn c_none_then_read_write() {
        let space = process(64);
        let data = sbrk(&space, 2 * PAGE_SIZE);
        let mid = data + 500;
        let before = sys_ptepa(&space, mid);

        assert_eq!(sys_mprotect(&space, mid, 5000, PROT_NONE), 0);
        assert!(!read_ok(&space, mid));
        assert!(!write_ok(&space, mid));
        assert_eq!(flags(&space, mid), PageFlags::user(crate::Protection::NONE));

        assert_eq!(sys_mprotect(&space, mid, 5000, PROT_READ | PROT_WRITE), 0);
        assert!(read_ok(&space, mid));
        assert!(write_ok(&space, mid));
        space.write_byte(va(mid), 1).unwrap();
        assert_eq!(sys_ptepa(&space, mid), before);
    }

    #[test]
    fn d_exec_stub() {
        let space = process(64);
        let stub = sbrk(&space, PAGE_SIZE);
        space.write_bytes(va(stub), &0x0000_8067u32.to_le_bytes()).unwrap();

        assert_eq!(sys_mprotect(&space, stub, PAGE_SIZE, PROT_NONE), 0);
        assert!(!exec_ok(&space, stub));

        assert_eq!(sys_mprotect(&space, stub, PAGE_SIZE, PROT_EXEC), 0);
        assert!(exec_ok(&space, stub));
        assert!(!read_ok(&space, stub));
        assert_eq!(space.fetch_instruction(va(stub)), Ok(0x0000_8067));

        assert_eq!(sys_mprotect(&space, stub, PAGE_SIZE, PROT_READ), 0);
        assert!(read_ok(&space, stub));
        assert!(!exec_ok(&space, stub));

        assert_eq!(sys_mprotect(&space, stub, PAGE_SIZE, PROT_READ | PROT_EXEC), 0);
        assert!(exec_ok(&space, stub));
        assert!(read_ok(&space, stub));
    }
}

mod property {
    use super::*;

    #[test]
    fn p1_fork_shares_frames() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, 2 * PAGE_SIZE);
        let counts: Vec<_> = [data, data + PAGE_SIZE]
            .iter()
            .map(|&addr| {
                let frame = parent.pte_physical(va(addr)).unwrap().frame_number();
                mm.refs().count(frame)
            })
            .collect();

        let child = fork_address_space(&parent).unwrap();

        for (i, addr) in [data, data + PAGE_SIZE].into_iter().enumerate() {
            let phys = sys_ptepa(&parent, addr);
            assert_eq!(sys_ptepa(&child, addr), phys);
            let frame = parent.pte_physical(va(addr)).unwrap().frame_number();
            assert_eq!(mm.refs().count(frame), counts[i] + 1);
        }
    }

    #[test]
    fn p2_parent_is_downgraded_retroactively() {
        let parent = process(64);
        let data = sbrk(&parent, PAGE_SIZE);
        let _child = fork_address_space(&parent).unwrap();

        assert!(!flags(&parent, data).is_writable());
        assert!(flags(&parent, data).is_cow());
        // The parent's write now traps, and is resolved rather than denied.
        assert_eq!(parent.write_byte(va(data), 1), Ok(()));
    }

    #[test]
    fn p3_writer_gets_private_copy() {
        let parent = process(64);
        let data = sbrk(&parent, PAGE_SIZE);
        let child = fork_address_space(&parent).unwrap();
        let shared = sys_ptepa(&parent, data);
        let parent_flags = flags(&parent, data);

        parent.write_byte(va(data), 5).unwrap();

        assert_ne!(sys_ptepa(&parent, data), shared);
        assert_eq!(sys_ptepa(&child, data), shared);
        assert_eq!(flags(&child, data), parent_flags);
        assert_eq!(child.read_byte(va(data)), Ok(0));
    }

    #[test]
    fn p4_last_reference_is_upgraded_without_allocation() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, PAGE_SIZE);
        let child = fork_address_space(&parent).unwrap();
        let shared = sys_ptepa(&parent, data);

        child.write_byte(va(data), 1).unwrap();
        let free = sys_freepages(&mm);
        parent.write_byte(va(data), 2).unwrap();

        assert_eq!(sys_freepages(&mm), free);
        assert_eq!(sys_ptepa(&parent, data), shared);
        assert!(flags(&parent, data).is_writable());
    }

    #[test]
    fn p5_denied_access_does_not_corrupt_memory() {
        let space = process(64);
        let data = sbrk(&space, 2 * PAGE_SIZE);
        space.write_bytes(va(data), b"guarded").unwrap();
        space.write_bytes(va(data + PAGE_SIZE), b"neighbour").unwrap();
        assert_eq!(sys_mprotect(&space, data, PAGE_SIZE, PROT_READ), 0);

        assert!(space.write_bytes(va(data), b"smashed").is_err());
        assert!(space.write_bytes(va(data + PAGE_SIZE), b"NEIGHBOUR").is_ok());

        let mut buf = [0; 7];
        space.read_bytes(va(data), &mut buf).unwrap();
        assert_eq!(&buf, b"guarded");
    }

    #[test]
    fn p6_byte_range_equals_covering_page_range() {
        let misaligned = process(64);
        let aligned = process(64);
        let data = sbrk(&misaligned, 4 * PAGE_SIZE);
        sbrk(&aligned, 4 * PAGE_SIZE);

        assert_eq!(sys_mprotect(&misaligned, data + PAGE_SIZE - 1, 2, PROT_EXEC), 0);
        assert_eq!(sys_mprotect(&aligned, data, 2 * PAGE_SIZE, PROT_EXEC), 0);

        for page in 0..4 {
            let addr = data + page * PAGE_SIZE;
            assert_eq!(flags(&misaligned, addr), flags(&aligned, addr), "page {}", page);
        }
    }

    #[test]
    fn p7_reference_counts_are_conserved() {
        let mm = memory(128);
        let total = mm.free_frames();

        let parent = AddressSpace::new(mm.clone()).unwrap();
        let data = sbrk(&parent, 4 * PAGE_SIZE);
        let first = fork_address_space(&parent).unwrap();
        first.write_byte(va(data), 1).unwrap();
        let second = fork_address_space(&first).unwrap();
        second.write_byte(va(data + PAGE_SIZE), 2).unwrap();
        parent.write_byte(va(data + 2 * PAGE_SIZE), 3).unwrap();
        assert_eq!(
            mm.refs().data_references(),
            live_mappings(&[&parent, &first, &second])
        );

        sys_sbrk(&first, -(2 * PAGE_SIZE as isize));
        assert_eq!(
            mm.refs().data_references(),
            live_mappings(&[&parent, &first, &second])
        );

        first.destroy();
        assert_eq!(mm.refs().data_references(), live_mappings(&[&parent, &second]));

        parent.destroy();
        assert_eq!(mm.refs().data_references(), live_mappings(&[&second]));

        second.destroy();
        assert_eq!(mm.refs().data_references(), 0);
        assert_eq!(mm.free_frames(), total);
    }
}

mod policy {
    use super::*;

    #[test]
    fn write_grant_on_shared_frame_does_not_privatize() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, PAGE_SIZE);
        let child = fork_address_space(&parent).unwrap();
        let shared = sys_ptepa(&parent, data);

        assert_eq!(sys_mprotect(&child, data, PAGE_SIZE, PROT_READ | PROT_WRITE), 0);

        let child_flags = flags(&child, data);
        assert!(child_flags.is_writable());
        assert!(!child_flags.is_cow());
        assert_eq!(sys_ptepa(&child, data), shared);
        assert_eq!(mm.refs().count(parent.pte_physical(va(data)).unwrap().frame_number()), 2);

        // The child writes straight into the shared frame, and the parent sees it.
        child.write_byte(va(data), 0x5a).unwrap();
        assert_eq!(sys_ptepa(&child, data), shared);
        assert_eq!(parent.read_byte(va(data)), Ok(0x5a));

        // The parent keeps its copy-on-write marker and still privatizes on write.
        assert!(flags(&parent, data).is_cow());
        parent.write_byte(va(data), 0).unwrap();
        assert_ne!(sys_ptepa(&parent, data), shared);
        assert_eq!(child.read_byte(va(data)), Ok(0x5a));
    }

    #[test]
    fn withholding_write_clears_pending_cow() {
        let parent = process(64);
        let data = sbrk(&parent, PAGE_SIZE);
        let child = fork_address_space(&parent).unwrap();

        assert_eq!(sys_mprotect(&child, data, PAGE_SIZE, PROT_READ), 0);

        assert!(!flags(&child, data).is_cow());
        let fault = child.write_byte(va(data), 1).unwrap_err();
        assert_eq!(fault.cause, FaultCause::AccessDenied);
    }

    #[test]
    fn protection_change_invalidates_the_tlb() {
        let tlb = Arc::new(RecordingTlb::new());
        let mm = Arc::new(MemoryManager::emulated_with_tlb(
            MemoryConfig::default(),
            alloc::boxed::Box::new(tlb.clone()),
        ));
        let parent = AddressSpace::new(mm).unwrap();
        let data = sbrk(&parent, 2 * PAGE_SIZE);
        tlb.take();

        let _child = fork_address_space(&parent).unwrap();
        assert_eq!(tlb.take(), vec![va(data), va(data + PAGE_SIZE)]);

        parent.write_byte(va(data), 1).unwrap();
        assert_eq!(tlb.take(), vec![va(data)]);

        assert_eq!(sys_mprotect(&parent, data + 10, 1, PROT_READ), 0);
        assert_eq!(tlb.take(), vec![va(data)]);
    }
}

mod concurrency {
    use super::*;

    #[test]
    fn siblings_privatize_in_parallel() {
        let parent = process(256);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, 4 * PAGE_SIZE);
        parent.write_bytes(va(data), &[7; 4 * PAGE_SIZE]).unwrap();
        let children: Vec<_> = (0..4)
            .map(|_| fork_address_space(&parent).unwrap())
            .collect();

        thread::scope(|scope| {
            for (i, child) in children.iter().enumerate() {
                scope.spawn(move || {
                    for page in 0..4 {
                        child.write_byte(va(data + page * PAGE_SIZE), i as u8).unwrap();
                    }
                });
            }
        });

        for (i, child) in children.iter().enumerate() {
            for page in 0..4 {
                let addr = data + page * PAGE_SIZE;
                assert_eq!(child.read_byte(va(addr)), Ok(i as u8));
                assert_eq!(child.read_byte(va(addr + 1)), Ok(7));
            }
        }
        for page in 0..4 {
            let frame = parent.pte_physical(va(data + page * PAGE_SIZE)).unwrap().frame_number();
            assert_eq!(mm.refs().count(frame), 1);
        }

        let mut spaces: Vec<&AddressSpace> = children.iter().collect();
        spaces.push(&parent);
        assert_eq!(mm.refs().data_references(), live_mappings(&spaces));
    }

    #[test]
    fn threads_sharing_one_space_privatize_once() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, PAGE_SIZE);
        let child = Arc::new(fork_address_space(&parent).unwrap());
        let free = mm.free_frames();

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let child = child.clone();
                thread::spawn(move || child.write_byte(va(data + i), i as u8 + 1))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(mm.free_frames(), free - 1);
        let mut buf = [0; 4];
        child.read_bytes(va(data), &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(parent.read_byte(va(data)), Ok(0));
    }
}

mod invariant {
    use super::*;

    #[test]
    fn bookkeeping_holds_through_fork_write_and_teardown() {
        let parent = process(128);
        let data = sbrk(&parent, 3 * PAGE_SIZE);
        parent.write_bytes(va(data), &[1; 3 * PAGE_SIZE]).unwrap();

        let first = fork_address_space(&parent).unwrap();
        assert_cow_bookkeeping(&[&parent, &first]);

        let second = fork_address_space(&first).unwrap();
        second.write_byte(va(data), 2).unwrap();
        assert_eq!(sys_mprotect(&first, data + PAGE_SIZE, PAGE_SIZE, PROT_READ | PROT_WRITE), 0);
        assert_cow_bookkeeping(&[&parent, &first, &second]);

        first.destroy();
        second.destroy();
        assert_cow_bookkeeping(&[&parent]);
    }

    #[test]
    fn sibling_teardown_leaves_cow_pending_until_next_write() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, PAGE_SIZE);
        let child = fork_address_space(&parent).unwrap();
        let shared = sys_ptepa(&parent, data);

        child.destroy();

        let frame = parent.pte_physical(va(data)).unwrap().frame_number();
        assert_eq!(mm.refs().count(frame), 1);
        assert!(flags(&parent, data).is_cow());
        assert!(!flags(&parent, data).is_writable());
        assert_cow_bookkeeping(&[&parent]);

        let free = sys_freepages(&mm);
        parent.write_byte(va(data), 9).unwrap();

        assert_eq!(sys_freepages(&mm), free);
        assert_eq!(sys_ptepa(&parent, data), shared);
        assert!(!flags(&parent, data).is_cow());
        assert!(flags(&parent, data).is_writable());
        assert_cow_bookkeeping(&[&parent]);
    }

    #[test]
    fn inaccessible_page_is_shared_and_released_like_any_other() {
        let parent = process(64);
        let mm = parent.memory().clone();
        let data = sbrk(&parent, 2 * PAGE_SIZE);
        parent.write_byte(va(data), 0x42).unwrap();
        assert_eq!(sys_mprotect(&parent, data, PAGE_SIZE, PROT_NONE), 0);
        assert!(!flags(&parent, data).is_accessible());

        let child = fork_address_space(&parent).unwrap();
        let frame = parent.pte_physical(va(data)).unwrap().frame_number();
        assert_eq!(sys_ptepa(&child, data), sys_ptepa(&parent, data));
        assert_eq!(mm.refs().count(frame), 2);
        assert!(!flags(&child, data).is_cow());
        assert_eq!(
            child.read_byte(va(data)).unwrap_err().cause,
            FaultCause::AccessDenied
        );
        assert_cow_bookkeeping(&[&parent, &child]);

        child.destroy();
        assert_eq!(mm.refs().count(frame), 1);

        assert_eq!(sys_mprotect(&parent, data, PAGE_SIZE, PROT_READ | PROT_WRITE), 0);
        assert_eq!(parent.read_byte(va(data)), Ok(0x42));
        assert_eq!(mm.refs().data_references(), live_mappings(&[&parent]));
    }
}
