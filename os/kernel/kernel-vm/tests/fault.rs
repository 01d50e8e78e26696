mod common;

use common::{BASE, MemFile, PAGE, fixture, pattern};
use kernel_info::ids::Pid;
use kernel_info::memory::PAGE_SIZE;
use kernel_vm::{Access, FaultKind, IoError, Protection, VirtualAddress, VmError};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn first_touch_of_anonymous_memory_reads_zero() {
    let fx = fixture();
    let (vas, view, pset) = fx.anon(1, 4, Protection::READ_WRITE);

    let data = fx.read_vec(vas, BASE + PAGE, PAGE_SIZE);
    assert!(data.iter().all(|&b| b == 0));

    let info = fx.vm.slot_info(pset, 1).unwrap();
    assert!(info.flags.valid());
    assert!(!info.flags.modified());
    assert_eq!(info.refs, 1);
    assert_eq!(info.attached, 1);
    assert!(!info.cached);
    let (pfn, writable) = fx.hat.translation(view, BASE + PAGE).unwrap();
    assert_eq!(Some(pfn), info.pfn);
    assert!(!writable, "read faults map read-only");

    // Untouched slots stay empty.
    assert!(!fx.vm.slot_info(pset, 0).unwrap().flags.valid());
}

#[test]
fn write_round_trip_marks_the_slot_modified() {
    let fx = fixture();
    let (vas, view, pset) = fx.anon(1, 2, Protection::READ_WRITE);
    let data = pattern(7, 100);

    // Straddle the page boundary.
    let at = BASE + (PAGE - 50);
    fx.vm.write(vas, at, &data).unwrap();
    assert_eq!(fx.read_vec(vas, at, data.len()), data);

    for index in 0..2 {
        let info = fx.vm.slot_info(pset, index).unwrap();
        assert!(info.flags.modified());
        assert!(info.flags.referenced());
    }
    assert!(fx.hat.translation(view, BASE).unwrap().1);
}

#[test]
fn read_fault_keeps_a_writable_translation() {
    let fx = fixture();
    let (vas, view, _) = fx.anon(1, 1, Protection::READ_WRITE);
    let pfn = fx.vm.fault(vas, BASE, Access::Write).unwrap();
    assert_eq!(fx.hat.translation(view, BASE), Some((pfn, true)));

    assert_eq!(fx.vm.fault(vas, BASE + 8, Access::Read), Ok(pfn));
    assert_eq!(fx.hat.translation(view, BASE), Some((pfn, true)));
}

#[test]
fn writing_a_read_only_view_is_a_protection_fault() {
    let fx = fixture();
    let (vas, _, _) = fx.anon(1, 1, Protection::READ);
    assert_eq!(
        fx.vm.write(vas, BASE, b"x"),
        Err(VmError::Fault(FaultKind::Protection))
    );
    assert_eq!(fx.vm.fault(vas, BASE, Access::Read).map(|_| ()), Ok(()));
}

#[test]
fn unmapped_address_faults() {
    let fx = fixture();
    let (vas, _, _) = fx.anon(1, 1, Protection::READ_WRITE);
    let outside = BASE + PAGE;
    assert_eq!(
        fx.vm.fault(vas, outside, Access::Read),
        Err(VmError::Fault(FaultKind::Unmapped))
    );
}

#[test]
fn overlapping_and_unaligned_attach_are_rejected() {
    let fx = fixture();
    let (vas, _, _) = fx.anon(1, 4, Protection::READ_WRITE);
    let pset = fx.vm.create_zero_fill(2).unwrap();

    let overlap = fx
        .vm
        .attach(vas, pset, BASE + 3 * PAGE, 0, 2, Protection::READ);
    assert_eq!(overlap, Err(VmError::InvalidArgument));
    let unaligned = fx
        .vm
        .attach(vas, pset, VirtualAddress::new(0x8000_0010), 0, 1, Protection::READ);
    assert_eq!(unaligned, Err(VmError::InvalidArgument));
    let too_long = fx
        .vm
        .attach(vas, pset, VirtualAddress::new(0x8000_0000), 1, 2, Protection::READ);
    assert_eq!(too_long, Err(VmError::InvalidArgument));

    fx.vm.release_pset(pset).unwrap();
    assert!(fx.vm.pset(pset).is_err());
}

#[test]
fn file_pages_hold_a_cache_reference() {
    let fx = fixture();
    let content = pattern(3, 2 * PAGE_SIZE);
    let file = MemFile::new(content.clone());
    let (vas, view, pset) = fx.mapped_file(1, &file, 2);

    assert_eq!(fx.read_vec(vas, BASE + PAGE, PAGE_SIZE), content[PAGE_SIZE..]);

    let info = fx.vm.slot_info(pset, 1).unwrap();
    assert_eq!(info.refs, 2);
    assert_eq!(info.attached, 2);
    assert_eq!(info.mappings, 1);
    assert!(info.cached);

    fx.vm.detach(view).unwrap();
    assert!(fx.vm.pset(pset).is_err(), "last view held the last reference");
    assert_eq!(file.open_handles(), 0);
}

#[test]
fn file_views_cannot_be_writable() {
    let fx = fixture();
    let file = MemFile::new(pattern(1, PAGE_SIZE));
    let vas = fx.vm.create_vas(Pid(1));
    let pset = fx.vm.create_file(file.connect(), 0, 1).unwrap();
    assert_eq!(
        fx.vm.attach(vas, pset, BASE, 0, 1, Protection::READ_WRITE),
        Err(VmError::Permission)
    );
    fx.vm.release_pset(pset).unwrap();
    assert_eq!(file.open_handles(), 0);
}

#[test]
fn invalid_file_page_set_closes_the_connection() {
    let fx = fixture();
    let file = MemFile::new(Vec::new());
    assert_eq!(
        fx.vm.create_file(file.connect(), 12, 1),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(fx.vm.create_file(file.connect(), 0, 0), Err(VmError::InvalidArgument));
    assert_eq!(file.open_handles(), 0);
}

#[test]
fn failed_fill_can_be_retried() {
    let fx = fixture();
    let content = pattern(9, PAGE_SIZE);
    let file = MemFile::new(content.clone());
    let (vas, _, pset) = fx.mapped_file(1, &file, 1);
    let free = fx.vm.frames().free_count();

    file.fail_reads.store(1, std::sync::atomic::Ordering::SeqCst);
    assert_eq!(
        fx.vm.fault(vas, BASE, Access::Read),
        Err(VmError::Fault(FaultKind::Io(IoError::Failed)))
    );
    let info = fx.vm.slot_info(pset, 0).unwrap();
    assert!(!info.flags.valid());
    assert!(!info.flags.bad());
    assert!(!info.flags.in_transit());
    assert_eq!(fx.vm.frames().free_count(), free, "failed fill leaked its frame");

    assert_eq!(fx.read_vec(vas, BASE, PAGE_SIZE), content);
    assert_eq!(file.reads(), 2);
}

#[test]
fn short_file_fails_the_fill() {
    let fx = fixture();
    let file = MemFile::new(pattern(2, PAGE_SIZE + 10));
    let (vas, _, _) = fx.mapped_file(1, &file, 2);

    assert!(fx.vm.fault(vas, BASE, Access::Read).is_ok());
    assert_eq!(
        fx.vm.fault(vas, BASE + PAGE, Access::Read),
        Err(VmError::Fault(FaultKind::Io(IoError::ShortRead {
            got: 10,
            want: PAGE_SIZE
        })))
    );
}

#[test]
fn concurrent_faults_fill_once() {
    const THREADS: usize = 8;
    let fx = fixture();
    let file = MemFile::new(pattern(5, PAGE_SIZE));
    let (vas, _, pset) = fx.mapped_file(1, &file, 1);
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let vm = Arc::clone(&fx.vm);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                vm.fault(vas, BASE, Access::Read).unwrap()
            })
        })
        .collect();
    let pfns: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(pfns.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(file.reads(), 1);
    assert_eq!(fx.vm.slot_info(pset, 0).unwrap().refs, 2);
}

#[test]
fn shared_page_set_counts_every_view() {
    let fx = fixture();
    let pset = fx.vm.create_zero_fill(1).unwrap();
    let a = fx.vm.create_vas(Pid(1));
    let b = fx.vm.create_vas(Pid(2));
    let va = fx.vm.attach(a, pset, BASE, 0, 1, Protection::SHARED_READ_WRITE).unwrap();
    fx.vm.attach(b, pset, BASE, 0, 1, Protection::SHARED_READ_WRITE).unwrap();
    fx.vm.release_pset(pset).unwrap();

    fx.vm.write(a, BASE, b"shared").unwrap();
    assert_eq!(fx.read_vec(b, BASE, 6), b"shared");
    let info = fx.vm.slot_info(pset, 0).unwrap();
    assert_eq!(info.refs, 2);
    assert_eq!(info.mappings, 2);

    fx.vm.detach(va).unwrap();
    assert_eq!(fx.vm.slot_info(pset, 0).unwrap().refs, 1);
    assert_eq!(fx.vm.fault(a, BASE, Access::Read), Err(VmError::Fault(FaultKind::Unmapped)));
    assert_eq!(fx.vm.detach(va), Err(VmError::InvalidArgument));
}

#[test]
fn destroying_the_address_space_returns_every_frame() {
    let fx = fixture();
    let free = fx.vm.frames().free_count();
    let (vas, _, pset) = fx.anon(1, 8, Protection::READ_WRITE);
    for page in 0..8 {
        fx.vm.write(vas, BASE + page * PAGE, &[1]).unwrap();
    }
    assert_eq!(fx.vm.frames().free_count(), free - 8);

    fx.vm.destroy_vas(vas).unwrap();
    assert_eq!(fx.vm.frames().free_count(), free);
    assert_eq!(fx.hat.len(), 0);
    assert!(fx.vm.pset(pset).is_err());
    assert_eq!(fx.vm.destroy_vas(vas), Err(VmError::InvalidArgument));
}
