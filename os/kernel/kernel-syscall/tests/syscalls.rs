use kernel_info::ids::Pid;
use kernel_info::memory::DMA_PHYS_LIMIT;
use kernel_sched::{NodeId, SchedClass, SchedConfig, Scheduler, ThreadId, ThreadState};
use kernel_syscall::{Caller, Errno, Kernel, SchedOp, Sysno, TrapFrame};
use kernel_vm::{
    Hat, HeapPhysMapper, IoError, MemoryRegion, PageFrame, Pfn, PhysicalAddress, Protection,
    SwapBlock, SwapDevice, VasId, ViewId, VirtualAddress, Vm, VmConfig,
};
use std::sync::Arc;

const BASE: VirtualAddress = VirtualAddress::new(0x4000_0000);
const MAP: [MemoryRegion; 2] = [
    MemoryRegion::usable(PhysicalAddress::new(0x10_0000), 16),
    MemoryRegion::usable(PhysicalAddress::new(0x200_0000), 16),
];

struct NoHat;

impl Hat for NoHat {
    fn add_translation(&self, _: ViewId, _: VirtualAddress, _: Pfn, _: bool) {}
    fn remove_translation(&self, _: ViewId, _: VirtualAddress, _: Pfn) {}
}

struct NoSwap;

impl SwapDevice for NoSwap {
    fn alloc(&self, _pages: u32) -> Result<SwapBlock, IoError> {
        Err(IoError::NoSpace)
    }

    fn free(&self, _block: SwapBlock, _pages: u32) {}

    fn read_page(&self, _block: SwapBlock, _buf: &mut PageFrame) -> Result<(), IoError> {
        Err(IoError::Failed)
    }

    fn write_page(&self, _block: SwapBlock, _buf: &PageFrame) -> Result<(), IoError> {
        Err(IoError::NoSpace)
    }
}

fn kernel() -> Kernel {
    let vm = Vm::new(
        VmConfig::default(),
        &MAP,
        Box::new(HeapPhysMapper::from_memory_map(&MAP)),
        Arc::new(NoHat),
        Arc::new(NoSwap),
    );
    Kernel::new(Arc::new(vm), Arc::new(Scheduler::new(SchedConfig::default())))
}

/// A process with four pages of anonymous memory at [`BASE`] and one
/// thread running on cpu 0.
fn process(k: &Kernel, pid: Pid) -> Caller {
    let vas = k.vm().create_vas(pid);
    let pset = k.vm().create_zero_fill(4).unwrap();
    k.vm()
        .attach(vas, pset, BASE, 0, 4, Protection::READ_WRITE)
        .unwrap();
    k.vm().release_pset(pset).unwrap();
    let tid = k.sched().spawn(pid, NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
    assert_eq!(k.sched().dispatch(0), Ok(Some(tid)));
    Caller {
        pid,
        tid,
        vas,
        cpu: 0,
        privileged: false,
    }
}

fn thread(k: &Kernel, caller: &Caller) -> Caller {
    let tid: ThreadId = k
        .sched()
        .spawn(caller.pid, NodeId::ROOT, 10, SchedClass::Timeshare)
        .unwrap();
    Caller { tid, ..*caller }
}

fn trap(k: &Kernel, caller: &Caller, sysno: u64, args: [u64; 3]) -> TrapFrame {
    let mut tf = TrapFrame::new(sysno, args);
    k.handle(caller, &mut tf);
    tf
}

fn errno(tf: &TrapFrame) -> Option<Errno> {
    Errno::from_return(tf.rax)
}

#[test]
fn wiring_goes_through_enable_dma() {
    let k = kernel();
    let caller = process(&k, Pid(1));
    let vaddr = BASE.as_u64() + 0x1010;

    let tf = trap(&k, &caller, Sysno::PageWire as u64, [vaddr, 1, 0]);
    assert_eq!(errno(&tf), Some(Errno::Perm));
    let tf = trap(&k, &caller, Sysno::EnableDma as u64, [0; 3]);
    assert_eq!(errno(&tf), Some(Errno::Perm));

    let root = Caller {
        privileged: true,
        ..caller
    };
    assert_eq!(trap(&k, &root, Sysno::EnableDma as u64, [0; 3]).rax, 0);

    let tf = trap(&k, &caller, Sysno::PageWire as u64, [vaddr, 1, 0]);
    assert_eq!(errno(&tf), None);
    assert!(tf.rdx < DMA_PHYS_LIMIT, "wired at {:#x}", tf.rdx);
    assert_eq!(tf.rdx & 0xFFF, 0x10);
    assert_eq!(k.vm().wired_count(), 1);

    let handle = tf.rax;
    assert_eq!(trap(&k, &caller, Sysno::PageRelease as u64, [handle, 0, 0]).rax, 0);
    assert_eq!(k.vm().wired_count(), 0);
    let tf = trap(&k, &caller, Sysno::PageRelease as u64, [handle, 0, 0]);
    assert_eq!(errno(&tf), Some(Errno::Inval));
}

#[test]
fn wiring_an_unmapped_address_faults() {
    let k = kernel();
    let caller = process(&k, Pid(1));
    k.enable_dma(&Caller {
        privileged: true,
        ..caller
    })
    .unwrap();
    let outside = BASE.as_u64() + 4 * 4096;
    let tf = trap(&k, &caller, Sysno::PageWire as u64, [outside, 0, 0]);
    assert_eq!(errno(&tf), Some(Errno::Fault));
}

#[test]
fn handles_are_private_to_their_process() {
    let k = kernel();
    let owner = process(&k, Pid(1));
    k.enable_dma(&Caller {
        privileged: true,
        ..owner
    })
    .unwrap();
    let wired = k.page_wire(&owner, BASE, false).unwrap();

    let other = Caller {
        pid: Pid(2),
        ..owner
    };
    assert_eq!(k.page_release(&other, wired.handle), Err(Errno::Inval));
    assert_eq!(k.page_release(&owner, wired.handle), Ok(()));
}

#[test]
fn unknown_numbers_are_rejected() {
    let k = kernel();
    let caller = process(&k, Pid(1));
    let tf = trap(&k, &caller, 99, [0; 3]);
    assert_eq!(errno(&tf), Some(Errno::NoSys));
    let tf = trap(&k, &caller, Sysno::SchedOp as u64, [42, 0, 0]);
    assert_eq!(errno(&tf), Some(Errno::Inval));
}

#[test]
fn priority_round_trips() {
    let k = kernel();
    let caller = process(&k, Pid(1));
    let op = |op: SchedOp, arg| trap(&k, &caller, Sysno::SchedOp as u64, [op as u64, arg, 0]);

    assert_eq!(op(SchedOp::SetPriority, 30).rax, 0);
    assert_eq!(op(SchedOp::GetPriority, 0).rax, 30);
    assert_eq!(errno(&op(SchedOp::SetPriority, 0)), Some(Errno::Inval));
    assert_eq!(errno(&op(SchedOp::SetPriority, u64::MAX)), Some(Errno::Inval));
    assert_eq!(k.sched().weight(caller.tid), Ok(30));
}

#[test]
fn profiling_and_yield() {
    let k = kernel();
    let caller = process(&k, Pid(1));
    assert_eq!(k.sched_op(&caller, SchedOp::ProfileEnable, 0), Ok(0));
    assert!(k.sched().info(caller.tid).unwrap().profiling);
    k.sched().tick(0).unwrap();
    assert_eq!(k.sched_op(&caller, SchedOp::ProfileDisable, 0), Ok(0));
    assert_eq!(k.sched().take_samples(caller.tid).unwrap().len(), 1);

    assert_eq!(k.sched_op(&caller, SchedOp::Yield, 0), Ok(0));
    assert_eq!(k.sched().state(caller.tid), Ok(ThreadState::Runnable));
    assert_eq!(k.sched().current(0), Ok(None));
    assert_eq!(k.sched_op(&caller, SchedOp::Yield, 0), Err(Errno::Inval));
}

#[test]
fn last_thread_exit_tears_the_process_down() {
    let k = kernel();
    let main = process(&k, Pid(3));
    let worker = thread(&k, &main);
    let free = k.vm().frames().free_count();
    k.enable_dma(&Caller {
        privileged: true,
        ..main
    })
    .unwrap();
    k.page_wire(&main, BASE, true).unwrap();
    assert!(k.vm().frames().free_count() < free);

    assert_eq!(k.exit_thread(&worker), Ok(false));
    assert!(k.vm().vas(main.vas).is_ok());
    assert_eq!(k.vm().wired_count(), 1);

    assert_eq!(k.exit_thread(&main), Ok(true));
    assert!(k.vm().vas(main.vas).is_err());
    assert_eq!(k.vm().wired_count(), 0);
    assert_eq!(k.vm().frames().free_count(), free);
    assert_eq!(k.sched().current(0), Ok(None));
}

#[test]
fn ephemeral_threads_are_reaped_with_the_process() {
    let k = kernel();
    let main = process(&k, Pid(5));
    let watcher = thread(&k, &main);
    let helper = thread(&k, &main);
    assert_eq!(k.sched_op(&watcher, SchedOp::MarkEphemeral, 0), Ok(0));
    assert_eq!(k.sched_op(&helper, SchedOp::MarkEphemeral, 0), Ok(0));

    assert_eq!(k.exit_thread(&main), Ok(true));
    assert!(k.sched().threads_of(Pid(5)).is_empty());
    assert_eq!(k.sched().state(watcher.tid), Err(kernel_sched::SchedError::NoSuchThread(watcher.tid)));
}

#[test]
fn marking_the_last_thread_ephemeral_reports_idle() {
    let k = kernel();
    let caller = process(&k, Pid(6));
    assert_eq!(k.sched_op(&caller, SchedOp::MarkEphemeral, 0), Ok(1));
}

#[test]
fn exit_process_checks_ownership() {
    let k = kernel();
    let a = process(&k, Pid(7));
    let b_vas: VasId = k.vm().create_vas(Pid(8));
    assert_eq!(k.exit_process(a.pid, b_vas), Err(Errno::Inval));

    let extra = thread(&k, &a);
    assert_eq!(k.exit_process(a.pid, a.vas), Ok(2));
    assert_eq!(k.sched().state(extra.tid), Err(kernel_sched::SchedError::NoSuchThread(extra.tid)));
    assert_eq!(k.exit_process(a.pid, a.vas), Err(Errno::Inval));
}
