use crate::errno::Errno;
use crate::syscall::{Reply, SchedOp, Sysno, TrapFrame};
use alloc::sync::Arc;
use kernel_info::ids::Pid;
use kernel_sched::{CpuId, Scheduler, ThreadId};
use kernel_sync::{InterruptControl, NoInterrupts};
use kernel_vm::{VasId, VirtualAddress, Vm, WireHandle, Wired};
use log::{debug, info, warn};

/// Identity of the thread issuing a syscall.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Caller {
    pub pid: Pid,
    pub tid: ThreadId,
    pub vas: VasId,
    /// The CPU the caller is running on.
    pub cpu: CpuId,
    pub privileged: bool,
}

/// The memory core and the scheduler, as seen from the syscall boundary.
pub struct Kernel<I: InterruptControl = NoInterrupts> {
    vm: Arc<Vm>,
    sched: Arc<Scheduler<I>>,
}

impl<I: InterruptControl> Kernel<I> {
    #[must_use]
    pub const fn new(vm: Arc<Vm>, sched: Arc<Scheduler<I>>) -> Self {
        Self { vm, sched }
    }

    #[must_use]
    pub const fn vm(&self) -> &Arc<Vm> {
        &self.vm
    }

    #[must_use]
    pub const fn sched(&self) -> &Arc<Scheduler<I>> {
        &self.sched
    }

    /// Decode `tf`, run the syscall and write the result back. Errors are
    /// returned as `-errno` in `rax`.
    pub fn handle(&self, caller: &Caller, tf: &mut TrapFrame) {
        let result = Sysno::try_from(tf.rax)
            .map_err(|n| {
                warn!("syscall: unknown number {n} from {}", caller.pid);
                Errno::NoSys
            })
            .and_then(|sysno| self.syscall(caller, sysno, tf.args()));
        match result {
            Ok(reply) => {
                tf.rax = reply.value;
                tf.rdx = reply.extra;
            }
            Err(e) => tf.rax = e.to_return(),
        }
    }

    /// # Errors
    /// Whatever the selected operation reports.
    pub fn syscall(&self, caller: &Caller, sysno: Sysno, args: [u64; 3]) -> Result<Reply, Errno> {
        let [a0, a1, _] = args;
        match sysno {
            Sysno::PageWire => {
                let wired = self.page_wire(caller, VirtualAddress::new(a0), a1 != 0)?;
                Ok(Reply {
                    value: wired.handle.as_u64(),
                    extra: wired.phys.as_u64(),
                })
            }
            Sysno::PageRelease => {
                self.page_release(caller, WireHandle::from_u64(a0))?;
                Ok(Reply::default())
            }
            Sysno::EnableDma => {
                self.enable_dma(caller)?;
                Ok(Reply::default())
            }
            Sysno::SchedOp => {
                let op = SchedOp::try_from(a0).map_err(|_| Errno::Inval)?;
                self.sched_op(caller, op, a1).map(Reply::from)
            }
        }
    }

    /// Pin the page at `vaddr`, waiting for a free wire record.
    ///
    /// # Errors
    /// [`Errno::Perm`] unless DMA was enabled for the caller's address space,
    /// [`Errno::Fault`] for an unmapped address, [`Errno::NoMem`] if no frame
    /// below the DMA limit is free.
    pub fn page_wire(
        &self,
        caller: &Caller,
        vaddr: VirtualAddress,
        dma_low: bool,
    ) -> Result<Wired, Errno> {
        Ok(self.vm.wire(caller.vas, vaddr, dma_low)?)
    }

    /// # Errors
    /// [`Errno::Inval`] for a handle the caller does not own.
    pub fn page_release(&self, caller: &Caller, handle: WireHandle) -> Result<(), Errno> {
        Ok(self.vm.release_wire(caller.pid, handle)?)
    }

    /// # Errors
    /// [`Errno::Perm`] for unprivileged callers.
    pub fn enable_dma(&self, caller: &Caller) -> Result<(), Errno> {
        if !caller.privileged {
            warn!("syscall: {} may not enable DMA", caller.pid);
            return Err(Errno::Perm);
        }
        self.vm.enable_dma(caller.vas)?;
        info!("{}: DMA enabled for {}", caller.vas, caller.pid);
        Ok(())
    }

    /// # Errors
    /// [`Errno::Inval`] for an out-of-range weight, or a yield from a thread
    /// that is not running on `caller.cpu`.
    pub fn sched_op(&self, caller: &Caller, op: SchedOp, arg: u64) -> Result<u64, Errno> {
        let tid = caller.tid;
        match op {
            SchedOp::SetPriority => {
                let weight = u32::try_from(arg).map_err(|_| Errno::Inval)?;
                self.sched.set_weight(tid, weight)?;
                Ok(0)
            }
            SchedOp::GetPriority => Ok(u64::from(self.sched.weight(tid)?)),
            SchedOp::Yield => {
                if self.sched.current(caller.cpu)? != Some(tid) {
                    return Err(Errno::Inval);
                }
                self.sched.yield_now(caller.cpu)?;
                Ok(0)
            }
            SchedOp::MarkEphemeral => Ok(u64::from(self.sched.mark_ephemeral(tid)?)),
            SchedOp::ProfileEnable | SchedOp::ProfileDisable => {
                self.sched.set_profiling(tid, op == SchedOp::ProfileEnable)?;
                Ok(0)
            }
        }
    }

    /// Remove the calling thread. The process is torn down with its last
    /// non-ephemeral thread; returns whether that happened.
    ///
    /// # Errors
    /// [`Errno::Srch`] for an unknown thread.
    pub fn exit_thread(&self, caller: &Caller) -> Result<bool, Errno> {
        let status = self.sched.exit(caller.tid)?;
        if status.process_idle {
            self.exit_process(caller.pid, caller.vas)?;
        }
        Ok(status.process_idle)
    }

    /// Exit every remaining thread of `pid`, release its wires and destroy
    /// its address space. Returns the number of threads that were exited.
    ///
    /// # Errors
    /// [`Errno::Inval`] if `vas` is unknown or belongs to another process.
    pub fn exit_process(&self, pid: Pid, vas: VasId) -> Result<usize, Errno> {
        if self.vm.vas(vas)?.pid() != pid {
            return Err(Errno::Inval);
        }
        let threads = self.sched.threads_of(pid);
        for &tid in &threads {
            self.sched.exit(tid)?;
        }
        self.vm.destroy_vas(vas)?;
        debug!("{pid}: exited with {} threads", threads.len());
        Ok(threads.len())
    }
}
