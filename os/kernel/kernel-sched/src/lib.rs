//! # Hierarchical fair-share scheduler
//!
//! Threads are leaves of a tree of weighted groups. CPU time is split among
//! the ready children of each group in proportion to their weights, level by
//! level, so a group's share does not depend on how many threads it holds.
//!
//! ```text
//!                 root
//!               /      \
//!        users (20)   daemons (5)      ← 4/5 vs 1/5 of contested time
//!        /     \           |
//!   shell (10) cc (10)   logd (10)
//! ```
//!
//! Outside the tree, threads of other classes wait in FIFOs. A dispatch
//! serves, in order: real-time threads, timeshare threads holding the
//! cheated credit, the weighted tree, background threads, idle threads.
//!
//! ## Thread states
//!
//! ```text
//!            wakeup            dispatch
//!  Sleeping ───────► Runnable ─────────► Running
//!      ▲                 ▲                 │ │
//!      │                 └─ preempt/yield ─┘ │
//!      └─────────────── block ───────────────┘
//!
//!  any ──exit──► Dead
//! ```
//!
//! ## Locking
//!
//! All state sits behind one [`TicketMutex`] taken through
//! [`lock_irq`](kernel_sync::Mutex::lock_irq), so a clock interrupt on the
//! same CPU never observes the tree mid-update and CPUs are served in
//! arrival order.
//!
//! ```
//! use kernel_info::ids::Pid;
//! use kernel_sched::{NodeId, SchedClass, SchedConfig, Scheduler, TickOutcome};
//!
//! let sched: Scheduler = Scheduler::new(SchedConfig::default());
//! let t = sched.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
//! assert_eq!(sched.dispatch(0), Ok(Some(t)));
//! assert_eq!(sched.tick(0), Ok(TickOutcome::Continue));
//! assert!(sched.exit(t).unwrap().process_idle);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod error;
mod node;
mod thread;
mod tree;

pub use error::SchedError;
pub use node::{Node, NodeId, NodeKind};
pub use thread::{Sample, SchedClass, ThreadId, ThreadInfo, ThreadState};

use alloc::vec::Vec;
use core::marker::PhantomData;
use kernel_info::ids::Pid;
use kernel_info::sched::{CHEAT_THRESHOLD_TICKS, PROFILE_SAMPLES, QUANTUM_TICKS};
use kernel_sync::{InterruptControl, IrqMutexGuard, NoInterrupts, RawTicket, TicketMutex};
use tree::Tree;

/// Index of a CPU, `0..SchedConfig::cpus`.
pub type CpuId = usize;

/// Runtime tunables. The defaults come from [`kernel_info::sched`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SchedConfig {
    pub cpus: usize,
    /// Ticks per dispatch.
    pub quantum_ticks: u32,
    /// Quantum left at a voluntary stop that earns the cheated credit.
    pub cheat_threshold: u32,
    /// Profiling ring size per thread.
    pub profile_samples: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            quantum_ticks: QUANTUM_TICKS,
            cheat_threshold: CHEAT_THRESHOLD_TICKS,
            profile_samples: PROFILE_SAMPLES,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Continue,
    /// The quantum is used up or a more urgent thread is waiting.
    Reschedule,
}

/// Result of [`Scheduler::exit`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ExitStatus {
    pub pid: Pid,
    /// The process has no non-ephemeral thread left.
    pub process_idle: bool,
}

/// The scheduler, generic over how interrupts are masked while its lock is
/// held. Hosted builds use [`NoInterrupts`].
pub struct Scheduler<I: InterruptControl = NoInterrupts> {
    tree: TicketMutex<Tree>,
    _irq: PhantomData<fn() -> I>,
}

impl<I: InterruptControl> Scheduler<I> {
    #[must_use]
    pub fn new(config: SchedConfig) -> Self {
        assert!(config.cpus > 0, "scheduler without cpus");
        assert!(config.quantum_ticks > 0, "empty quantum");
        assert!(config.profile_samples > 0, "empty profiling ring");
        Self {
            tree: TicketMutex::new(Tree::new(config)),
            _irq: PhantomData,
        }
    }

    fn lock(&self) -> IrqMutexGuard<'_, Tree, RawTicket, I> {
        self.tree.lock_irq::<I>()
    }

    #[must_use]
    pub fn config(&self) -> SchedConfig {
        *self.lock().config()
    }

    /// New group under `parent`. The caller holds one reference.
    ///
    /// # Errors
    /// Unknown or non-group parent, weight outside `1..=MAX_WEIGHT`.
    pub fn create_group(&self, parent: NodeId, weight: u32) -> Result<NodeId, SchedError> {
        self.lock().create_group(parent, weight)
    }

    /// Drop the creator's reference from [`create_group`](Self::create_group).
    ///
    /// # Errors
    /// Unknown group, or the root.
    pub fn release_group(&self, group: NodeId) -> Result<(), SchedError> {
        self.lock().release_group(group)
    }

    /// # Errors
    /// Unknown group or invalid weight.
    pub fn set_group_weight(&self, group: NodeId, weight: u32) -> Result<(), SchedError> {
        self.lock().set_group_weight(group, weight)
    }

    /// A new runnable thread of `pid` in `group`.
    ///
    /// # Errors
    /// Unknown or non-group `group`, invalid weight.
    pub fn spawn(
        &self,
        pid: Pid,
        group: NodeId,
        weight: u32,
        class: SchedClass,
    ) -> Result<ThreadId, SchedError> {
        self.lock().spawn(pid, group, weight, class)
    }

    /// Sleeping → Runnable.
    ///
    /// # Errors
    /// Unknown thread, or it is not sleeping.
    pub fn wakeup(&self, thread: ThreadId) -> Result<(), SchedError> {
        self.lock().wakeup(thread)
    }

    /// Pick the next thread for an idle `cpu`. `None` means run the idle loop.
    ///
    /// # Errors
    /// Unknown `cpu`, or it is already running a thread.
    pub fn dispatch(&self, cpu: CpuId) -> Result<Option<ThreadId>, SchedError> {
        self.lock().dispatch(cpu)
    }

    /// Account one clock tick on `cpu`.
    ///
    /// # Errors
    /// Unknown `cpu`.
    pub fn tick(&self, cpu: CpuId) -> Result<TickOutcome, SchedError> {
        self.lock().tick(cpu)
    }

    /// Requeue the thread running on `cpu`.
    ///
    /// # Errors
    /// Unknown or idle `cpu`.
    pub fn preempt(&self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        self.lock().preempt(cpu)
    }

    /// Requeue the thread running on `cpu` at its own request.
    ///
    /// # Errors
    /// Unknown or idle `cpu`.
    pub fn yield_now(&self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        self.lock().yield_now(cpu)
    }

    /// Put the thread running on `cpu` to sleep.
    ///
    /// # Errors
    /// Unknown or idle `cpu`.
    pub fn block(&self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        self.lock().block(cpu)
    }

    /// Remove a thread in any state. Its CPU, if any, becomes idle.
    ///
    /// # Errors
    /// Unknown thread.
    pub fn exit(&self, thread: ThreadId) -> Result<ExitStatus, SchedError> {
        self.lock().exit(thread)
    }

    /// # Errors
    /// Unknown thread.
    pub fn set_class(&self, thread: ThreadId, class: SchedClass) -> Result<(), SchedError> {
        self.lock().set_class(thread, class)
    }

    /// # Errors
    /// Unknown thread.
    pub fn class(&self, thread: ThreadId) -> Result<SchedClass, SchedError> {
        Ok(self.lock().info(thread)?.class)
    }

    /// Weight of the thread's leaf.
    ///
    /// # Errors
    /// Unknown thread or invalid weight.
    pub fn set_weight(&self, thread: ThreadId, weight: u32) -> Result<(), SchedError> {
        self.lock().set_weight(thread, weight)
    }

    /// # Errors
    /// Unknown thread.
    pub fn weight(&self, thread: ThreadId) -> Result<u32, SchedError> {
        Ok(self.lock().info(thread)?.weight)
    }

    /// Exclude the thread from its process's live-thread count. Returns
    /// `true` if no non-ephemeral thread of the process is left.
    ///
    /// # Errors
    /// Unknown thread.
    pub fn mark_ephemeral(&self, thread: ThreadId) -> Result<bool, SchedError> {
        self.lock().mark_ephemeral(thread)
    }

    /// # Errors
    /// Unknown thread.
    pub fn set_profiling(&self, thread: ThreadId, on: bool) -> Result<(), SchedError> {
        self.lock().set_profiling(thread, on)
    }

    /// Drain the thread's profiling samples, oldest first.
    ///
    /// # Errors
    /// Unknown thread.
    pub fn take_samples(&self, thread: ThreadId) -> Result<Vec<Sample>, SchedError> {
        self.lock().take_samples(thread)
    }

    /// Snapshot of a group or leaf.
    ///
    /// # Errors
    /// Unknown node.
    pub fn node(&self, node: NodeId) -> Result<Node, SchedError> {
        self.lock().node(node)
    }

    /// Runnable or running leaves below `node`.
    ///
    /// # Errors
    /// Unknown node.
    pub fn runnable_count(&self, node: NodeId) -> Result<u32, SchedError> {
        self.lock().runnable_count(node)
    }

    /// Leaves below `node` waiting in the weighted tree.
    ///
    /// # Errors
    /// Unknown node.
    pub fn ready_count(&self, node: NodeId) -> Result<u32, SchedError> {
        self.lock().ready_count(node)
    }

    /// # Errors
    /// Unknown thread.
    pub fn state(&self, thread: ThreadId) -> Result<ThreadState, SchedError> {
        Ok(self.lock().info(thread)?.state)
    }

    /// # Errors
    /// Unknown thread.
    pub fn info(&self, thread: ThreadId) -> Result<ThreadInfo, SchedError> {
        self.lock().info(thread)
    }

    /// # Errors
    /// Unknown `cpu`.
    pub fn current(&self, cpu: CpuId) -> Result<Option<ThreadId>, SchedError> {
        self.lock().current(cpu)
    }

    /// Live non-ephemeral threads of `pid`.
    #[must_use]
    pub fn members(&self, pid: Pid) -> u32 {
        self.lock().members(pid)
    }

    /// Every live thread of `pid`.
    #[must_use]
    pub fn threads_of(&self, pid: Pid) -> Vec<ThreadId> {
        self.lock().threads_of(pid)
    }
}
