//! # Thread accounts

use crate::CpuId;
use crate::node::NodeId;
use alloc::collections::VecDeque;
use core::fmt;
use kernel_info::ids::Pid;

#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ThreadId(pub(crate) u32);

impl ThreadId {
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Sleeping,
    Runnable,
    Running,
    /// Terminal; reported by [`exit`](crate::Scheduler::exit) only.
    Dead,
}

/// Dispatch class, highest first. Timeshare threads share the CPU through
/// the weighted tree; every other class is served from a FIFO.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Ord, PartialOrd, Default)]
pub enum SchedClass {
    RealTime,
    #[default]
    Timeshare,
    Background,
    Idle,
}

/// Where a runnable thread waits for dispatch.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Queue {
    None,
    Tree,
    RealTime,
    Cheated,
    Background,
    Idle,
}

/// One profiling sample, taken on a clock tick that found the thread running.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Sample {
    /// Global tick count at the time of the sample.
    pub tick: u64,
    pub cpu: CpuId,
}

#[derive(Debug)]
pub(crate) struct Thread {
    pub(crate) pid: Pid,
    pub(crate) leaf: NodeId,
    pub(crate) state: ThreadState,
    pub(crate) class: SchedClass,
    /// Ticks left in the current quantum.
    pub(crate) budget: u32,
    /// Gave up the CPU early; the next requeue skips ahead once.
    pub(crate) cheated: bool,
    pub(crate) ephemeral: bool,
    pub(crate) queued: Queue,
    pub(crate) cpu: Option<CpuId>,
    pub(crate) profiling: bool,
    pub(crate) samples: VecDeque<Sample>,
}

impl Thread {
    pub(crate) const fn new(pid: Pid, leaf: NodeId, class: SchedClass) -> Self {
        Self {
            pid,
            leaf,
            state: ThreadState::Sleeping,
            class,
            budget: 0,
            cheated: false,
            ephemeral: false,
            queued: Queue::None,
            cpu: None,
            profiling: false,
            samples: VecDeque::new(),
        }
    }

    pub(crate) fn record(&mut self, sample: Sample, capacity: usize) {
        if self.samples.len() == capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }
}

/// Snapshot of a thread's scheduling state.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub pid: Pid,
    pub leaf: NodeId,
    pub state: ThreadState,
    pub class: SchedClass,
    pub weight: u32,
    pub budget: u32,
    pub cheated: bool,
    pub ephemeral: bool,
    pub profiling: bool,
    pub cpu: Option<CpuId>,
}
