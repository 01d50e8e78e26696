//! # The scheduling tree
//!
//! [`Tree`] holds every node, thread account and dispatch queue. It is not
//! synchronized itself; [`Scheduler`](crate::Scheduler) wraps it in one lock.
//!
//! Two counters are kept per node and updated along the leaf-to-root path on
//! every state change:
//!
//! * `nrun`: runnable or running leaves below the node.
//! * `nready`: leaves below the node that the weighted walk may dispatch,
//!   i.e. runnable timeshare threads not waiting in the cheated FIFO.
//!
//! Fairness is stride scheduling per level. Running a leaf for one tick adds
//! `SCALE / weight` to the virtual time of the leaf and each ancestor below
//! the root, and the walk always descends into the ready child with the
//! least virtual time. Siblings with weights 5 and 20 therefore split
//! contested time 1:4.

use crate::error::SchedError;
use crate::node::{Arena, Node, NodeId, NodeKind};
use crate::thread::{Queue, Sample, SchedClass, Thread, ThreadId, ThreadInfo, ThreadState};
use crate::{CpuId, ExitStatus, SchedConfig, TickOutcome};
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use kernel_info::ids::Pid;
use kernel_info::sched::{DEFAULT_WEIGHT, MAX_WEIGHT};
use log::{debug, trace};

/// Virtual time one tick costs a node of weight 1.
const SCALE: u64 = 1 << 20;

pub(crate) struct Tree {
    config: SchedConfig,
    nodes: Arena,
    threads: BTreeMap<ThreadId, Thread>,
    /// Live non-ephemeral threads per process.
    procs: BTreeMap<Pid, u32>,
    realtime: VecDeque<ThreadId>,
    cheated: VecDeque<ThreadId>,
    background: VecDeque<ThreadId>,
    idle: VecDeque<ThreadId>,
    current: Vec<Option<ThreadId>>,
    next_thread: u32,
    ticks: u64,
}

const fn check_weight(weight: u32) -> Result<u32, SchedError> {
    if weight == 0 || weight > MAX_WEIGHT {
        Err(SchedError::InvalidWeight(weight))
    } else {
        Ok(weight)
    }
}

impl Tree {
    pub(crate) fn new(config: SchedConfig) -> Self {
        Self {
            nodes: Arena::new(DEFAULT_WEIGHT),
            threads: BTreeMap::new(),
            procs: BTreeMap::new(),
            realtime: VecDeque::new(),
            cheated: VecDeque::new(),
            background: VecDeque::new(),
            idle: VecDeque::new(),
            current: alloc::vec![None; config.cpus],
            next_thread: 1,
            ticks: 0,
            config,
        }
    }

    pub(crate) const fn config(&self) -> &SchedConfig {
        &self.config
    }

    fn thread(&self, id: ThreadId) -> Result<&Thread, SchedError> {
        self.threads.get(&id).ok_or(SchedError::NoSuchThread(id))
    }

    fn thread_mut(&mut self, id: ThreadId) -> Result<&mut Thread, SchedError> {
        self.threads.get_mut(&id).ok_or(SchedError::NoSuchThread(id))
    }

    fn group(&self, id: NodeId) -> Result<(), SchedError> {
        let node = self.nodes.get(id).ok_or(SchedError::NoSuchNode(id))?;
        if node.is_group() {
            Ok(())
        } else {
            Err(SchedError::NotAGroup(id))
        }
    }

    fn cpu(&self, cpu: CpuId) -> Result<Option<ThreadId>, SchedError> {
        self.current
            .get(cpu)
            .copied()
            .ok_or(SchedError::NoSuchCpu(cpu))
    }

    fn running_on(&self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        self.cpu(cpu)?.ok_or(SchedError::NotRunning(cpu))
    }

    // Groups

    pub(crate) fn create_group(&mut self, parent: NodeId, weight: u32) -> Result<NodeId, SchedError> {
        self.group(parent)?;
        let weight = check_weight(weight)?;
        self.nodes.node_mut(parent).refs += 1;
        let id = self.nodes.insert(
            parent,
            weight,
            NodeKind::Group {
                first: None,
                last: None,
            },
        );
        debug!("sched: {id} created under {parent}, weight {weight}");
        Ok(id)
    }

    /// Drop the creator's reference; the group goes away with its last member.
    pub(crate) fn release_group(&mut self, id: NodeId) -> Result<(), SchedError> {
        self.group(id)?;
        if id == NodeId::ROOT {
            return Err(SchedError::InvalidState);
        }
        self.put_node(id);
        Ok(())
    }

    fn put_node(&mut self, id: NodeId) {
        let mut at = Some(id);
        while let Some(id) = at {
            let node = self.nodes.node_mut(id);
            assert!(node.refs > 0, "{id} reference count underflow");
            node.refs -= 1;
            if node.refs > 0 || id == NodeId::ROOT {
                return;
            }
            at = self.nodes.remove(id).parent;
            trace!("sched: {id} freed");
        }
    }

    pub(crate) fn set_group_weight(&mut self, id: NodeId, weight: u32) -> Result<(), SchedError> {
        self.group(id)?;
        self.nodes.node_mut(id).weight = check_weight(weight)?;
        Ok(())
    }

    pub(crate) fn runnable_count(&self, id: NodeId) -> Result<u32, SchedError> {
        self.nodes
            .get(id)
            .map(|n| n.nrun)
            .ok_or(SchedError::NoSuchNode(id))
    }

    pub(crate) fn ready_count(&self, id: NodeId) -> Result<u32, SchedError> {
        self.nodes
            .get(id)
            .map(|n| n.nready)
            .ok_or(SchedError::NoSuchNode(id))
    }

    pub(crate) fn node(&self, id: NodeId) -> Result<Node, SchedError> {
        self.nodes.get(id).cloned().ok_or(SchedError::NoSuchNode(id))
    }

    #[cfg(test)]
    fn vtime(&self, id: NodeId) -> Result<u64, SchedError> {
        self.node(id).map(|n| n.vtime)
    }

    // Threads

    pub(crate) fn spawn(
        &mut self,
        pid: Pid,
        group: NodeId,
        weight: u32,
        class: SchedClass,
    ) -> Result<ThreadId, SchedError> {
        self.group(group)?;
        let weight = check_weight(weight)?;
        let id = ThreadId(self.next_thread);
        self.next_thread += 1;

        self.nodes.node_mut(group).refs += 1;
        let leaf = self.nodes.insert(group, weight, NodeKind::Leaf(id));
        self.threads.insert(id, Thread::new(pid, leaf, class));
        *self.procs.entry(pid).or_insert(0) += 1;
        self.make_runnable(id);
        debug!("sched: {id} of {pid} spawned in {group}, {class:?}, weight {weight}");
        Ok(id)
    }

    pub(crate) fn wakeup(&mut self, id: ThreadId) -> Result<(), SchedError> {
        if self.thread(id)?.state != ThreadState::Sleeping {
            return Err(SchedError::InvalidState);
        }
        self.make_runnable(id);
        trace!("sched: {id} woken");
        Ok(())
    }

    fn make_runnable(&mut self, id: ThreadId) {
        let leaf = {
            let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
            debug_assert_eq!(t.state, ThreadState::Sleeping);
            t.state = ThreadState::Runnable;
            t.leaf
        };
        self.add_run(leaf);
        self.enqueue(id);
    }

    pub(crate) fn dispatch(&mut self, cpu: CpuId) -> Result<Option<ThreadId>, SchedError> {
        if self.cpu(cpu)?.is_some() {
            return Err(SchedError::CpuBusy(cpu));
        }
        let Some(id) = self.pick() else {
            return Ok(None);
        };
        let quantum = self.config.quantum_ticks;
        let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
        debug_assert_eq!(t.state, ThreadState::Runnable);
        t.state = ThreadState::Running;
        t.budget = quantum;
        t.cpu = Some(cpu);
        self.current[cpu] = Some(id);
        trace!("sched: cpu {cpu} runs {id}");
        Ok(Some(id))
    }

    /// Take the next thread off the highest non-empty queue.
    fn pick(&mut self) -> Option<ThreadId> {
        if let Some(id) = self.realtime.pop_front() {
            self.unqueued(id);
            return Some(id);
        }
        if let Some(id) = self.cheated.pop_front() {
            self.unqueued(id).cheated = false;
            return Some(id);
        }
        if let Some(id) = self.walk() {
            let leaf = self.unqueued(id).leaf;
            self.remove_ready(leaf);
            return Some(id);
        }
        let id = self.background.pop_front().or_else(|| self.idle.pop_front())?;
        self.unqueued(id);
        Some(id)
    }

    fn unqueued(&mut self, id: ThreadId) -> &mut Thread {
        let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
        t.queued = Queue::None;
        t
    }

    /// Descend from the root into the ready child furthest behind its weight.
    fn walk(&mut self) -> Option<ThreadId> {
        if self.nodes.node(NodeId::ROOT).nready == 0 {
            return None;
        }
        let mut at = NodeId::ROOT;
        loop {
            if let NodeKind::Leaf(id) = self.nodes.node(at).kind {
                return Some(id);
            }
            let next = self
                .nodes
                .children(at)
                .filter(|&c| self.nodes.node(c).nready > 0)
                .min_by_key(|&c| self.nodes.node(c).vtime)
                .unwrap_or_else(|| panic!("{at} counts ready leaves it does not have"));
            let floor = self.nodes.node(next).vtime;
            self.nodes.node_mut(at).vclock = floor;
            at = next;
        }
    }

    pub(crate) fn tick(&mut self, cpu: CpuId) -> Result<TickOutcome, SchedError> {
        self.ticks += 1;
        let Some(id) = self.cpu(cpu)? else {
            return Ok(self.idle_tick());
        };
        let now = self.ticks;
        let capacity = self.config.profile_samples;
        let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
        t.budget = t.budget.saturating_sub(1);
        if t.profiling {
            t.record(Sample { tick: now, cpu }, capacity);
        }
        let (leaf, class, budget) = (t.leaf, t.class, t.budget);

        if class == SchedClass::Timeshare {
            self.charge(leaf, 1);
        }
        if budget == 0 || self.preempted_by_class(class) {
            Ok(TickOutcome::Reschedule)
        } else {
            Ok(TickOutcome::Continue)
        }
    }

    fn idle_tick(&self) -> TickOutcome {
        if self.has_waiting() {
            TickOutcome::Reschedule
        } else {
            TickOutcome::Continue
        }
    }

    fn has_waiting(&self) -> bool {
        !self.realtime.is_empty()
            || !self.cheated.is_empty()
            || self.nodes.node(NodeId::ROOT).nready > 0
            || !self.background.is_empty()
            || !self.idle.is_empty()
    }

    /// A more urgent class is waiting.
    fn preempted_by_class(&self, running: SchedClass) -> bool {
        match running {
            SchedClass::RealTime => false,
            SchedClass::Timeshare => !self.realtime.is_empty(),
            SchedClass::Background => {
                !self.realtime.is_empty()
                    || !self.cheated.is_empty()
                    || self.nodes.node(NodeId::ROOT).nready > 0
            }
            SchedClass::Idle => self.has_waiting(),
        }
    }

    /// Charge `ticks` of CPU time to `leaf` and its ancestors below the root.
    fn charge(&mut self, leaf: NodeId, ticks: u32) {
        let mut at = leaf;
        while at != NodeId::ROOT {
            let node = self.nodes.node_mut(at);
            node.vtime += u64::from(ticks) * SCALE / u64::from(node.weight);
            at = node
                .parent
                .unwrap_or_else(|| panic!("{at} is detached from the tree"));
        }
    }

    /// Running → Runnable at the end of the quantum.
    pub(crate) fn preempt(&mut self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        let id = self.stop(cpu, false)?;
        self.thread_mut(id)?.state = ThreadState::Runnable;
        self.enqueue(id);
        trace!("sched: {id} preempted on cpu {cpu}");
        Ok(id)
    }

    /// Running → Runnable on the thread's own request.
    pub(crate) fn yield_now(&mut self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        let id = self.stop(cpu, true)?;
        self.thread_mut(id)?.state = ThreadState::Runnable;
        self.enqueue(id);
        trace!("sched: {id} yielded cpu {cpu}");
        Ok(id)
    }

    /// Running → Sleeping.
    pub(crate) fn block(&mut self, cpu: CpuId) -> Result<ThreadId, SchedError> {
        let id = self.stop(cpu, true)?;
        let t = self.thread_mut(id)?;
        t.state = ThreadState::Sleeping;
        let leaf = t.leaf;
        self.sub_run(leaf);
        trace!("sched: {id} blocked on cpu {cpu}");
        Ok(id)
    }

    /// Take the running thread off `cpu`. A voluntary stop with enough of
    /// the quantum left earns the cheated credit.
    fn stop(&mut self, cpu: CpuId, voluntary: bool) -> Result<ThreadId, SchedError> {
        let id = self.running_on(cpu)?;
        let threshold = self.config.cheat_threshold;
        self.current[cpu] = None;
        let t = self.thread_mut(id)?;
        debug_assert_eq!(t.state, ThreadState::Running);
        t.cpu = None;
        if voluntary && t.class == SchedClass::Timeshare && t.budget >= threshold {
            t.cheated = true;
            trace!("sched: {id} cheated with {} ticks left", t.budget);
        }
        Ok(id)
    }

    pub(crate) fn exit(&mut self, id: ThreadId) -> Result<ExitStatus, SchedError> {
        let state = self.thread(id)?.state;
        match state {
            ThreadState::Running => {
                let cpu = self.thread(id)?.cpu.unwrap_or_else(|| panic!("{id} runs nowhere"));
                self.current[cpu] = None;
            }
            ThreadState::Runnable => self.dequeue(id),
            ThreadState::Sleeping | ThreadState::Dead => {}
        }
        let t = self
            .threads
            .remove(&id)
            .unwrap_or_else(|| panic!("{id} vanished"));
        if matches!(state, ThreadState::Running | ThreadState::Runnable) {
            self.sub_run(t.leaf);
        }

        let group = self.nodes.remove(t.leaf).parent;
        if let Some(group) = group {
            self.put_node(group);
        }

        let process_idle = if t.ephemeral {
            false
        } else {
            self.release_member(t.pid)
        };
        debug!("sched: {id} of {} exited, process idle: {process_idle}", t.pid);
        Ok(ExitStatus {
            pid: t.pid,
            process_idle,
        })
    }

    /// Drop one non-ephemeral member; `true` if it was the last.
    fn release_member(&mut self, pid: Pid) -> bool {
        let count = self
            .procs
            .get_mut(&pid)
            .unwrap_or_else(|| panic!("{pid} has no scheduler account"));
        assert!(*count > 0, "{pid} member count underflow");
        *count -= 1;
        if *count == 0 {
            self.procs.remove(&pid);
            true
        } else {
            false
        }
    }

    /// Stop counting `id` towards its process. Returns `true` if the process
    /// has no non-ephemeral thread left.
    pub(crate) fn mark_ephemeral(&mut self, id: ThreadId) -> Result<bool, SchedError> {
        let t = self.thread_mut(id)?;
        if t.ephemeral {
            return Ok(false);
        }
        t.ephemeral = true;
        let pid = t.pid;
        Ok(self.release_member(pid))
    }

    /// Live non-ephemeral threads of `pid`.
    pub(crate) fn members(&self, pid: Pid) -> u32 {
        self.procs.get(&pid).copied().unwrap_or(0)
    }

    pub(crate) fn threads_of(&self, pid: Pid) -> Vec<ThreadId> {
        self.threads
            .iter()
            .filter(|(_, t)| t.pid == pid)
            .map(|(&id, _)| id)
            .collect()
    }

    pub(crate) fn set_class(&mut self, id: ThreadId, class: SchedClass) -> Result<(), SchedError> {
        let queued = self.thread(id)?.queued != Queue::None;
        if queued {
            self.dequeue(id);
        }
        self.thread_mut(id)?.class = class;
        if queued {
            self.enqueue(id);
        }
        Ok(())
    }

    pub(crate) fn set_weight(&mut self, id: ThreadId, weight: u32) -> Result<(), SchedError> {
        let weight = check_weight(weight)?;
        let leaf = self.thread(id)?.leaf;
        self.nodes.node_mut(leaf).weight = weight;
        Ok(())
    }

    pub(crate) fn set_profiling(&mut self, id: ThreadId, on: bool) -> Result<(), SchedError> {
        self.thread_mut(id)?.profiling = on;
        Ok(())
    }

    pub(crate) fn take_samples(&mut self, id: ThreadId) -> Result<Vec<Sample>, SchedError> {
        Ok(self.thread_mut(id)?.samples.drain(..).collect())
    }

    pub(crate) fn info(&self, id: ThreadId) -> Result<ThreadInfo, SchedError> {
        let t = self.thread(id)?;
        Ok(ThreadInfo {
            pid: t.pid,
            leaf: t.leaf,
            state: t.state,
            class: t.class,
            weight: self.nodes.node(t.leaf).weight,
            budget: t.budget,
            cheated: t.cheated,
            ephemeral: t.ephemeral,
            profiling: t.profiling,
            cpu: t.cpu,
        })
    }

    pub(crate) fn current(&self, cpu: CpuId) -> Result<Option<ThreadId>, SchedError> {
        self.cpu(cpu)
    }

    // Queues and counters

    fn enqueue(&mut self, id: ThreadId) {
        let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
        debug_assert_eq!(t.queued, Queue::None);
        debug_assert_eq!(t.state, ThreadState::Runnable);
        let leaf = t.leaf;
        let queued = match t.class {
            SchedClass::RealTime => Queue::RealTime,
            SchedClass::Timeshare if t.cheated => Queue::Cheated,
            SchedClass::Timeshare => Queue::Tree,
            SchedClass::Background => Queue::Background,
            SchedClass::Idle => Queue::Idle,
        };
        t.queued = queued;
        match queued {
            Queue::RealTime => self.realtime.push_back(id),
            Queue::Cheated => self.cheated.push_back(id),
            Queue::Tree => self.add_ready(leaf),
            Queue::Background => self.background.push_back(id),
            Queue::Idle => self.idle.push_back(id),
            Queue::None => unreachable!(),
        }
    }

    fn dequeue(&mut self, id: ThreadId) {
        let t = self.threads.get_mut(&id).unwrap_or_else(|| panic!("{id} vanished"));
        let (queued, leaf) = (t.queued, t.leaf);
        t.queued = Queue::None;
        let fifo = match queued {
            Queue::None => return,
            Queue::Tree => {
                self.remove_ready(leaf);
                return;
            }
            Queue::RealTime => &mut self.realtime,
            Queue::Cheated => &mut self.cheated,
            Queue::Background => &mut self.background,
            Queue::Idle => &mut self.idle,
        };
        fifo.retain(|&q| q != id);
    }

    fn add_run(&mut self, leaf: NodeId) {
        let mut at = Some(leaf);
        while let Some(id) = at {
            let node = self.nodes.node_mut(id);
            node.nrun += 1;
            at = node.parent;
        }
    }

    fn sub_run(&mut self, leaf: NodeId) {
        let mut at = Some(leaf);
        while let Some(id) = at {
            let node = self.nodes.node_mut(id);
            assert!(node.nrun > 0, "{id} runnable count underflow");
            node.nrun -= 1;
            at = node.parent;
        }
    }

    /// A node becoming ready again starts no earlier than its parent's
    /// clock, so sleeping never banks CPU credit.
    fn add_ready(&mut self, leaf: NodeId) {
        let mut at = Some(leaf);
        while let Some(id) = at {
            let parent = self.nodes.node(id).parent;
            let floor = parent.map_or(0, |p| self.nodes.node(p).vclock);
            let node = self.nodes.node_mut(id);
            if node.nready == 0 {
                node.vtime = node.vtime.max(floor);
            }
            node.nready += 1;
            at = parent;
        }
    }

    fn remove_ready(&mut self, leaf: NodeId) {
        let mut at = Some(leaf);
        while let Some(id) = at {
            let node = self.nodes.node_mut(id);
            assert!(node.nready > 0, "{id} ready count underflow");
            node.nready -= 1;
            at = node.parent;
        }
    }

    /// Recount both counters from the leaves and compare.
    #[cfg(test)]
    pub(crate) fn audit(&self) {
        let mut nrun: BTreeMap<NodeId, u32> = BTreeMap::new();
        let mut nready: BTreeMap<NodeId, u32> = BTreeMap::new();
        for t in self.threads.values() {
            let runs = matches!(t.state, ThreadState::Runnable | ThreadState::Running);
            let ready = t.queued == Queue::Tree;
            for id in self.nodes.path(t.leaf) {
                *nrun.entry(id).or_default() += u32::from(runs);
                *nready.entry(id).or_default() += u32::from(ready);
            }
        }
        for id in nrun.keys() {
            let node = self.nodes.node(*id);
            assert_eq!(node.nrun, nrun[id], "nrun of {id}");
            assert_eq!(node.nready, nready[id], "nready of {id}");
        }
        let root = self.nodes.node(NodeId::ROOT);
        assert_eq!(root.nrun, nrun.get(&NodeId::ROOT).copied().unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::sched::QUANTUM_TICKS;

    fn tree() -> Tree {
        Tree::new(SchedConfig::default())
    }

    #[test]
    fn counters_follow_every_transition() {
        let mut t = tree();
        let g = t.create_group(NodeId::ROOT, 10).unwrap();
        let a = t.spawn(Pid(1), g, 10, SchedClass::Timeshare).unwrap();
        let b = t.spawn(Pid(1), g, 10, SchedClass::Timeshare).unwrap();
        let c = t.spawn(Pid(2), NodeId::ROOT, 10, SchedClass::Background).unwrap();
        t.audit();
        assert_eq!(t.runnable_count(NodeId::ROOT), Ok(3));
        assert_eq!(t.ready_count(NodeId::ROOT), Ok(2));

        let first = t.dispatch(0).unwrap().unwrap();
        t.audit();
        assert_eq!(t.runnable_count(g), Ok(2));
        assert_eq!(t.ready_count(g), Ok(1));

        t.block(0).unwrap();
        t.audit();
        assert_eq!(t.runnable_count(NodeId::ROOT), Ok(2));

        t.wakeup(first).unwrap();
        t.audit();
        t.exit(c).unwrap();
        t.audit();
        t.exit(a).unwrap();
        t.exit(b).unwrap();
        t.audit();
        assert_eq!(t.runnable_count(NodeId::ROOT), Ok(0));
        assert_eq!(t.ready_count(NodeId::ROOT), Ok(0));
    }

    #[test]
    fn quantum_exhaustion_requests_rescheduling() {
        let mut t = tree();
        t.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
        t.dispatch(0).unwrap();
        for _ in 1..QUANTUM_TICKS {
            assert_eq!(t.tick(0), Ok(TickOutcome::Continue));
        }
        assert_eq!(t.tick(0), Ok(TickOutcome::Reschedule));
    }

    #[test]
    fn charging_is_weighted() {
        let mut t = tree();
        let heavy = t.create_group(NodeId::ROOT, 20).unwrap();
        let light = t.create_group(NodeId::ROOT, 5).unwrap();
        t.spawn(Pid(1), heavy, 10, SchedClass::Timeshare).unwrap();
        t.spawn(Pid(1), light, 10, SchedClass::Timeshare).unwrap();
        let heavy_leaf = t.nodes.children(heavy).next().unwrap();
        let light_leaf = t.nodes.children(light).next().unwrap();
        t.charge(heavy_leaf, 10);
        t.charge(light_leaf, 10);
        assert_eq!(t.vtime(light).unwrap(), 4 * t.vtime(heavy).unwrap());
        assert_eq!(t.vtime(NodeId::ROOT), Ok(0));
    }

    #[test]
    fn sleepers_do_not_bank_credit() {
        let mut t = tree();
        let busy = t.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
        let sleeper = t.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
        assert_eq!(t.dispatch(0), Ok(Some(busy)));
        t.tick(0).unwrap();
        t.preempt(0).unwrap();
        assert_eq!(t.dispatch(0), Ok(Some(sleeper)));
        // Block late in the quantum so the wakeup goes through the tree.
        for _ in 0..=QUANTUM_TICKS / 2 {
            t.tick(0).unwrap();
        }
        t.block(0).unwrap();
        assert!(!t.info(sleeper).unwrap().cheated);

        for _ in 0..20 {
            assert_eq!(t.dispatch(0), Ok(Some(busy)));
            while t.tick(0) == Ok(TickOutcome::Continue) {}
            t.preempt(0).unwrap();
        }
        t.wakeup(sleeper).unwrap();
        let leaf = t.info(sleeper).unwrap().leaf;
        let busy_leaf = t.info(busy).unwrap().leaf;
        let one_quantum = u64::from(QUANTUM_TICKS) * SCALE / 10;
        assert!(t.vtime(leaf).unwrap() + one_quantum >= t.vtime(busy_leaf).unwrap());
    }

    #[test]
    fn equal_vtime_prefers_the_older_sibling() {
        let mut t = tree();
        let first = t.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
        let second = t.spawn(Pid(1), NodeId::ROOT, 10, SchedClass::Timeshare).unwrap();
        assert_eq!(t.dispatch(0), Ok(Some(first)));
        t.preempt(0).unwrap();
        assert_eq!(t.dispatch(0), Ok(Some(first)), "no time was charged");
        t.tick(0).unwrap();
        t.preempt(0).unwrap();
        assert_eq!(t.dispatch(0), Ok(Some(second)));
    }

    #[test]
    fn groups_live_until_their_last_member_exits() {
        let mut t = tree();
        let g = t.create_group(NodeId::ROOT, 10).unwrap();
        let a = t.spawn(Pid(1), g, 10, SchedClass::Timeshare).unwrap();
        t.release_group(g).unwrap();
        assert!(t.nodes.get(g).is_some());
        t.exit(a).unwrap();
        assert!(t.nodes.get(g).is_none());
        assert_eq!(t.nodes.node(NodeId::ROOT).refs, 1);
        assert_eq!(t.release_group(NodeId::ROOT), Err(SchedError::InvalidState));
    }
}
