//! # Page sets
//!
//! A page set is an array of slots, one per page of some memory object, plus
//! a [`FillPolicy`] that knows how to produce and persist page contents.
//! Views attach page sets into address spaces; frames back individual slots.
//!
//! Each slot has its own spin lock and its own completion semaphore. While a
//! slot is `in_transit` the thread that set the flag owns it: faulting
//! threads register as waiters, drop the slot lock and sleep on the
//! semaphore, then re-validate from scratch.

use crate::addresses::{Pfn, PsetId};
use crate::policy::FillPolicy;
use alloc::boxed::Box;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use bitfield_struct::bitfield;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_sync::{MutexGuard, RawSpin, Semaphore, SpinMutex};

#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct SlotFlags {
    /// A frame holds the current content.
    pub valid: bool,
    /// Written since it was last filled or written back.
    pub modified: bool,
    /// Touched since the page clock last looked.
    pub referenced: bool,
    /// Permanently unusable.
    pub bad: bool,
    /// The swap area holds a copy.
    pub swapped: bool,
    /// A fill or write-back is in progress.
    pub in_transit: bool,
    #[bits(2)]
    __: u8,
}

#[derive(Debug, Default)]
pub struct Slot {
    pub flags: SlotFlags,
    /// Attach-list length of the backing frame while valid.
    pub refs: u32,
    pub pfn: Option<Pfn>,
    /// Outstanding wire records.
    pub wired: u32,
    waiters: u32,
}

impl Slot {
    /// The backing frame, if the slot is valid.
    #[must_use]
    pub const fn resident(&self) -> Option<Pfn> {
        if self.flags.valid() { self.pfn } else { None }
    }

    #[must_use]
    pub const fn waiters(&self) -> u32 {
        self.waiters
    }

    /// Install freshly produced content.
    pub(crate) fn commit(&mut self, pfn: Pfn, refs: u32) {
        debug_assert!(!self.flags.valid() && !self.flags.bad());
        self.pfn = Some(pfn);
        self.refs = refs;
        self.flags.set_valid(true);
        self.flags.set_modified(false);
        self.flags.set_referenced(false);
        self.check();
    }

    /// Drop the backing frame after write-back and return it.
    pub(crate) fn invalidate(&mut self, swapped: bool) -> Option<Pfn> {
        debug_assert_eq!(self.refs, 0);
        debug_assert_eq!(self.wired, 0);
        self.flags.set_valid(false);
        self.flags.set_modified(false);
        self.flags.set_referenced(false);
        self.flags.set_swapped(self.flags.swapped() || swapped);
        self.pfn.take()
    }

    pub(crate) fn check(&self) {
        debug_assert!(!(self.flags.valid() && self.flags.bad()), "valid and bad");
        debug_assert!(!self.flags.valid() || self.pfn.is_some(), "valid without frame");
    }
}

pub type SlotGuard<'a> = MutexGuard<'a, Slot, RawSpin>;

pub struct SlotCell {
    state: SpinMutex<Slot>,
    io_done: Semaphore,
}

impl SlotCell {
    fn new() -> Self {
        Self {
            state: SpinMutex::new(Slot::default()),
            io_done: Semaphore::new(0),
        }
    }

    #[must_use]
    pub fn lock(&self) -> SlotGuard<'_> {
        self.state.lock()
    }

    /// Sleep until the transfer in progress completes. The caller must
    /// re-examine the slot afterwards.
    pub fn wait(&self, mut slot: SlotGuard<'_>) {
        debug_assert!(slot.flags.in_transit());
        slot.waiters += 1;
        drop(slot);
        self.io_done.acquire();
    }

    /// Leave the in-transit phase. Returns how many sleepers to [`wake`](Self::wake)
    /// once the slot lock is dropped.
    pub(crate) fn end_transit(slot: &mut Slot) -> u32 {
        debug_assert!(slot.flags.in_transit());
        slot.flags.set_in_transit(false);
        core::mem::take(&mut slot.waiters)
    }

    pub(crate) fn wake(&self, sleepers: u32) {
        if sleepers > 0 {
            self.io_done.release_n(sleepers as usize);
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PsetKind {
    /// Anonymous memory: zeroed on first touch, paged to swap.
    ZeroFill,
    /// Pages read from a backing-store connection.
    File,
    /// Private copy of another page set, populated lazily.
    Cow,
}

struct CowChild {
    id: PsetId,
    pset: Weak<PageSet>,
    offset: u32,
}

pub struct PageSet {
    id: PsetId,
    kind: PsetKind,
    policy: Box<dyn FillPolicy>,
    slots: Box<[SlotCell]>,
    refs: AtomicU32,
    cowsets: SpinMutex<Vec<CowChild>>,
}

impl PageSet {
    /// A page set with `pages` empty slots and one reference held by the creator.
    pub(crate) fn new(id: PsetId, policy: Box<dyn FillPolicy>, pages: u32) -> Self {
        Self {
            id,
            kind: policy.kind(),
            policy,
            slots: (0..pages).map(|_| SlotCell::new()).collect(),
            refs: AtomicU32::new(1),
            cowsets: SpinMutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> PsetId {
        self.id
    }

    #[must_use]
    pub const fn kind(&self) -> PsetKind {
        self.kind
    }

    #[must_use]
    pub fn policy(&self) -> &dyn FillPolicy {
        &*self.policy
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn pages(&self) -> u32 {
        self.slots.len() as u32
    }

    /// # Panics
    /// If `index` is out of range.
    #[must_use]
    pub fn slot(&self, index: u32) -> &SlotCell {
        &self.slots[index as usize]
    }

    #[must_use]
    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Take a reference unless the count already dropped to zero.
    pub(crate) fn try_add_ref(&self) -> bool {
        self.refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > 0).then_some(n + 1)
            })
            .is_ok()
    }

    /// Drop one reference; `true` if it was the last.
    pub(crate) fn release_ref(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "{} reference count underflow", self.id);
        prev == 1
    }

    pub(crate) fn add_cow_child(&self, child: &Arc<Self>, offset: u32) {
        self.cowsets.lock().push(CowChild {
            id: child.id,
            pset: Arc::downgrade(child),
            offset,
        });
    }

    pub(crate) fn remove_cow_child(&self, id: PsetId) {
        self.cowsets.lock().retain(|c| c.id != id);
    }

    #[must_use]
    pub fn has_cow_children(&self) -> bool {
        !self.cowsets.lock().is_empty()
    }

    /// Live copy-on-write children covering slot `index`, with the matching
    /// child slot index.
    pub(crate) fn cow_children_at(&self, index: u32) -> Vec<(Arc<Self>, u32)> {
        self.cowsets
            .lock()
            .iter()
            .filter_map(|c| {
                let child = c.pset.upgrade()?;
                let at = index.checked_sub(c.offset)?;
                (at < child.pages()).then_some((child, at))
            })
            .collect()
    }
}
