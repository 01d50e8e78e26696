//! # Eviction
//!
//! Frames are reclaimed one slot at a time: every translation is removed via
//! the attach list, the fill policy writes the content back if needed, and
//! the frame returns to the free list. The slot stays `in_transit` during the
//! write so faulting threads wait for it.
//!
//! [`Vm::clock_scan`] picks victims with a two-handed clock over the frame
//! table. The front hand clears `referenced` and removes the frame's
//! translations, so the next access faults and marks the slot again. The back
//! hand, trailing by [`VmConfig::clock_gap`](crate::VmConfig::clock_gap)
//! frames, evicts slots that stayed unreferenced in between.

use crate::Vm;
use crate::addresses::{Pfn, PsetId};
use crate::error::VmError;
use crate::policy::Written;
use crate::pset::{PageSet, SlotCell};
use alloc::sync::Arc;
use log::{debug, trace, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Evicted {
    /// The slot had no frame.
    NotResident,
    /// The frame was freed after the given write-back.
    Freed(Written),
}

/// Work done by one [`Vm::clock_scan`] call.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct ScanStats {
    pub scanned: usize,
    /// Slots whose referenced mark the front hand cleared.
    pub cleared: usize,
    pub evicted: usize,
    /// Evictions that wrote to swap.
    pub swapped: usize,
}

impl Vm {
    /// Reclaim the frame of slot `index` of `pset`.
    ///
    /// # Errors
    /// * [`VmError::Busy`]: the slot is wired or in transit.
    /// * [`VmError::Io`]: the write-back failed; the page stays resident.
    /// * [`VmError::InvalidArgument`]: unknown page set or index.
    pub fn evict(&self, pset: PsetId, index: u32) -> Result<Evicted, VmError> {
        let pset = self.pset(pset)?;
        if index >= pset.pages() || !pset.try_add_ref() {
            return Err(VmError::InvalidArgument);
        }
        let result = self.evict_slot(&pset, index);
        self.put_pset(&pset);
        result
    }

    /// The caller holds a reference on `pset`.
    fn evict_slot(&self, pset: &Arc<PageSet>, index: u32) -> Result<Evicted, VmError> {
        let cell = pset.slot(index);
        let mut slot = cell.lock();
        if slot.flags.in_transit() || slot.wired > 0 {
            return Err(VmError::Busy);
        }
        let Some(pfn) = slot.resident() else {
            return Ok(Evicted::NotResident);
        };

        self.unmap_all(index, pfn, &mut slot);
        if self.phys.frames.lock(pfn).attach_mut().delete_cache().is_some() {
            slot.refs -= 1;
        }
        assert_eq!(
            slot.refs,
            0,
            "{} slot {index}: references left after unmapping",
            pset.id()
        );
        slot.flags.set_in_transit(true);
        let flags = slot.flags;
        drop(slot);

        let mut outcome = None;
        pset.policy()
            .write_slot(&self.phys, pset, index, pfn, flags, &mut |r| outcome = Some(r));
        let outcome = outcome
            .unwrap_or_else(|| panic!("{} slot {index}: write-back never completed", pset.id()));

        let mut slot = cell.lock();
        let sleepers = SlotCell::end_transit(&mut slot);
        let result = match outcome {
            Ok(written) => {
                slot.invalidate(written == Written::Swapped);
                self.phys.frames.lock(pfn).clear_owner();
                Ok(Evicted::Freed(written))
            }
            Err(e) => Err(e),
        };
        drop(slot);
        cell.wake(sleepers);

        match result {
            Ok(evicted) => {
                self.phys.frames.free(pfn);
                trace!("{} slot {index}: evicted {pfn} ({evicted:?})", pset.id());
                Ok(evicted)
            }
            Err(e) => {
                warn!("{} slot {index}: write-back failed: {e}", pset.id());
                Err(e)
            }
        }
    }

    /// The page set and slot a frame backs, with a reference taken.
    fn owner_of(&self, pfn: Pfn) -> Option<(Arc<PageSet>, u32)> {
        let (id, index) = self.phys.frames.lock(pfn).page_set()?;
        let pset = self.pset(id).ok()?;
        pset.try_add_ref().then_some((pset, index))
    }

    /// Advance the page clock by `steps` frames.
    pub fn clock_scan(&self, steps: usize) -> ScanStats {
        let total = self.phys.frames.total();
        let mut stats = ScanStats::default();
        if total == 0 {
            return stats;
        }
        let gap = self.config.clock_gap.min(total / 2);

        for _ in 0..steps {
            let front = {
                let mut hand = self.clock_hand.lock();
                let front = *hand;
                *hand = (front + 1) % total;
                front
            };
            let back = (front + total - gap) % total;
            stats.scanned += 1;

            let pfn = self.phys.frames.pfn_at(front);
            if let Some((pset, index)) = self.owner_of(pfn) {
                let mut slot = pset.slot(index).lock();
                if slot.resident() == Some(pfn) && !slot.flags.in_transit() {
                    if slot.flags.referenced() {
                        stats.cleared += 1;
                    }
                    slot.flags.set_referenced(false);
                    self.unmap_all(index, pfn, &mut slot);
                }
                drop(slot);
                self.put_pset(&pset);
            }

            let pfn = self.phys.frames.pfn_at(back);
            if let Some((pset, index)) = self.owner_of(pfn) {
                let idle = {
                    let slot = pset.slot(index).lock();
                    slot.resident() == Some(pfn) && !slot.flags.referenced()
                };
                if idle {
                    match self.evict_slot(&pset, index) {
                        Ok(Evicted::Freed(written)) => {
                            stats.evicted += 1;
                            if written == Written::Swapped {
                                stats.swapped += 1;
                            }
                        }
                        Ok(Evicted::NotResident) | Err(VmError::Busy) => {}
                        Err(e) => debug!("clock: {} slot {index} kept: {e}", pset.id()),
                    }
                }
                self.put_pset(&pset);
            }
        }
        stats
    }
}
