use super::{FillPolicy, SwapArea, WriteDone, fill_error};
use crate::addresses::Pfn;
use crate::error::{FaultKind, VmError};
use crate::phys::Physical;
use crate::pset::{PageSet, PsetKind, SlotFlags};
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Private copy of a window of a master page set.
///
/// Slot `i` starts out as the master's slot `i + offset`. A child slot gets
/// its own frame either when it is first faulted (copied from the master) or
/// when the master is about to be written (pushed by the master's writer).
/// After that it pages to its own swap area.
pub struct CopyOnWrite {
    master: Arc<PageSet>,
    offset: u32,
    swap: SwapArea,
}

impl CopyOnWrite {
    /// The caller accounts for the reference on `master`.
    #[must_use]
    pub const fn new(master: Arc<PageSet>, offset: u32) -> Self {
        Self {
            master,
            offset,
            swap: SwapArea::new(),
        }
    }

    fn copy_from_master(&self, phys: &Physical, index: u32, pfn: Pfn) -> Result<(), VmError> {
        let cell = self.master.slot(index);
        loop {
            let slot = cell.lock();
            // A resident page being written back is still readable.
            if let Some(src) = slot.resident() {
                // SAFETY: The master slot lock keeps `src` stable; `pfn` is private.
                unsafe { phys.copy(src, pfn) };
                return Ok(());
            }
            if slot.flags.bad() {
                return Err(FaultKind::BadPage.into());
            }
            if slot.flags.in_transit() {
                cell.wait(slot);
                continue;
            }
            let flags = slot.flags;
            drop(slot);
            return self
                .master
                .policy()
                .load_page(phys, &self.master, index, flags, pfn);
        }
    }
}

impl FillPolicy for CopyOnWrite {
    fn kind(&self) -> PsetKind {
        PsetKind::Cow
    }

    fn load_page(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        flags: SlotFlags,
        pfn: Pfn,
    ) -> Result<(), VmError> {
        if flags.swapped() {
            let block = self.swap.page(index).unwrap_or_else(|| {
                panic!("{} slot {index} is swapped but has no swap area", pset.id())
            });
            // SAFETY: The frame is private to the filling thread.
            return unsafe { phys.swap_in(block, pfn) }.map_err(fill_error);
        }
        self.copy_from_master(phys, index + self.offset, pfn)
    }

    /// A copy of the master is this page set's only record of the
    /// snapshot; the master may change afterwards.
    fn fills_dirty(&self, flags: SlotFlags) -> bool {
        !flags.swapped()
    }

    fn write_slot(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        pfn: Pfn,
        flags: SlotFlags,
        done: WriteDone<'_>,
    ) {
        self.swap.write_to_swap(phys, pset, index, pfn, flags, done);
    }

    fn dup(&self, _old: &Arc<PageSet>) -> Result<Option<Box<dyn FillPolicy>>, VmError> {
        Ok(None)
    }

    fn free(&self, phys: &Physical, pset: &PageSet) {
        self.swap.release(phys.swap(), pset.pages());
    }

    fn master(&self) -> Option<&Arc<PageSet>> {
        Some(&self.master)
    }
}
