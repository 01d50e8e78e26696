use super::{FillPolicy, SwapArea, WriteDone, fill_error};
use crate::addresses::Pfn;
use crate::error::VmError;
use crate::phys::Physical;
use crate::pset::{PageSet, PsetKind, SlotFlags};
use alloc::boxed::Box;
use alloc::sync::Arc;

/// Anonymous memory: zeroes on first touch, swap afterwards.
#[derive(Default)]
pub struct ZeroFill {
    swap: SwapArea,
}

impl ZeroFill {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            swap: SwapArea::new(),
        }
    }
}

impl FillPolicy for ZeroFill {
    fn kind(&self) -> PsetKind {
        PsetKind::ZeroFill
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
            unsafe { phys.swap_in(block, pfn) }.map_err(fill_error)
        } else {
            // SAFETY: The frame is private to the filling thread.
            unsafe { phys.zero(pfn) };
            Ok(())
        }
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
}
