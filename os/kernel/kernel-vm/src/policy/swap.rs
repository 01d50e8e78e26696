use super::{WriteDone, Written};
use crate::addresses::Pfn;
use crate::error::VmError;
use crate::io::{SwapBlock, SwapDevice};
use crate::phys::Physical;
use crate::pset::{PageSet, SlotFlags};
use kernel_sync::SpinMutex;
use log::trace;

/// Swap space of one page set, reserved on the first write-back.
pub struct SwapArea {
    base: SpinMutex<Option<SwapBlock>>,
}

impl SwapArea {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            base: SpinMutex::new(None),
        }
    }

    /// Swap block of page `index`, once the area exists.
    #[must_use]
    pub fn page(&self, index: u32) -> Option<SwapBlock> {
        self.base.lock().map(|b| b.page(index))
    }

    fn reserve(&self, swap: &dyn SwapDevice, pages: u32) -> Result<SwapBlock, VmError> {
        if let Some(base) = *self.base.lock() {
            return Ok(base);
        }
        let fresh = swap.alloc(pages).map_err(VmError::Io)?;
        let mut base = self.base.lock();
        if let Some(existing) = *base {
            drop(base);
            swap.free(fresh, pages);
            return Ok(existing);
        }
        *base = Some(fresh);
        Ok(fresh)
    }

    /// Generic write-back for anonymous memory. Pages never modified since
    /// their last fill are left alone.
    pub fn write_to_swap(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        pfn: Pfn,
        flags: SlotFlags,
        done: WriteDone<'_>,
    ) {
        if !flags.modified() {
            done(Ok(Written::Clean));
            return;
        }
        let result = self.reserve(phys.swap(), pset.pages()).and_then(|base| {
            trace!("{} slot {index}: {pfn} to swap block {}", pset.id(), base.page(index).0);
            // SAFETY: The slot is in transit with no translations, so the frame is read-only.
            unsafe { phys.swap_out(base.page(index), pfn) }.map_err(VmError::Io)
        });
        done(result.map(|()| Written::Swapped));
    }

    pub fn release(&self, swap: &dyn SwapDevice, pages: u32) {
        if let Some(base) = self.base.lock().take() {
            swap.free(base, pages);
        }
    }
}

impl Default for SwapArea {
    fn default() -> Self {
        Self::new()
    }
}
