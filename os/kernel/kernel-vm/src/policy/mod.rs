//! # Fill policies
//!
//! The per-variant behavior of a page set. The generic code in
//! [`Vm`](crate::Vm) owns slot state and locking; a policy only moves bytes
//! between frames and the variant's backing (zeroes, a file connection,
//! swap, a master page set).
//!
//! Policy methods are always called with no spin lock held, so they may
//! block on I/O.

mod cow;
mod file;
mod swap;
mod zero_fill;

pub use cow::CopyOnWrite;
pub use file::FileBacked;
pub use swap::SwapArea;
pub use zero_fill::ZeroFill;

use crate::addresses::Pfn;
use crate::error::{FaultKind, IoError, VmError};
use crate::phys::Physical;
use crate::pset::{PageSet, PsetKind, SlotFlags};
use alloc::boxed::Box;
use alloc::sync::Arc;

/// A frame produced by [`FillPolicy::fill_slot`], not yet committed.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Filled {
    pub pfn: Pfn,
    /// The page set keeps a durable [`Cache`](crate::atl::AttachKind::Cache)
    /// reference on the frame.
    pub cached: bool,
    /// The content exists nowhere but in the frame.
    pub dirty: bool,
}

/// Outcome of a successful [`FillPolicy::write_slot`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Written {
    /// Nothing needed writing; the backing already matches the frame.
    Clean,
    /// The frame was copied to the swap area.
    Swapped,
}

/// Completion callback for [`FillPolicy::write_slot`]; called exactly once.
pub type WriteDone<'a> = &'a mut dyn FnMut(Result<Written, VmError>);

pub trait FillPolicy: Send + Sync {
    fn kind(&self) -> PsetKind;

    /// Called once after the page set is created.
    ///
    /// # Errors
    /// The backing cannot be prepared; creation fails.
    fn init(&self, _phys: &Physical, _pset: &PageSet) -> Result<(), VmError> {
        Ok(())
    }

    /// Produce the content of slot `index` in `pfn`.
    ///
    /// `pfn` is private to the caller. `flags` is a snapshot taken when the
    /// slot entered transit.
    ///
    /// # Errors
    /// [`VmError::Fault`] with [`FaultKind::Io`] when the content cannot be read.
    fn load_page(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        flags: SlotFlags,
        pfn: Pfn,
    ) -> Result<(), VmError>;

    /// Whether filled frames carry a cache reference.
    fn caches_pages(&self) -> bool {
        false
    }

    /// Whether a page loaded with `flags` has to be written back before its
    /// frame may be dropped, even if nobody writes it.
    fn fills_dirty(&self, _flags: SlotFlags) -> bool {
        false
    }

    /// Allocate a frame and fill it. On failure the frame is released and
    /// the slot stays retryable.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] or any [`load_page`](Self::load_page) failure.
    fn fill_slot(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        flags: SlotFlags,
    ) -> Result<Filled, VmError> {
        debug_assert!(!flags.valid() && !flags.bad());
        let pfn = phys.frames.allocate()?;
        match self.load_page(phys, pset, index, flags, pfn) {
            Ok(()) => Ok(Filled {
                pfn,
                cached: self.caches_pages(),
                dirty: self.fills_dirty(flags),
            }),
            Err(e) => {
                phys.frames.free(pfn);
                Err(e)
            }
        }
    }

    /// Make the backing hold the content of `pfn` so the frame can be
    /// dropped. The slot is in transit and no view translates the frame.
    fn write_slot(
        &self,
        phys: &Physical,
        pset: &PageSet,
        index: u32,
        pfn: Pfn,
        flags: SlotFlags,
        done: WriteDone<'_>,
    );

    /// Policy for a second instance over the same backing, or `None` when
    /// the generic copy-on-write duplication covers this variant.
    ///
    /// # Errors
    /// The backing cannot be shared.
    fn dup(&self, old: &Arc<PageSet>) -> Result<Option<Box<dyn FillPolicy>>, VmError>;

    /// Release the backing. Runs after every slot has been released.
    fn free(&self, _phys: &Physical, _pset: &PageSet) {}

    /// The reference count reached zero; runs before slots are released.
    fn last_ref(&self, _pset: &PageSet) {}

    /// The page set this one copies from.
    fn master(&self) -> Option<&Arc<PageSet>> {
        None
    }
}

pub(crate) const fn fill_error(e: IoError) -> VmError {
    VmError::Fault(FaultKind::Io(e))
}
