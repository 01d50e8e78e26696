//! # Hardware address translation
//!
//! The memory core decides *what* a view translates; the HAT owns the
//! page-table encoding and TLB maintenance that make it so. Both calls are
//! made with the owning slot and frame locked and must not block.

use crate::addresses::{Pfn, ViewId, VirtualAddress};

pub trait Hat: Send + Sync {
    /// Map `vaddr` of `view` to `pfn`, replacing any existing translation.
    fn add_translation(&self, view: ViewId, vaddr: VirtualAddress, pfn: Pfn, writable: bool);

    /// Remove the translation of `vaddr` in `view`, which must point at `pfn`.
    fn remove_translation(&self, view: ViewId, vaddr: VirtualAddress, pfn: Pfn);
}
