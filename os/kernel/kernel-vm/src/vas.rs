//! # Address spaces and views
//!
//! A [`Vas`] is a set of non-overlapping [`View`]s. Each view attaches a
//! window of a page set at a page-aligned base address:
//!
//! ```text
//!   vas                          page set
//!   base ─┬──────────────┐       ┌────┬────┬────┬────┬────┐
//!         │ view page 0  │ ───►  │    │ s1 │ s2 │ s3 │    │
//!         │ view page 1  │       └────┴────┴────┴────┴────┘
//!         │ view page 2  │             ▲
//!         └──────────────┘          offset = 1
//! ```

use crate::addresses::{VasId, ViewId, VirtualAddress};
use crate::pset::PageSet;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::ids::Pid;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};
use kernel_sync::SpinMutex;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl Access {
    #[inline]
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Write)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Protection {
    pub writable: bool,
    /// Forked address spaces share the page set instead of copying it.
    pub shared: bool,
}

impl Protection {
    pub const READ: Self = Self {
        writable: false,
        shared: false,
    };
    pub const READ_WRITE: Self = Self {
        writable: true,
        shared: false,
    };
    pub const SHARED_READ_WRITE: Self = Self {
        writable: true,
        shared: true,
    };
}

pub struct View {
    id: ViewId,
    vas: VasId,
    base: VirtualAddress,
    pages: u32,
    offset: u32,
    pset: Arc<PageSet>,
    prot: Protection,
    detached: AtomicBool,
}

impl View {
    pub(crate) const fn new(
        id: ViewId,
        vas: VasId,
        base: VirtualAddress,
        pset: Arc<PageSet>,
        offset: u32,
        pages: u32,
        prot: Protection,
    ) -> Self {
        Self {
            id,
            vas,
            base,
            pages,
            offset,
            pset,
            prot,
            detached: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ViewId {
        self.id
    }

    #[must_use]
    pub const fn vas(&self) -> VasId {
        self.vas
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[must_use]
    pub const fn pages(&self) -> u32 {
        self.pages
    }

    /// First page-set slot covered by the view.
    #[must_use]
    pub const fn offset(&self) -> u32 {
        self.offset
    }

    #[must_use]
    pub const fn pset(&self) -> &Arc<PageSet> {
        &self.pset
    }

    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.prot
    }

    /// One past the last byte of the view.
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64() + ((self.pages as u64) << PAGE_SHIFT))
    }

    #[must_use]
    pub fn contains(&self, vaddr: VirtualAddress) -> bool {
        vaddr >= self.base && vaddr < self.end()
    }

    /// Page-set slot index backing `vaddr`, which must lie in the view.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn slot_of(&self, vaddr: VirtualAddress) -> u32 {
        debug_assert!(self.contains(vaddr));
        self.offset + ((vaddr.as_u64() - self.base.as_u64()) >> PAGE_SHIFT) as u32
    }

    /// Page address at which the view shows slot `index`.
    #[must_use]
    pub fn page_addr(&self, index: u32) -> VirtualAddress {
        debug_assert!(index >= self.offset && index < self.offset + self.pages);
        self.base + u64::from(index - self.offset) * PAGE_SIZE as u64
    }

    /// `false` if the view was already detached.
    pub(crate) fn mark_detached(&self) -> bool {
        !self.detached.swap(true, Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }
}

pub struct Vas {
    id: VasId,
    pid: Pid,
    dma_enabled: AtomicBool,
    views: SpinMutex<Vec<Arc<View>>>,
}

impl Vas {
    pub(crate) const fn new(id: VasId, pid: Pid) -> Self {
        Self {
            id,
            pid,
            dma_enabled: AtomicBool::new(false),
            views: SpinMutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub const fn id(&self) -> VasId {
        self.id
    }

    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn dma_enabled(&self) -> bool {
        self.dma_enabled.load(Ordering::Acquire)
    }

    pub(crate) fn enable_dma(&self) {
        self.dma_enabled.store(true, Ordering::Release);
    }

    /// The view covering `vaddr`.
    #[must_use]
    pub fn find(&self, vaddr: VirtualAddress) -> Option<Arc<View>> {
        self.views.lock().iter().find(|v| v.contains(vaddr)).cloned()
    }

    #[must_use]
    pub fn views(&self) -> Vec<Arc<View>> {
        self.views.lock().clone()
    }

    /// Insert unless it overlaps an existing view.
    pub(crate) fn insert(&self, view: Arc<View>) -> bool {
        let mut views = self.views.lock();
        let overlaps = views
            .iter()
            .any(|v| view.base() < v.end() && v.base() < view.end());
        if !overlaps {
            views.push(view);
        }
        !overlaps
    }

    pub(crate) fn remove(&self, id: ViewId) -> Option<Arc<View>> {
        let mut views = self.views.lock();
        let pos = views.iter().position(|v| v.id() == id)?;
        Some(views.swap_remove(pos))
    }
}
