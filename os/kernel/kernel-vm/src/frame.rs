//! # Page Frame Table
//!
//! One [`FrameEntry`] per physical page, held in a flat arena indexed by
//! [`Pfn`]. Each entry sits behind its own spin lock; the free list has a
//! separate lock and threads through the entries of free frames.
//!
//! ## Frame states
//!
//! ```text
//!            allocate()                 set_owner()
//!   Free ─────────────────► Private ─────────────────► PageSet(pset, slot)
//!    ▲                        │  ▲                         │
//!    └────────── free() ──────┘  └────── clear_owner() ────┘
//!
//!   System(word)   reserved at boot, never allocated
//!   hw_error       bad RAM, never on the free list
//! ```
//!
//! ## Lock order
//!
//! slot lock → free-list lock → frame lock. Code that only knows a frame
//! (the page clock) reads the owner under the frame lock, drops it, then
//! takes the slot lock and re-validates.
//!
//! The free list hands out high memory first so that frames below the DMA
//! ceiling stay available for wiring.

use crate::addresses::{Pfn, PhysicalAddress, PsetId};
use crate::atl::AttachList;
use crate::error::FrameError;
use alloc::boxed::Box;
use bitfield_struct::bitfield;
use kernel_sync::{MutexGuard, RawSpin, SpinMutex};
use log::trace;

/// Per-frame flag word.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FrameFlags {
    /// Hardware reported the page unusable.
    pub hw_error: bool,
    /// Reserved for the kernel; never handed out.
    pub system: bool,
    /// Pinned for DMA; must not be evicted or migrated.
    pub wired: bool,
    /// Taken off the free list.
    pub allocated: bool,
    #[bits(4)]
    __: u8,
}

/// Who a frame belongs to. The active variant tracks [`FrameFlags`]:
/// `allocated` clear means `Free`, `system` set means `System`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOwner {
    /// On (or about to join) the free list.
    Free { next: Option<Pfn> },
    /// Kernel-reserved page with an opaque tag from the memory map.
    System(u32),
    /// Allocated but not committed to a slot (fill in progress, copy target).
    Private,
    /// Backs a slot of a page set; the slot index is [`FrameEntry::slot`].
    PageSet(PsetId),
}

#[derive(Debug)]
pub struct FrameEntry {
    flags: FrameFlags,
    slot: u32,
    owner: FrameOwner,
    attach: AttachList,
}

impl FrameEntry {
    const fn new(flags: FrameFlags, owner: FrameOwner) -> Self {
        Self {
            flags,
            slot: 0,
            owner,
            attach: AttachList::new(),
        }
    }

    #[inline]
    #[must_use]
    pub const fn flags(&self) -> FrameFlags {
        self.flags
    }

    #[inline]
    #[must_use]
    pub const fn owner(&self) -> FrameOwner {
        self.owner
    }

    /// Owning page set and slot index, if the frame backs a slot.
    #[must_use]
    pub const fn page_set(&self) -> Option<(PsetId, u32)> {
        match self.owner {
            FrameOwner::PageSet(pset) => Some((pset, self.slot)),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub const fn attach(&self) -> &AttachList {
        &self.attach
    }

    #[inline]
    pub const fn attach_mut(&mut self) -> &mut AttachList {
        &mut self.attach
    }

    /// Commit a privately held frame to `slot` of `pset`.
    pub fn set_owner(&mut self, pset: PsetId, slot: u32) {
        assert!(
            self.owner == FrameOwner::Private,
            "set_owner on frame in state {:?}",
            self.owner
        );
        self.owner = FrameOwner::PageSet(pset);
        self.slot = slot;
    }

    /// Detach the frame from its slot so it can be freed.
    pub fn clear_owner(&mut self) {
        assert!(
            matches!(self.owner, FrameOwner::PageSet(_)),
            "clear_owner on frame in state {:?}",
            self.owner
        );
        assert!(
            self.attach.is_empty(),
            "clear_owner on frame with {} attach nodes",
            self.attach.len()
        );
        self.owner = FrameOwner::Private;
        self.slot = 0;
    }

    pub fn set_wired(&mut self, wired: bool) {
        debug_assert!(self.flags.allocated());
        self.flags.set_wired(wired);
    }

    fn check(&self) {
        debug_assert_eq!(
            self.flags.allocated(),
            !matches!(self.owner, FrameOwner::Free { .. }),
            "allocated flag disagrees with owner {:?}",
            self.owner
        );
        debug_assert_eq!(
            self.flags.system(),
            matches!(self.owner, FrameOwner::System(_))
        );
    }
}

/// Guard over a locked frame entry. Dropping it unlocks the frame.
pub type FrameGuard<'a> = MutexGuard<'a, FrameEntry, RawSpin>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemoryKind {
    Usable,
    /// Kernel-reserved; the tag is stored in [`FrameOwner::System`].
    Reserved(u32),
    Bad,
}

/// One entry of the boot memory map.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysicalAddress,
    pub pages: u64,
    pub kind: MemoryKind,
}

impl MemoryRegion {
    #[must_use]
    pub const fn usable(start: PhysicalAddress, pages: u64) -> Self {
        Self {
            start,
            pages,
            kind: MemoryKind::Usable,
        }
    }

    #[must_use]
    pub const fn reserved(start: PhysicalAddress, pages: u64, tag: u32) -> Self {
        Self {
            start,
            pages,
            kind: MemoryKind::Reserved(tag),
        }
    }

    #[must_use]
    pub const fn bad(start: PhysicalAddress, pages: u64) -> Self {
        Self {
            start,
            pages,
            kind: MemoryKind::Bad,
        }
    }
}

struct FreeList {
    head: Option<Pfn>,
    count: usize,
}

pub struct FrameTable {
    first: Pfn,
    entries: Box<[SpinMutex<FrameEntry>]>,
    free: SpinMutex<FreeList>,
}

impl FrameTable {
    /// Build the table covering the span of `map`.
    ///
    /// Holes between regions are treated like bad memory.
    #[must_use]
    pub fn from_memory_map(map: &[MemoryRegion]) -> Self {
        let first = map.iter().map(|r| r.start.pfn().as_u64()).min().unwrap_or(0);
        let end = map
            .iter()
            .map(|r| r.start.pfn().as_u64() + r.pages)
            .max()
            .unwrap_or(0);

        let hole = || {
            FrameEntry::new(
                FrameFlags::new().with_hw_error(true).with_allocated(true),
                FrameOwner::Private,
            )
        };
        let mut entries: Box<[SpinMutex<FrameEntry>]> =
            (first..end).map(|_| SpinMutex::new(hole())).collect();

        let mut usable = 0usize;
        for region in map {
            let start = region.start.pfn().as_u64() - first;
            for i in start..start + region.pages {
                #[allow(clippy::cast_possible_truncation)]
                let entry = entries[i as usize].get_mut();
                *entry = match region.kind {
                    MemoryKind::Usable => {
                        usable += 1;
                        FrameEntry::new(FrameFlags::new(), FrameOwner::Free { next: None })
                    }
                    MemoryKind::Reserved(tag) => FrameEntry::new(
                        FrameFlags::new().with_system(true).with_allocated(true),
                        FrameOwner::System(tag),
                    ),
                    MemoryKind::Bad => hole(),
                };
            }
        }

        // Thread the list from the top so the head is the highest frame.
        let mut head = None;
        for (i, slot) in entries.iter_mut().enumerate() {
            let entry = slot.get_mut();
            if let FrameOwner::Free { next } = &mut entry.owner {
                *next = head;
                head = Some(Pfn::new(first + i as u64));
            }
        }

        trace!(
            "frame table: {} frames from {}, {usable} usable",
            entries.len(),
            Pfn::new(first)
        );
        Self {
            first: Pfn::new(first),
            entries,
            free: SpinMutex::new(FreeList {
                head,
                count: usable,
            }),
        }
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free.lock().count
    }

    #[must_use]
    pub fn contains(&self, pfn: Pfn) -> bool {
        pfn.as_u64() >= self.first.as_u64()
            && pfn.as_u64() - self.first.as_u64() < self.entries.len() as u64
    }

    /// Frame number of the `i`-th table entry.
    #[must_use]
    pub const fn pfn_at(&self, i: usize) -> Pfn {
        Pfn::new(self.first.as_u64() + i as u64)
    }

    fn entry(&self, pfn: Pfn) -> &SpinMutex<FrameEntry> {
        assert!(self.contains(pfn), "{pfn} is outside the frame table");
        #[allow(clippy::cast_possible_truncation)]
        &self.entries[(pfn.as_u64() - self.first.as_u64()) as usize]
    }

    /// Acquire the frame's lock.
    #[must_use]
    pub fn lock(&self, pfn: Pfn) -> FrameGuard<'_> {
        self.entry(pfn).lock()
    }

    /// Pop a frame off the free list. The frame comes back [`FrameOwner::Private`].
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] when no frame is free.
    pub fn allocate(&self) -> Result<Pfn, FrameError> {
        let mut list = self.free.lock();
        let pfn = list.head.ok_or(FrameError::OutOfMemory)?;
        let mut entry = self.lock(pfn);
        let FrameOwner::Free { next } = entry.owner else {
            panic!("{pfn} on the free list is in state {:?}", entry.owner);
        };
        list.head = next;
        list.count -= 1;
        take(&mut entry);
        Ok(pfn)
    }

    /// Take the first free frame for which `pred` holds.
    ///
    /// # Errors
    /// [`FrameError::OutOfMemory`] when no frame is free at all,
    /// [`FrameError::NoMatch`] when none of the free frames qualifies.
    pub fn allocate_matching(&self, pred: impl Fn(Pfn) -> bool) -> Result<Pfn, FrameError> {
        let mut list = self.free.lock();
        if list.head.is_none() {
            return Err(FrameError::OutOfMemory);
        }

        let mut prev: Option<Pfn> = None;
        let mut cursor = list.head;
        while let Some(pfn) = cursor {
            let mut entry = self.lock(pfn);
            let FrameOwner::Free { next } = entry.owner else {
                panic!("{pfn} on the free list is in state {:?}", entry.owner);
            };
            if pred(pfn) {
                take(&mut entry);
                drop(entry);
                match prev {
                    None => list.head = next,
                    Some(prev) => self.lock(prev).owner = FrameOwner::Free { next },
                }
                list.count -= 1;
                return Ok(pfn);
            }
            prev = Some(pfn);
            cursor = next;
        }
        Err(FrameError::NoMatch)
    }

    /// Return a [`FrameOwner::Private`] frame to the free list.
    ///
    /// # Panics
    /// If the frame is owned by a page set, reserved, wired, or still carries
    /// attach-list nodes. Each of these is a bookkeeping error in the caller.
    pub fn free(&self, pfn: Pfn) {
        let mut list = self.free.lock();
        let mut entry = self.lock(pfn);
        assert!(
            entry.owner == FrameOwner::Private && !entry.flags.hw_error(),
            "freeing {pfn} in state {:?}",
            entry.owner
        );
        assert!(!entry.flags.wired(), "freeing wired {pfn}");
        assert!(
            entry.attach.is_empty(),
            "freeing {pfn} with {} attach nodes",
            entry.attach.len()
        );
        entry.flags = FrameFlags::new();
        entry.owner = FrameOwner::Free { next: list.head };
        entry.check();
        list.head = Some(pfn);
        list.count += 1;
    }
}

fn take(entry: &mut FrameEntry) {
    entry.flags.set_allocated(true);
    entry.owner = FrameOwner::Private;
    entry.slot = 0;
    entry.check();
}
