//! # Access to physical frame contents
//!
//! Code can only dereference virtual addresses. A [`PhysMapper`] turns a
//! [`Pfn`] into a pointer in the current address space so the memory core can
//! zero, copy and transfer whole frames.
//!
//! * [`HhdmPhysMapper`]: every frame is visible at `base + pa` (higher-half
//!   direct map).
//! * [`HeapPhysMapper`]: frames are backed by heap memory. Used for hosted
//!   runs and tests.

use crate::addresses::Pfn;
use crate::error::IoError;
use crate::frame::{FrameTable, MemoryKind, MemoryRegion};
use crate::io::{SwapBlock, SwapDevice};
use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;
use kernel_info::memory::PAGE_SIZE;

/// The content of one physical page.
#[repr(C, align(4096))]
pub struct PageFrame(pub [u8; PAGE_SIZE]);

impl PageFrame {
    #[must_use]
    pub const fn zeroed() -> Self {
        Self([0; PAGE_SIZE])
    }

    #[inline]
    pub fn zero(&mut self) {
        self.0.fill(0);
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; PAGE_SIZE] {
        &self.0
    }

    #[inline]
    pub const fn as_bytes_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.0
    }
}

/// Translates a frame number into a dereferenceable pointer.
pub trait PhysMapper: Send + Sync {
    /// Pointer to the frame's content in the current address space.
    ///
    /// Obtaining the pointer is safe; dereferencing it requires that the
    /// frame is backed by memory and that the caller owns its content for
    /// the duration of the access.
    fn frame_ptr(&self, pfn: Pfn) -> NonNull<PageFrame>;
}

/// [`PhysMapper`] for kernels with a higher-half direct map.
pub struct HhdmPhysMapper {
    base: u64,
}

impl HhdmPhysMapper {
    /// # Safety
    /// All physical memory handed to the frame table must be mapped at
    /// `base + pa`, writable, for as long as the mapper is used.
    #[must_use]
    pub const unsafe fn new(base: u64) -> Self {
        Self { base }
    }
}

impl PhysMapper for HhdmPhysMapper {
    fn frame_ptr(&self, pfn: Pfn) -> NonNull<PageFrame> {
        let va = (self.base + pfn.base().as_u64()) as *mut PageFrame;
        NonNull::new(va).unwrap_or_else(|| panic!("direct map yields null for {pfn}"))
    }
}

struct HeapRegion {
    first: Pfn,
    frames: Box<[UnsafeCell<PageFrame>]>,
}

/// [`PhysMapper`] backed by heap allocations, one per usable memory region.
pub struct HeapPhysMapper {
    regions: Vec<HeapRegion>,
}

// SAFETY: Frame contents are only accessed through `frame_ptr`, whose callers
// serialize access per frame (slot lock or exclusive ownership).
unsafe impl Sync for HeapPhysMapper {}

impl HeapPhysMapper {
    /// Back every non-bad region of `map` with zeroed heap frames.
    #[must_use]
    pub fn from_memory_map(map: &[MemoryRegion]) -> Self {
        let regions = map
            .iter()
            .filter(|r| r.kind != MemoryKind::Bad && r.pages > 0)
            .map(|r| HeapRegion {
                first: r.start.pfn(),
                frames: (0..r.pages)
                    .map(|_| UnsafeCell::new(PageFrame::zeroed()))
                    .collect(),
            })
            .collect();
        Self { regions }
    }
}

impl PhysMapper for HeapPhysMapper {
    fn frame_ptr(&self, pfn: Pfn) -> NonNull<PageFrame> {
        let region = self
            .regions
            .iter()
            .find(|r| {
                pfn.as_u64() >= r.first.as_u64()
                    && pfn.as_u64() - r.first.as_u64() < r.frames.len() as u64
            })
            .unwrap_or_else(|| panic!("{pfn} is not backed by the heap mapper"));
        #[allow(clippy::cast_possible_truncation)]
        let cell = &region.frames[(pfn.as_u64() - region.first.as_u64()) as usize];
        // SAFETY: UnsafeCell::get never returns null.
        unsafe { NonNull::new_unchecked(cell.get()) }
    }
}

/// Physical memory as seen by the paging core: the frame table, a way to
/// reach frame contents, and the swap device.
pub struct Physical {
    pub frames: FrameTable,
    mapper: Box<dyn PhysMapper>,
    swap: Arc<dyn SwapDevice>,
}

impl Physical {
    #[must_use]
    pub fn new(frames: FrameTable, mapper: Box<dyn PhysMapper>, swap: Arc<dyn SwapDevice>) -> Self {
        Self {
            frames,
            mapper,
            swap,
        }
    }

    #[must_use]
    pub fn swap(&self) -> &dyn SwapDevice {
        &*self.swap
    }

    /// # Safety
    /// No one may write the frame while the reference lives: the caller holds
    /// the lock of the slot the frame backs, or the frame is private to it.
    #[must_use]
    pub unsafe fn frame(&self, pfn: Pfn) -> &PageFrame {
        // SAFETY: Upheld by the caller.
        unsafe { self.mapper.frame_ptr(pfn).as_ref() }
    }

    /// # Safety
    /// The caller has exclusive access to the frame content: it holds the
    /// lock of the slot the frame backs, or the frame is private to it.
    #[allow(clippy::mut_from_ref)]
    #[must_use]
    pub unsafe fn frame_mut(&self, pfn: Pfn) -> &mut PageFrame {
        // SAFETY: Upheld by the caller.
        unsafe { self.mapper.frame_ptr(pfn).as_mut() }
    }

    /// # Safety
    /// As for [`frame_mut`](Self::frame_mut).
    pub unsafe fn zero(&self, pfn: Pfn) {
        // SAFETY: Upheld by the caller.
        unsafe { self.frame_mut(pfn) }.zero();
    }

    /// Copy the whole content of `src` into `dst`.
    ///
    /// # Safety
    /// As for [`frame`](Self::frame) on `src` and [`frame_mut`](Self::frame_mut) on `dst`.
    pub unsafe fn copy(&self, src: Pfn, dst: Pfn) {
        assert_ne!(src, dst, "copying {src} onto itself");
        // SAFETY: Upheld by the caller; distinct frames do not overlap.
        unsafe { self.frame_mut(dst).0.copy_from_slice(&self.frame(src).0) };
    }

    /// # Safety
    /// As for [`frame_mut`](Self::frame_mut).
    pub(crate) unsafe fn swap_in(&self, block: SwapBlock, pfn: Pfn) -> Result<(), IoError> {
        // SAFETY: Upheld by the caller.
        self.swap.read_page(block, unsafe { self.frame_mut(pfn) })
    }

    /// # Safety
    /// As for [`frame`](Self::frame).
    pub(crate) unsafe fn swap_out(&self, block: SwapBlock, pfn: Pfn) -> Result<(), IoError> {
        // SAFETY: Upheld by the caller.
        self.swap.write_page(block, unsafe { self.frame(pfn) })
    }
}
