//! # Backing stores and swap
//!
//! External I/O collaborators. Calls may block; the memory core never makes
//! them while holding a spin lock.

use crate::error::IoError;
use crate::phys::PageFrame;
use alloc::boxed::Box;

/// An open connection to the object behind a file-backed page set.
pub trait BackingStore: Send + Sync {
    /// Read up to `len` bytes at byte `offset` into `buf`, returning the
    /// number of bytes read.
    ///
    /// # Errors
    /// Device or connection failure.
    fn read_page(&self, offset: u64, buf: &mut PageFrame, len: usize) -> Result<usize, IoError>;

    /// Write `len` bytes of `buf` at byte `offset`.
    ///
    /// # Errors
    /// Device or connection failure.
    fn write_page(&self, offset: u64, buf: &PageFrame, len: usize) -> Result<(), IoError>;

    /// Open a second, independent handle to the same object.
    ///
    /// # Errors
    /// The object cannot be reopened.
    fn dup(&self) -> Result<Box<dyn BackingStore>, IoError>;

    /// Close this handle. Other handles stay open.
    fn close(&self);
}

/// First page of an allocated swap area.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SwapBlock(pub u64);

impl SwapBlock {
    /// Block of page `index` within an area starting here.
    #[must_use]
    pub const fn page(self, index: u32) -> Self {
        Self(self.0 + index as u64)
    }
}

pub trait SwapDevice: Send + Sync {
    /// Reserve a contiguous area of `pages` pages.
    ///
    /// # Errors
    /// [`IoError::NoSpace`] when the device is full.
    fn alloc(&self, pages: u32) -> Result<SwapBlock, IoError>;

    fn free(&self, block: SwapBlock, pages: u32);

    /// # Errors
    /// Device failure.
    fn read_page(&self, block: SwapBlock, buf: &mut PageFrame) -> Result<(), IoError>;

    /// # Errors
    /// Device failure.
    fn write_page(&self, block: SwapBlock, buf: &PageFrame) -> Result<(), IoError>;
}
