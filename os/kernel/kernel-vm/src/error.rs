//! # Error types of the paged memory core

use crate::addresses::ViewId;

/// Failure of an external I/O collaborator (backing store or swap device).
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IoError {
    #[error("device reported an I/O failure")]
    Failed,
    #[error("short read: got {got} of {want} bytes")]
    ShortRead { got: usize, want: usize },
    #[error("connection is closed")]
    Closed,
    #[error("swap space exhausted")]
    NoSpace,
}

/// Why a page fault could not be resolved.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FaultKind {
    /// No view covers the address, or the view was detached meanwhile.
    #[error("address is not mapped")]
    Unmapped,
    /// A write hit a read-only view.
    #[error("access violates view protection")]
    Protection,
    /// The slot is marked bad.
    #[error("page is marked bad")]
    BadPage,
    /// The fill policy could not produce the page content.
    #[error("page fill failed: {0}")]
    Io(IoError),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("page fault: {0}")]
    Fault(FaultKind),
    #[error("resource busy")]
    Busy,
    #[error("permission denied")]
    Permission,
    #[error("invalid argument")]
    InvalidArgument,
    /// Write-back to swap failed. Fill failures are reported as [`FaultKind::Io`].
    #[error("I/O error: {0}")]
    Io(IoError),
}

impl From<FrameError> for VmError {
    fn from(_: FrameError) -> Self {
        Self::OutOfMemory
    }
}

impl From<FaultKind> for VmError {
    fn from(kind: FaultKind) -> Self {
        Self::Fault(kind)
    }
}

/// Frame allocator failures.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("no free frames")]
    OutOfMemory,
    #[error("no free frame satisfies the constraint")]
    NoMatch,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AtlError {
    #[error("no mapping node for {view} at slot {index}")]
    NotFound { view: ViewId, index: u32 },
}
