//! # Address and identifier newtypes
//!
//! Physical and virtual addresses are kept apart at the type level, and
//! frames are named by their [`Pfn`] rather than by address.

use core::fmt;
use core::ops::Add;
use kernel_info::memory::{PAGE_SHIFT, PAGE_SIZE};

const PAGE_MASK: u64 = PAGE_SIZE as u64 - 1;

/// A physical memory address.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The frame containing this address.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        Pfn(self.0 >> PAGE_SHIFT)
    }

    /// Byte offset within the containing frame.
    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

/// A virtual address inside some address space.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Round down to the start of the page.
    #[inline]
    #[must_use]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self) -> u64 {
        self.0 & PAGE_MASK
    }

    #[inline]
    #[must_use]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

/// Page frame number: a physical address divided by the page size.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Physical address of the first byte in the frame.
    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        PhysicalAddress(self.0 << PAGE_SHIFT)
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pfn(0x{:X})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pfn 0x{:X}", self.0)
    }
}

macro_rules! arena_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
        pub struct $name(pub(crate) u32);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn as_u32(self) -> u32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($label, " {}"), self.0)
            }
        }
    };
}

arena_id!(
    /// Identifies a page set in the [`Vm`](crate::Vm) arena.
    PsetId,
    "pset"
);
arena_id!(
    /// Identifies an attached view.
    ViewId,
    "view"
);
arena_id!(
    /// Identifies an address space.
    VasId,
    "vas"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pfn_and_offset_split_an_address() {
        let pa = PhysicalAddress::new(0x0123_4567);
        assert_eq!(pa.pfn(), Pfn::new(0x1234));
        assert_eq!(pa.page_offset(), 0x567);
        assert_eq!(pa.pfn().base() + pa.page_offset(), pa);
    }

    #[test]
    fn virtual_page_base() {
        let va = VirtualAddress::new(0x4000_0fff);
        assert_eq!(va.page_base(), VirtualAddress::new(0x4000_0000));
        assert!(!va.is_page_aligned());
        assert!(va.page_base().is_page_aligned());
    }

    #[test]
    fn display_is_zero_padded_hex() {
        assert_eq!(
            PhysicalAddress::new(0x1000).to_string(),
            "0x0000000000001000"
        );
        assert_eq!(PsetId(7).to_string(), "pset 7");
    }
}
