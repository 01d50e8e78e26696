//! # Memory Layout

/// Size of a physical frame and of a virtual page, in bytes.
pub const PAGE_SIZE: usize = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

/// First physical address that legacy (24-bit) DMA engines cannot reach.
///
/// Pages wired with the low-memory constraint must live entirely below it.
pub const DMA_PHYS_LIMIT: u64 = 16 * 1024 * 1024; // 16 MiB

/// Number of page frames below [`DMA_PHYS_LIMIT`].
pub const DMA_FRAME_LIMIT: u64 = DMA_PHYS_LIMIT >> PAGE_SHIFT;

/// Maximum number of pages wired for I/O at the same time, system-wide.
pub const WIRE_POOL_SIZE: usize = 32;

const _: () = {
    assert!(PAGE_SIZE == 1 << PAGE_SHIFT);
    assert!(DMA_PHYS_LIMIT.is_multiple_of(PAGE_SIZE as u64));
    assert!(WIRE_POOL_SIZE > 0);
};

/// Distance, in frames, between the front and back hands of the page clock.
///
/// Clamped to half the frame table on small machines.
pub const CLOCK_HAND_GAP: usize = 256;
