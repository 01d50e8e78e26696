//! # Paged memory core
//!
//! Demand paging over a Page Frame Table, with pluggable page-set variants,
//! copy-on-write fork, eviction and DMA page wiring.
//!
//! ```text
//!  ┌───────────────────────────────────────────────────────┐
//!  │ Vas ── View ── View            (vas, vm)              │
//!  │          │      │   fault / read / write / fork       │
//!  └──────────┼──────┼─────────────────────────────────────┘
//!             ▼      ▼
//!  ┌───────────────────────────────────────────────────────┐
//!  │ PageSet: slots + FillPolicy    (pset, policy)         │
//!  │   ZeroFill │ FileBacked │ CopyOnWrite                 │
//!  └──────────┬────────────────────────────────────────────┘
//!             ▼
//!  ┌───────────────────────────────────────────────────────┐
//!  │ FrameTable: per-frame entry + AttachList (frame, atl) │
//!  └───────────────────────────────────────────────────────┘
//! ```
//!
//! External collaborators are traits: [`Hat`] installs translations,
//! [`BackingStore`] and [`SwapDevice`] move page contents, [`PhysMapper`]
//! makes frames addressable.
//!
//! ## Locking
//!
//! Slot lock → free-list lock → frame lock. Spin locks are never held across
//! a fill-policy call; a slot in transit is owned by the thread that set the
//! flag and everyone else waits on the slot's semaphore.
//!
//! ## Example
//!
//! ```
//! # use std::sync::Arc;
//! # use kernel_vm::*;
//! # use kernel_info::ids::Pid;
//! # struct NoHat;
//! # impl Hat for NoHat {
//! #     fn add_translation(&self, _: ViewId, _: VirtualAddress, _: Pfn, _: bool) {}
//! #     fn remove_translation(&self, _: ViewId, _: VirtualAddress, _: Pfn) {}
//! # }
//! # struct NoSwap;
//! # impl SwapDevice for NoSwap {
//! #     fn alloc(&self, _: u32) -> Result<SwapBlock, IoError> { Err(IoError::NoSpace) }
//! #     fn free(&self, _: SwapBlock, _: u32) {}
//! #     fn read_page(&self, _: SwapBlock, _: &mut PageFrame) -> Result<(), IoError> { Err(IoError::Failed) }
//! #     fn write_page(&self, _: SwapBlock, _: &PageFrame) -> Result<(), IoError> { Err(IoError::Failed) }
//! # }
//! let map = [MemoryRegion::usable(PhysicalAddress::new(0x10_0000), 16)];
//! let vm = Vm::new(
//!     VmConfig::default(),
//!     &map,
//!     Box::new(HeapPhysMapper::from_memory_map(&map)),
//!     Arc::new(NoHat),
//!     Arc::new(NoSwap),
//! );
//!
//! let vas = vm.create_vas(Pid(1));
//! let pset = vm.create_zero_fill(4).unwrap();
//! let base = VirtualAddress::new(0x4000_0000);
//! vm.attach(vas, pset, base, 0, 4, Protection::READ_WRITE).unwrap();
//! vm.release_pset(pset).unwrap();
//!
//! vm.write(vas, base + 10, b"hello").unwrap();
//! let mut buf = [0; 5];
//! vm.read(vas, base + 10, &mut buf).unwrap();
//! assert_eq!(&buf, b"hello");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod addresses;
pub mod atl;
mod error;
mod evict;
pub mod frame;
mod hat;
mod io;
pub mod phys;
pub mod policy;
pub mod pset;
pub mod vas;
mod vm;
mod wire;

pub use addresses::{Pfn, PhysicalAddress, PsetId, VasId, ViewId, VirtualAddress};
pub use error::{AtlError, FaultKind, FrameError, IoError, VmError};
pub use evict::{Evicted, ScanStats};
pub use frame::{MemoryKind, MemoryRegion};
pub use hat::Hat;
pub use io::{BackingStore, SwapBlock, SwapDevice};
pub use phys::{HeapPhysMapper, HhdmPhysMapper, PageFrame, PhysMapper};
pub use policy::Written;
pub use pset::{PsetKind, SlotFlags};
pub use vas::{Access, Protection};
pub use vm::{SlotInfo, Vm, VmConfig};
pub use wire::{WireHandle, Wired};
