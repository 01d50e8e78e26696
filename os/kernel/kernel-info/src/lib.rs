//! # Kernel Configuration
//!
//! Compile-time configuration shared by the memory and scheduling subsystems.
//! This crate is the single source of truth for the constants that size the
//! physical page pool, the DMA wiring pool and the scheduler's time slices.
//!
//! ## Modules
//!
//! ### Identifiers ([`ids`])
//! * [`Pid`](ids::Pid), shared by the wiring pool and the scheduler's process accounts
//!
//! ### Memory ([`memory`])
//! * **Paging granularity**: [`PAGE_SIZE`](memory::PAGE_SIZE) and [`PAGE_SHIFT`](memory::PAGE_SHIFT)
//! * **Legacy DMA**: the [`DMA_PHYS_LIMIT`](memory::DMA_PHYS_LIMIT) ceiling below which
//!   ISA-style bus masters can address memory
//! * **Wiring**: the system-wide ceiling on simultaneously pinned pages
//!
//! ### Scheduling ([`sched`])
//! * **Quantum**: ticks a thread may run per dispatch
//! * **Cheating**: how much unused quantum earns a thread the cheated class
//! * **Weights**: default and maximum priority weights of scheduler nodes
//!
//! ```text
//! Physical Memory (wiring view):
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │  DMA-reachable (< 16 MiB)       │  ← page_wire(.., dma_low = true)
//! 0x0100_0000 ├─────────────────────────────────┤     migrates pages here
//!             │  General RAM                    │
//!             └─────────────────────────────────┘
//! ```
//!
//! Runtime configuration structs in the consuming crates (`VmConfig`,
//! `SchedConfig`) default to these values.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod ids;
pub mod memory;
pub mod sched;
