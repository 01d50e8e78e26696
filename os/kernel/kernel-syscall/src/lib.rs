//! # Syscall surface
//!
//! The entry points user space reaches through the trap gate:
//!
//! | `rax` | call           | arguments                       | returns                  |
//! |-------|----------------|---------------------------------|--------------------------|
//! | 1     | `page_wire`    | `rdi` vaddr, `rsi` dma-low flag | handle, `rdx` phys addr  |
//! | 2     | `page_release` | `rdi` handle                    | 0                        |
//! | 3     | `enable_dma`   | none (privileged)               | 0                        |
//! | 4     | `sched_op`     | `rdi` [`SchedOp`], `rsi` arg    | operation result         |
//!
//! Failures come back as `-errno` in `rax`, see [`Errno`]. Thread and
//! process teardown is driven from here as well, since it spans the
//! scheduler and the memory core.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

mod errno;
mod kernel;
mod syscall;

pub use errno::Errno;
pub use kernel::{Caller, Kernel};
pub use syscall::{Reply, SchedOp, Sysno, TrapFrame};
