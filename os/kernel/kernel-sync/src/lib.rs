//! # Kernel synchronization primitives
//!
//! * [`Mutex`] over a pluggable raw lock: [`RawSpin`] (test-and-test-and-set)
//!   or [`RawTicket`] (FIFO hand-off).
//! * [`IrqGuard`] and [`IrqMutexGuard`] for critical sections that must not be
//!   entered by an interrupt handler on the same CPU.
//! * [`Semaphore`], a FIFO-fair counting semaphore used for bounded pools and
//!   I/O completion waits.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod irq;
mod mutex;
mod raw_spin;
mod raw_ticket;
mod semaphore;

#[cfg(target_arch = "x86_64")]
pub use irq::X86Interrupts;
pub use irq::{InterruptControl, IrqGuard, IrqMutexGuard, NoInterrupts};
pub use mutex::{Mutex, MutexGuard};
pub use raw_spin::RawSpin;
pub use raw_ticket::RawTicket;
pub use semaphore::Semaphore;

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    /// Racy snapshot; only meaningful for assertions and diagnostics.
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    unsafe fn raw_unlock(&self);
}
