use crate::{Mutex, MutexGuard, RawLock, RawUnlock};
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

/// Backend that can mask and unmask interrupts on the current CPU.
///
/// The kernel uses [`X86Interrupts`]; hosted builds and tests use
/// [`NoInterrupts`], where there is no interrupt to mask and the guard is
/// purely a marker for a section that must not be preempted.
pub trait InterruptControl {
    /// Disables interrupts and returns whether they were enabled before.
    fn disable() -> bool;

    /// Re-enables interrupts if `was_enabled` is set.
    fn restore(was_enabled: bool);
}

/// Interrupt control for code that never runs with interrupts (hosted, tests).
pub struct NoInterrupts;

impl InterruptControl for NoInterrupts {
    #[inline]
    fn disable() -> bool {
        false
    }

    #[inline]
    fn restore(_was_enabled: bool) {}
}

/// `cli`/`sti` on the local CPU.
///
/// # Safety & Privilege
///
/// Must only be used in contexts where `cli`/`sti` are legal (ring 0).
#[cfg(target_arch = "x86_64")]
pub struct X86Interrupts;

#[cfg(target_arch = "x86_64")]
impl InterruptControl for X86Interrupts {
    #[inline]
    fn disable() -> bool {
        let enabled = (rflags() & (1 << 9)) != 0;
        if enabled {
            unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
        }
        enabled
    }

    #[inline]
    fn restore(was_enabled: bool) {
        if was_enabled {
            unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
        }
    }
}

/// Returns the current `RFLAGS` value (via `pushfq/pop`).
///
/// Bit 9 (`IF`) indicates whether interrupts are enabled.
#[cfg(target_arch = "x86_64")]
#[inline]
#[must_use]
pub fn rflags() -> u64 {
    let r: u64;
    unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
    r
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are re-enabled on drop **only** if they were enabled when the
/// guard was created, so guards nest.
pub struct IrqGuard<I: InterruptControl> {
    were_enabled: bool,
    _backend: PhantomData<I>,
}

impl<I: InterruptControl> Default for IrqGuard<I> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I: InterruptControl> IrqGuard<I> {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            were_enabled: I::disable(),
            _backend: PhantomData,
        }
    }
}

impl<I: InterruptControl> Drop for IrqGuard<I> {
    fn drop(&mut self) {
        I::restore(self.were_enabled);
    }
}

/// A mutex guard that also keeps interrupts disabled while held.
///
/// Created by [`Mutex::lock_irq`]. The lock is released before interrupts
/// are restored (fields drop in declaration order).
pub struct IrqMutexGuard<'a, T, R: RawLock + RawUnlock, I: InterruptControl> {
    guard: MutexGuard<'a, T, R>,
    _irq: IrqGuard<I>,
}

impl<T, R: RawLock + RawUnlock> Mutex<T, R> {
    /// Disables interrupts, then acquires the mutex.
    ///
    /// This is the only way the run queue is locked: a clock interrupt on this
    /// CPU can never observe (or deadlock on) a half-updated structure.
    #[inline]
    pub fn lock_irq<I: InterruptControl>(&self) -> IrqMutexGuard<'_, T, R, I> {
        let irq = IrqGuard::new();
        let guard = self.lock();
        IrqMutexGuard { guard, _irq: irq }
    }
}

impl<T, R: RawLock + RawUnlock, I: InterruptControl> Deref for IrqMutexGuard<'_, T, R, I> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T, R: RawLock + RawUnlock, I: InterruptControl> DerefMut for IrqMutexGuard<'_, T, R, I> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
