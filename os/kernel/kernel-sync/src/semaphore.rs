use core::hint::spin_loop;
use core::sync::atomic::{AtomicUsize, Ordering};

/// FIFO-fair counting semaphore.
///
/// Every [`acquire`](Self::acquire) draws a ticket; ticket `t` may proceed
/// once `t < grants`, where `grants` starts at the initial permit count and
/// grows by one per [`release`](Self::release). Waiters are therefore served
/// strictly in arrival order, and a release that happens before the matching
/// acquire is never lost.
///
/// Counters wrap; comparisons are done on the signed distance.
pub struct Semaphore {
    next: AtomicUsize,
    grants: AtomicUsize,
}

impl Semaphore {
    #[must_use]
    pub const fn new(permits: usize) -> Self {
        Self {
            next: AtomicUsize::new(0),
            grants: AtomicUsize::new(permits),
        }
    }

    #[inline]
    const fn admits(grants: usize, ticket: usize) -> bool {
        #[allow(clippy::cast_possible_wrap)]
        let distance = grants.wrapping_sub(ticket) as isize;
        distance > 0
    }

    /// Take one permit, waiting in FIFO order if none is available.
    pub fn acquire(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while !Self::admits(self.grants.load(Ordering::Acquire), ticket) {
            spin_loop();
        }
    }

    /// Take one permit if one is free *and* nobody is queued ahead of us.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut ticket = self.next.load(Ordering::Relaxed);
        loop {
            if !Self::admits(self.grants.load(Ordering::Acquire), ticket) {
                return false;
            }
            match self.next.compare_exchange_weak(
                ticket,
                ticket.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => ticket = current,
            }
        }
    }

    /// Return one permit, waking the oldest waiter if any.
    #[inline]
    pub fn release(&self) {
        self.release_n(1);
    }

    /// Return `n` permits at once.
    #[inline]
    pub fn release_n(&self, n: usize) {
        if n > 0 {
            self.grants.fetch_add(n, Ordering::Release);
        }
    }

    /// Free permits (positive) or queued waiters (negative). Racy snapshot.
    #[must_use]
    pub fn available(&self) -> isize {
        #[allow(clippy::cast_possible_wrap)]
        let v = self
            .grants
            .load(Ordering::Relaxed)
            .wrapping_sub(self.next.load(Ordering::Relaxed)) as isize;
        v
    }
}
