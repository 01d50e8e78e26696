//! # Identifiers shared between subsystems

use core::fmt;

/// Process identifier.
///
/// Owned by the process layer; the memory subsystem records it on wire
/// records and the scheduler on thread accounts.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}
