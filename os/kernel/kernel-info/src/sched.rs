//! # Scheduler Tuning

/// Clock ticks a thread may run per dispatch before it is forced to reschedule.
pub const QUANTUM_TICKS: u32 = 10;

/// A thread giving up the CPU with at least this many ticks left in its
/// quantum is credited as "cheated" on its next wakeup.
pub const CHEAT_THRESHOLD_TICKS: u32 = QUANTUM_TICKS / 2;

/// Weight given to scheduler nodes that do not ask for one.
pub const DEFAULT_WEIGHT: u32 = 10;

/// Largest accepted node weight.
pub const MAX_WEIGHT: u32 = 1000;

/// Per-thread profiling ring size, in samples.
pub const PROFILE_SAMPLES: usize = 64;

const _: () = {
    assert!(QUANTUM_TICKS > 0);
    assert!(CHEAT_THRESHOLD_TICKS <= QUANTUM_TICKS);
    assert!(DEFAULT_WEIGHT > 0 && DEFAULT_WEIGHT <= MAX_WEIGHT);
    assert!(PROFILE_SAMPLES > 0);
};
