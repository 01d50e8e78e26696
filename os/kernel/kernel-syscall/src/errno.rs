use kernel_sched::SchedError;
use kernel_vm::VmError;

/// Error numbers returned to user space as `-errno` in `rax`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
#[repr(u64)]
pub enum Errno {
    #[error("operation not permitted")]
    Perm = 1,
    #[error("no such thread")]
    Srch = 3,
    #[error("I/O error")]
    Io = 5,
    #[error("out of memory")]
    NoMem = 12,
    #[error("bad address")]
    Fault = 14,
    #[error("resource busy")]
    Busy = 16,
    #[error("invalid argument")]
    Inval = 22,
    #[error("unknown syscall")]
    NoSys = 38,
}

impl Errno {
    /// Two's complement encoding placed in `rax`.
    #[must_use]
    pub const fn to_return(self) -> u64 {
        (self as u64).wrapping_neg()
    }

    /// Inverse of [`to_return`](Self::to_return) for values in the error range.
    #[must_use]
    pub const fn from_return(rax: u64) -> Option<Self> {
        Some(match rax.wrapping_neg() {
            1 => Self::Perm,
            3 => Self::Srch,
            5 => Self::Io,
            12 => Self::NoMem,
            14 => Self::Fault,
            16 => Self::Busy,
            22 => Self::Inval,
            38 => Self::NoSys,
            _ => return None,
        })
    }
}

impl From<VmError> for Errno {
    fn from(e: VmError) -> Self {
        match e {
            VmError::OutOfMemory => Self::NoMem,
            VmError::Fault(_) => Self::Fault,
            VmError::Busy => Self::Busy,
            VmError::Permission => Self::Perm,
            VmError::InvalidArgument => Self::Inval,
            VmError::Io(_) => Self::Io,
        }
    }
}

impl From<SchedError> for Errno {
    fn from(e: SchedError) -> Self {
        match e {
            SchedError::NoSuchThread(_) => Self::Srch,
            SchedError::CpuBusy(_) => Self::Busy,
            SchedError::NoSuchNode(_)
            | SchedError::NotAGroup(_)
            | SchedError::NoSuchCpu(_)
            | SchedError::InvalidState
            | SchedError::InvalidWeight(_)
            | SchedError::NotRunning(_) => Self::Inval,
        }
    }
}
