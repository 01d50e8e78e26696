//! Syscall numbers and the register frame they arrive in.

/// Syscall number, passed in `rax`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u64)]
pub enum Sysno {
    /// `rdi`: virtual address, `rsi`: nonzero to require a frame below the
    /// DMA limit. Returns the wire handle in `rax` and the physical address
    /// in `rdx`.
    PageWire = 1,
    /// `rdi`: wire handle.
    PageRelease = 2,
    /// Privileged. Lets the caller's address space wire pages.
    EnableDma = 3,
    /// `rdi`: [`SchedOp`], `rsi`: argument.
    SchedOp = 4,
}

impl TryFrom<u64> for Sysno {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::PageWire,
            2 => Self::PageRelease,
            3 => Self::EnableDma,
            4 => Self::SchedOp,
            other => return Err(other),
        })
    }
}

/// Operation selector of [`Sysno::SchedOp`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u64)]
pub enum SchedOp {
    /// Set the calling thread's weight to the argument.
    SetPriority = 0,
    GetPriority = 1,
    Yield = 2,
    /// Returns 1 if no non-ephemeral thread of the process is left.
    MarkEphemeral = 3,
    ProfileEnable = 4,
    ProfileDisable = 5,
}

impl TryFrom<u64> for SchedOp {
    type Error = u64;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::SetPriority,
            1 => Self::GetPriority,
            2 => Self::Yield,
            3 => Self::MarkEphemeral,
            4 => Self::ProfileEnable,
            5 => Self::ProfileDisable,
            other => return Err(other),
        })
    }
}

/// The registers a syscall reads and writes (SysV order for arguments).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct TrapFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
}

impl TrapFrame {
    #[must_use]
    pub const fn new(sysno: u64, args: [u64; 3]) -> Self {
        Self {
            rax: sysno,
            rdi: args[0],
            rsi: args[1],
            rdx: args[2],
        }
    }

    #[must_use]
    pub const fn args(&self) -> [u64; 3] {
        [self.rdi, self.rsi, self.rdx]
    }
}

/// Values handed back in `rax` and `rdx`.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct Reply {
    pub value: u64,
    pub extra: u64,
}

impl From<u64> for Reply {
    fn from(value: u64) -> Self {
        Self { value, extra: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers_decode() {
        assert_eq!(Sysno::try_from(Sysno::SchedOp as u64), Ok(Sysno::SchedOp));
        assert_eq!(Sysno::try_from(0), Err(0));
        assert_eq!(SchedOp::try_from(SchedOp::ProfileDisable as u64), Ok(SchedOp::ProfileDisable));
        assert_eq!(SchedOp::try_from(6), Err(6));
    }
}
