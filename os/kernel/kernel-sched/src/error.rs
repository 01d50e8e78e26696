use crate::CpuId;
use crate::node::NodeId;
use crate::thread::ThreadId;
use kernel_info::sched::MAX_WEIGHT;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedError {
    #[error("no such thread: {0}")]
    NoSuchThread(ThreadId),
    #[error("no such scheduler node: {0}")]
    NoSuchNode(NodeId),
    #[error("{0} is not a group")]
    NotAGroup(NodeId),
    #[error("no such cpu: {0}")]
    NoSuchCpu(CpuId),
    #[error("operation not valid in the current state")]
    InvalidState,
    #[error("weight {0} outside 1..={MAX_WEIGHT}")]
    InvalidWeight(u32),
    #[error("cpu {0} is not running a thread")]
    NotRunning(CpuId),
    #[error("cpu {0} is already running a thread")]
    CpuBusy(CpuId),
}
