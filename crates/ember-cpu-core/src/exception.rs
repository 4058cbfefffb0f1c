use thiserror::Error;

/// Reason codes a halted machine reports to its embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    /// The guest executed HLT.
    Hlt,
    /// An explicit shutdown requested through [`crate::Machine::halt`].
    Requested(i32),
    /// An unmasked x87 exception.
    FpuException,
    /// An unmasked SSE exception.
    SimdException,
}

/// Control transfers back to the embedder that retire the instruction
/// first: the trap boundary of the OS-call layer, software interrupts,
/// PAUSE yields, and HLT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingExit {
    Syscall,
    Interrupt(u8),
    Pause,
    Halt,
}

/// Everything that can non-locally terminate one instruction.
///
/// Handlers return `Err` and the dispatcher loop is the single recovery
/// point; no partial instruction effects are visible past it because the
/// store stash is only committed on the success path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Exception {
    /// `#DE`: divide by zero or quotient overflow.
    #[error("divide error")]
    DivideError,
    /// `#SEGV` with the offending linear address.
    #[error("segmentation fault at {addr:#x}")]
    SegmentationFault { addr: i64 },
    /// `#GP(0)`.
    #[error("general protection fault")]
    ProtectionFault,
    /// `#UD`.
    #[error("undefined instruction")]
    UndefinedInstruction,
    /// Machine left the dispatch loop with a reason code.
    #[error("machine halted")]
    Halted(HaltReason),
}

impl Exception {
    #[inline]
    pub fn segv(addr: i64) -> Self {
        Exception::SegmentationFault { addr }
    }
}
