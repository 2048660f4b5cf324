//! Machine fault and control-signal taxonomy.
//!
//! Everything the CPU can raise mid-instruction travels as a [`Trap`]: the
//! vectored faults enter a kernel handler through the fixed vector table,
//! while the control signals are consumed by the execution loop itself and
//! never reach a vector.

use thiserror::Error;

/// Synchronous machine faults and internal control signals.
///
/// A fault with a vector is recoverable at the instruction-loop boundary;
/// the loop services it by reading the new PC/PSW pair from kernel space.
/// Signals without a vector ([`Trap::vector`] returns `None`) steer the
/// loop directly: halt, enter the WAIT spin, suppress the trace trap after
/// an RTT return, or report an unimplemented operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Trap {
    /// Address matched neither main memory nor any registered device.
    #[error("bus timeout")]
    BusTimeout,
    /// Instruction encoding is not legal in this context.
    #[error("illegal instruction")]
    IllegalInstruction,
    /// Word access used an odd address.
    #[error("odd address reference")]
    OddAddress,
    /// Kernel stack pointer fell below the stack-limit threshold.
    #[error("kernel stack limit")]
    StackLimit,
    /// Instruction encoding is reserved on this processor.
    #[error("reserved instruction")]
    ReservedInstruction,
    /// BPT instruction or trace-bit trap.
    #[error("breakpoint trap")]
    Breakpoint,
    /// IOT instruction.
    #[error("i/o trap")]
    IoTrap,
    /// Power-fail trap.
    #[error("power fail")]
    PowerFail,
    /// EMT instruction.
    #[error("emulator trap")]
    Emt,
    /// TRAP instruction.
    #[error("trap instruction")]
    TrapInstruction,
    /// Memory-management translation was disallowed.
    #[error("segmentation fault")]
    Segmentation,
    /// Operation is not implemented by this device or processor.
    #[error("unimplemented operation")]
    Unimplemented,
    /// HALT instruction retired in kernel mode.
    #[error("halt instruction")]
    Halt,
    /// WAIT instruction retired in kernel mode.
    #[error("wait instruction")]
    Wait,
    /// RTT returned; the trace trap is suppressed for one instruction.
    #[error("trace suppressed by rtt")]
    RttReturn,
}

impl Trap {
    /// Kernel-space vector address for this trap, or `None` for the
    /// control signals the execution loop handles itself.
    #[must_use]
    pub const fn vector(self) -> Option<u16> {
        match self {
            Self::BusTimeout | Self::IllegalInstruction | Self::OddAddress | Self::StackLimit => {
                Some(0o4)
            }
            Self::ReservedInstruction => Some(0o10),
            Self::Breakpoint => Some(0o14),
            Self::IoTrap => Some(0o20),
            Self::PowerFail => Some(0o24),
            Self::Emt => Some(0o30),
            Self::TrapInstruction => Some(0o34),
            Self::Segmentation => Some(0o250),
            Self::Unimplemented | Self::Halt | Self::Wait | Self::RttReturn => None,
        }
    }

    /// `true` when the execution loop must handle this trap without
    /// vectoring through kernel space.
    #[must_use]
    pub const fn is_control_signal(self) -> bool {
        self.vector().is_none()
    }
}
