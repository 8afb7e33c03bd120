//! Wire-level enums. Numeric discriminants are part of the protocol and must
//! not be renumbered.

use enum_primitive_derive::Primitive;

/// Identifies the kind of a request frame.
///
/// `Stop` doubles as the wire command for a `pause` request: there is no
/// separate "pause" code, the device simply suspends whatever thread is
/// currently running.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum CommandCode {
    /// Suspend execution.
    Stop = 1,
    /// Resume execution.
    Continue = 2,
    /// List running threads.
    Threads = 3,
    /// Fetch a thread's stack trace.
    StackTrace = 4,
    /// Fetch variables in scope at a stack frame.
    Variables = 5,
    /// Single-step execution.
    Step = 6,
    /// Terminate the channel.
    ExitChannel = 7,
}

/// Identifies the kind of an asynchronous update frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum UpdateType {
    /// Reserved / not used by this protocol revision.
    Undefined = 0,
    /// The device opened the I/O port and is ready for a connection.
    IoPortOpened = 1,
    /// All threads are now stopped.
    AllThreadsStopped = 2,
    /// A new thread attached (and is stopped).
    ThreadAttached = 3,
}

/// Result of a request, carried in a response frame.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum ErrorCode {
    /// Success.
    Ok = 0,
    /// Unspecified failure.
    OtherErr = 1,
    /// The command code was not recognized.
    Undefined = 2,
    /// The command requires the device to be stopped, but it is running.
    NotStopped = 3,
    /// `continue` was requested but the device cannot resume.
    CantContinue = 4,
    /// A step command was issued while another step was in progress.
    NotStoppedDuringStep = 5,
    /// The referenced thread has detached.
    ThreadDetached = 6,
    /// The command did not complete before the device's own timeout.
    ExecutionTimeout = 7,
    /// The request body was malformed.
    InvalidArgs = 8,
}

/// Why a thread is currently stopped.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum StopReason {
    /// The thread is not stopped.
    NotStopped = 0,
    /// Stopped normally (e.g. after a step or continue-to-stop).
    Normal = 1,
    /// Stopped at a `stop` statement in the script.
    StopStatement = 2,
    /// Stopped at a breakpoint.
    Break = 3,
    /// Stopped due to an uncaught runtime error.
    RuntimeError = 4,
}

/// Granularity of a `step` request.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum StepType {
    /// Step to the next line, descending into calls.
    Line = 1,
    /// Step over a call on the current line.
    Over = 2,
    /// Step out of the current function.
    Out = 3,
}

/// The kind of a decoded variable's value.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Primitive)]
pub enum VariableType {
    /// The `invalid` sentinel used before a variable is initialized.
    Uninitialized = 0,
    /// A boolean.
    Bool = 1,
    /// A double-precision float.
    Double = 2,
    /// A single-precision float.
    Float = 3,
    /// An integer.
    Int = 4,
    /// An object (component, node, etc).
    Object = 5,
    /// A string.
    String = 6,
    /// A function reference.
    Function = 7,
    /// An array.
    Array = 8,
    /// An associative array.
    AssociativeArray = 9,
    /// Any other/unrecognized type.
    Invalid = 10,
}

impl VariableType {
    /// Whether a value of this type may contain child variables.
    pub fn is_container(self) -> bool {
        matches!(
            self,
            VariableType::Object | VariableType::Array | VariableType::AssociativeArray
        )
    }
}

#[cfg(test)]
mod tests {
    use num_traits::FromPrimitive;

    use super::*;

    #[test]
    fn command_code_roundtrip() {
        assert_eq!(CommandCode::from_u32(3), Some(CommandCode::Threads));
        assert_eq!(CommandCode::from_u32(99), None);
    }

    #[test]
    fn variable_type_is_container() {
        assert!(VariableType::Array.is_container());
        assert!(!VariableType::Int.is_container());
    }
}
