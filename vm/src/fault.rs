//! Runtime faults.
//!
//! A fault aborts the whole execution; there is no unwinding back into
//! the interpreted program. Every variant is an internal error as far as
//! the guest is concerned, the host maps them to an exit code.

use ir::{DecodeError, Op};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Fault {
    #[error("division by zero at offset {offset}")]
    DivideByZero { offset: u32 },
    #[error("assertion failed at offset {offset}")]
    AssertionFailed { offset: u32 },
    #[error("jump to unknown label L{label} at offset {offset}")]
    InvalidLabel { label: u32, offset: u32 },
    #[error("opcode {op} must not reach the executor (offset {offset})")]
    UnexpectedOpcode { op: Op, offset: u32 },
    #[error("atom:{atomid}#{instanceid} is not a valid destructor")]
    InvalidDtor { atomid: u32, instanceid: u32 },
    #[error("unknown pointer 0x{ptr:016x}")]
    UnknownPointer { ptr: u64 },
    #[error("pointer 0x{ptr:016x} used with size {got}, allocated with {expected}")]
    SizeMismatch { ptr: u64, expected: u64, got: u64 },
    #[error("register r{lvid} outside the declared window of {count} (offset {offset})")]
    RegisterOutOfRange { lvid: u32, count: u32, offset: u32 },
    #[error("call stack overflow")]
    StackOverflow,
    #[error("atom:{atomid}#{instanceid} has no resolved sequence")]
    NotInstantiated { atomid: u32, instanceid: u32 },
    #[error("intrinsic #{id} is not registered")]
    UnknownIntrinsic { id: u32 },
    #[error("allocation of {size} bytes rejected")]
    AllocationTooLarge { size: u64 },
    #[error("malformed sequence: {0}")]
    Malformed(#[from] DecodeError),
}
