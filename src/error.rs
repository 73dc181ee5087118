// Recoverable kernel errors
//
// Anything that breaks the kernel's own invariants (lock discipline, double
// free, scheduler state) is not an error value: it panics and halts.

/// Failures a kernel operation reports to its caller.
///
/// The system-call layer turns every variant into the `-1` sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("no free slot")]
    CapacityExhausted,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("page allocation failed")]
    ResourceAllocationFailure,
    #[error("bad user address")]
    BadAddress,
    #[error("no child processes")]
    NoChildren,
    #[error("caller was killed")]
    Killed,
}

pub type KResult<T> = Result<T, KernelError>;

impl KernelError {
    /// Register value a failed system call returns to user space.
    pub const fn to_raw(self) -> u64 {
        (-1i64) as u64
    }
}
