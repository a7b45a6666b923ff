//! Error kinds returned by kernel operations

/// Result type for every kernel operation
pub type KernelResult<T> = Result<T, KernelError>;

/// Errors a kernel operation can report to the syscall boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    /// No live object with the given ID (or the object was destroyed)
    #[error("Kernel object not found")]
    NotFound,

    /// Object is in use, or the operation would have to block
    #[error("Kernel object busy")]
    Busy,

    /// Caller is not the required owner / waiter
    #[error("Operation not permitted")]
    Permission,

    /// Self-relock of a non-recursive mutex or of an rwlock writer
    #[error("Deadlock detected")]
    Deadlock,

    /// Recursive lock count would exceed its ceiling
    #[error("Recursion count overflow")]
    RecursionOverflow,

    /// Bad protocol, type, mode, size or count
    #[error("Invalid argument")]
    InvalidArgument,

    /// Timeout expired before the wait completed
    #[error("Wait timed out")]
    TimedOut,

    /// Wait canceled by the guest (event flag cancel, forced queue destroy)
    #[error("Wait canceled")]
    Canceled,

    /// Emulator is stopping; the wait ended without completing
    #[error("Emulation stopped")]
    Shutdown,

    /// Event port has no connected queue
    #[error("Event port not connected")]
    NotConnected,

    /// Event port is already connected
    #[error("Event port already connected")]
    IsConnected,

    /// Event queue is at capacity
    #[error("Event queue full")]
    Full,

    /// IPC key already registered
    #[error("Key already exists")]
    Exists,

    /// Object table has no room for another object
    #[error("Object table full")]
    TableFull,

    /// Guest memory access out of range
    #[error("Guest memory fault at {0:#x}")]
    Fault(u32),
}

impl KernelError {
    /// Whether the error ended a wait without completing it (timeout,
    /// guest cancel or emulator stop)
    pub fn is_interrupted_wait(self) -> bool {
        matches!(
            self,
            KernelError::TimedOut | KernelError::Canceled | KernelError::Shutdown
        )
    }
}
