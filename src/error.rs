//! Kernel error types
//!
//! Every fallible core operation returns [`KResult`]. At the trap boundary an
//! error becomes an errno value that user space reads back through the
//! `vcpu_errno` syscall.

use thiserror::Error;

/// Result type used throughout the kernel core
pub type KResult<T> = Result<T, KernelError>;

/// POSIX-style error numbers surfaced to user space
pub mod errno {
    pub type Errno = i32;

    pub const EOK: Errno = 0;
    pub const ENOENT: Errno = 2;
    pub const EINTR: Errno = 4;
    pub const EBADF: Errno = 9;
    pub const EAGAIN: Errno = 11;
    pub const ENOMEM: Errno = 12;
    pub const EFAULT: Errno = 14;
    pub const EBUSY: Errno = 16;
    pub const EINVAL: Errno = 22;
    pub const ENOSYS: Errno = 38;
}

use errno::Errno;

/// Errors returned by the scheduling and dispatch core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum KernelError {
    /// Malformed acquisition or submission parameters
    #[error("invalid argument")]
    InvalidArgument,

    /// No free VCPU slot or no memory for its stack
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Stale or unknown VCPU id
    #[error("invalid handle")]
    InvalidHandle,

    /// Trap number outside the syscall table
    #[error("invalid syscall")]
    InvalidSyscall,

    /// A closure or handler hit an unrecoverable condition
    #[error("fault (code {0})")]
    Fault(i32),

    /// Bounded dispatch queue is at capacity
    #[error("dispatch queue full")]
    QueueFull,

    /// Stale, terminated or destroyed queue handle
    #[error("invalid dispatch queue")]
    InvalidQueue,

    /// The work item is not pending (already started or never existed)
    #[error("not found")]
    NotFound,

    /// A wait was cut short by flush or termination
    #[error("interrupted")]
    Interrupted,

    /// Target is in a state that does not allow the operation
    #[error("busy")]
    Busy,
}

/// Coarse classification of [`KernelError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    ResourceExhausted,
    InvalidHandle,
    InvalidSyscall,
    Fault,
    NotFound,
    Interrupted,
    Busy,
}

impl KernelError {
    /// Fold this error onto the coarse taxonomy
    pub const fn kind(&self) -> ErrorKind {
        match self {
            KernelError::InvalidArgument => ErrorKind::InvalidArgument,
            KernelError::ResourceExhausted | KernelError::QueueFull => {
                ErrorKind::ResourceExhausted
            }
            KernelError::InvalidHandle | KernelError::InvalidQueue => ErrorKind::InvalidHandle,
            KernelError::InvalidSyscall => ErrorKind::InvalidSyscall,
            KernelError::Fault(_) => ErrorKind::Fault,
            KernelError::NotFound => ErrorKind::NotFound,
            KernelError::Interrupted => ErrorKind::Interrupted,
            KernelError::Busy => ErrorKind::Busy,
        }
    }

    /// Error number reported to user space
    pub const fn errno(&self) -> Errno {
        match self {
            KernelError::InvalidArgument => errno::EINVAL,
            KernelError::ResourceExhausted => errno::ENOMEM,
            KernelError::InvalidHandle | KernelError::InvalidQueue => errno::EBADF,
            KernelError::InvalidSyscall => errno::ENOSYS,
            KernelError::Fault(_) => errno::EFAULT,
            KernelError::QueueFull => errno::EAGAIN,
            KernelError::NotFound => errno::ENOENT,
            KernelError::Interrupted => errno::EINTR,
            KernelError::Busy => errno::EBUSY,
        }
    }

    /// Reverse of [`errno`](Self::errno). Returns `None` for `EOK` and
    /// numbers the core never produces.
    pub const fn from_errno(err: Errno) -> Option<Self> {
        Some(match err {
            errno::EINVAL => KernelError::InvalidArgument,
            errno::ENOMEM => KernelError::ResourceExhausted,
            errno::EBADF => KernelError::InvalidHandle,
            errno::ENOSYS => KernelError::InvalidSyscall,
            errno::EFAULT => KernelError::Fault(0),
            errno::EAGAIN => KernelError::QueueFull,
            errno::ENOENT => KernelError::NotFound,
            errno::EINTR => KernelError::Interrupted,
            errno::EBUSY => KernelError::Busy,
            _ => return None,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_folding() {
        assert_eq!(KernelError::QueueFull.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(KernelError::InvalidQueue.kind(), ErrorKind::InvalidHandle);
        assert_eq!(KernelError::Fault(7).kind(), ErrorKind::Fault);
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(KernelError::InvalidSyscall.errno(), errno::ENOSYS);
        assert_eq!(KernelError::ResourceExhausted.errno(), errno::ENOMEM);
        assert_eq!(KernelError::from_errno(errno::ENOENT), Some(KernelError::NotFound));
        assert_eq!(KernelError::from_errno(errno::EOK), None);
        assert_eq!(KernelError::from_errno(1234), None);
    }

    #[test]
    fn test_display() {
        use alloc::string::ToString;
        assert_eq!(KernelError::Fault(3).to_string(), "fault (code 3)");
        assert_eq!(KernelError::QueueFull.to_string(), "dispatch queue full");
    }
}
