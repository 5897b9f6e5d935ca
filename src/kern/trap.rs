//! Syscall trap path
//!
//! `entry -> decode -> dispatch -> exit`. The caller's registers are saved
//! with the gate closed; the handler itself runs with the gate open and may
//! yield, park or end the caller. Trap exit writes the result word into
//! the caller's saved context and steps past the trap instruction, then
//! takes a preemption point.

use core::sync::atomic::Ordering;
use log::{trace, warn};

use crate::error::errno::{Errno, ENOSYS};
use crate::error::KernelError;
use crate::kern::syscall_sw::{syscall_number, SyscallContext, SyscallFlags, TrapArgs};
use crate::kernel::Kernel;
use crate::types::VcpuId;

/// Ephemeral record of one trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapFrame {
    /// VCPU that trapped
    pub caller: VcpuId,
    pub scno: usize,
    pub args: TrapArgs,
}

/// What came back out of a trap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrapOutcome {
    pub caller: VcpuId,
    pub scno: usize,
    /// Word written to the result register
    pub result: isize,
    /// Error behind a failing result
    pub error: Option<KernelError>,
}

/// Result word and errno update for a handler outcome
///
/// Negative words are reserved for failures, so a successful value must
/// not exceed `isize::MAX`. Handlers keep their results inside that range.
fn encode(result: Result<usize, KernelError>, flags: SyscallFlags) -> (isize, Option<Errno>) {
    match result {
        Ok(value) => (value as isize, None),
        Err(err) if flags.contains(SyscallFlags::ERRNO) => (-1, Some(err.errno())),
        Err(err) => (-(err.errno() as isize), None),
    }
}

/// Take a syscall trap from the running VCPU
pub fn handle_syscall(kernel: &Kernel) -> TrapOutcome {
    let sched = kernel.scheduler();

    // TRAP_ENTRY
    let (caller, saved) = sched.trap_entry();
    let frame = TrapFrame {
        caller,
        scno: syscall_number(&saved),
        args: TrapArgs::from_context(&saved),
    };
    kernel.trap_stats().total_calls.fetch_add(1, Ordering::Relaxed);

    // DECODE
    let (result, errno, error) = match kernel.syscall_entry(frame.scno) {
        Ok(entry) => {
            trace!("trap: {} -> {}", caller, entry.name);
            let owner = sched
                .info(caller)
                .map(|info| info.owner)
                .unwrap_or_default();
            let ctx = SyscallContext {
                kernel,
                caller,
                owner,
            };

            // DISPATCH
            let outcome = entry.execute(&ctx, &frame.args);
            if let Err(err) = outcome {
                kernel.trap_stats().failed_calls.fetch_add(1, Ordering::Relaxed);
                if entry.flags.contains(SyscallFlags::ERRNO) {
                    kernel.trap_stats().errno_returns.fetch_add(1, Ordering::Relaxed);
                }
                trace!("trap: {} {} failed: {}", caller, entry.name, err);
            }
            let (result, errno) = encode(outcome, entry.flags);
            (result, errno, outcome.err())
        }
        Err(err) => {
            kernel.trap_stats().invalid_calls.fetch_add(1, Ordering::Relaxed);
            warn!("trap: {} issued unknown syscall {}", caller, frame.scno);
            (-(ENOSYS as isize), Some(ENOSYS), Some(err))
        }
    };

    // TRAP_EXIT
    sched.trap_exit(caller, result, errno);
    sched.preempt_point();

    TrapOutcome {
        caller,
        scno: frame.scno,
        result,
        error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::errno::{EBADF, EINVAL};

    #[test]
    fn test_encode_success() {
        assert_eq!(encode(Ok(42), SyscallFlags::ERRNO), (42, None));
        assert_eq!(encode(Ok(7), SyscallFlags::empty()), (7, None));
    }

    #[test]
    fn test_encode_errno_flag() {
        assert_eq!(
            encode(Err(KernelError::InvalidArgument), SyscallFlags::ERRNO),
            (-1, Some(EINVAL))
        );
    }

    #[test]
    fn test_encode_negative_errno() {
        assert_eq!(
            encode(Err(KernelError::InvalidHandle), SyscallFlags::VCPU),
            (-(EBADF as isize), None)
        );
    }
}
