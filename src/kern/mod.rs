//! Kern subsystem - Core scheduling primitives
//!
//! VCPU records, the ready queue, wait vocabulary and the syscall trap path.

pub mod runq;
pub mod sched_prim;
pub mod syscall_sw;
pub mod trap;
pub mod vcpu;

pub use runq::{Priority, ReadyQueue, PRIORITY_COUNT, PRIORITY_USER_MAX, PRIORITY_USER_MIN};
pub use sched_prim::{WaitReason, WaitResult};
pub use syscall_sw::{Syscall, SyscallContext, SyscallFlags, SyscallTable, TrapArgs, TrapStatsSnapshot};
pub use trap::{TrapFrame, TrapOutcome};
pub use vcpu::{AcquireFlags, AcquireParams, CpuContext, VcpuInfo, VcpuRole, VcpuState};
