//! Virtual Processor
//!
//! A VCPU is one schedulable execution context: a saved register file, a
//! kernel stack, a priority band and a lifecycle state. VCPUs are owned by
//! the scheduler and only ever referred to by [`VcpuId`] outside of it.
//!
//! ## Lifecycle
//!
//! ```text
//! Unbound -> Acquired -> Ready <-> Running -> {Waiting, Suspended, Ready}
//!                                          -> Relinquished / Terminated
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::error::errno::{Errno, EOK};
use crate::error::{KResult, KernelError};
use crate::kern::runq::Priority;
use crate::kern::sched_prim::{WaitReason, WaitResult};
use crate::types::{ProcessId, QueueId, VcpuId};

// ============================================================================
// Register Context
// ============================================================================

/// Number of general purpose registers in the saved context
pub const NUM_GPRS: usize = 16;

/// Register that carries the syscall number in and the result out
pub const REG_SCNO: usize = 0;

/// Register that carries the result word of a trap
pub const REG_RESULT: usize = REG_SCNO;

/// First argument register; arguments are positional from here
pub const REG_ARG0: usize = 1;

/// Register that receives the entry argument of a fresh VCPU
pub const REG_ENTRY_ARG: usize = REG_ARG0;

/// Length of the trap instruction; trap exit resumes after it
pub const TRAP_INSN_LEN: usize = 2;

/// Status register with user mode and every interrupt level open
pub const SR_USER: u16 = 0x0000;

/// Supervisor bit in the status register
pub const SR_SUPERVISOR: u16 = 0x2000;

/// Saved register file of one VCPU
///
/// Only trap entry and the context switch write whole contexts; everything
/// else goes through the narrow accessors below.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuContext {
    gpr: [usize; NUM_GPRS],
    sp: usize,
    pc: usize,
    sr: u16,
}

impl CpuContext {
    /// All-zero context in supervisor mode (the boot state of the core)
    pub const fn reset() -> Self {
        Self {
            gpr: [0; NUM_GPRS],
            sp: 0,
            pc: 0,
            sr: SR_SUPERVISOR,
        }
    }

    /// Context that starts executing `entry(arg)` on `stack_top`
    pub(crate) fn initial(entry: usize, stack_top: usize, arg: usize) -> Self {
        let mut ctx = Self {
            gpr: [0; NUM_GPRS],
            sp: stack_top,
            pc: entry,
            sr: SR_USER,
        };
        ctx.gpr[REG_ENTRY_ARG] = arg;
        ctx
    }

    pub fn gpr(&self, index: usize) -> usize {
        self.gpr.get(index).copied().unwrap_or(0)
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn sp(&self) -> usize {
        self.sp
    }

    pub fn sr(&self) -> u16 {
        self.sr
    }

    pub fn is_user(&self) -> bool {
        self.sr & SR_SUPERVISOR == 0
    }

    pub(crate) fn set_gpr(&mut self, index: usize, value: usize) {
        if let Some(reg) = self.gpr.get_mut(index) {
            *reg = value;
        }
    }

    /// Write the trap result and step past the trap instruction
    pub(crate) fn complete_trap(&mut self, result: isize) {
        self.gpr[REG_RESULT] = result as usize;
        self.pc = self.pc.wrapping_add(TRAP_INSN_LEN);
    }
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::reset()
    }
}

// ============================================================================
// Acquisition Parameters
// ============================================================================

bitflags! {
    /// Options for [`AcquireParams`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AcquireFlags: u32 {
        /// Leave the VCPU in `Acquired` until it is resumed
        const SUSPENDED = 1 << 0;
    }
}

/// Caller-filled acquisition request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireParams {
    /// Priority band, must be within the user range
    pub priority: usize,
    /// Stack size in bytes; 0 selects the configured default
    pub stack_size: usize,
    /// Entry point address
    pub entry: usize,
    /// Value handed to the entry point
    pub arg: usize,
    pub flags: AcquireFlags,
}

impl AcquireParams {
    /// Parameters for `entry` at the normal band and default stack
    pub fn new(entry: usize) -> Self {
        Self {
            priority: Priority::NORMAL.value() as usize,
            stack_size: 0,
            entry,
            arg: 0,
            flags: AcquireFlags::empty(),
        }
    }

    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_arg(mut self, arg: usize) -> Self {
        self.arg = arg;
        self
    }

    pub fn suspended(mut self) -> Self {
        self.flags |= AcquireFlags::SUSPENDED;
        self
    }
}

// ============================================================================
// State
// ============================================================================

/// Lifecycle state of a VCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Slot has no resources bound
    Unbound,
    /// Resources bound, not yet admitted to the ready queue
    Acquired,
    /// On the ready queue
    Ready,
    /// Owns the core
    Running,
    /// Parked until woken
    Waiting(WaitReason),
    /// Parked by a suspension count
    Suspended,
    /// Exited by its own request
    Relinquished,
    /// Ended by its owner's termination
    Terminated,
}

impl VcpuState {
    /// Never scheduled again
    pub fn is_terminal(self) -> bool {
        matches!(self, VcpuState::Relinquished | VcpuState::Terminated)
    }
}

/// What a VCPU is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRole {
    /// The core's idle loop
    Idle,
    /// Runs caller code from its entry point
    User,
    /// Drains one lane of a dispatch queue
    DispatchWorker { queue: QueueId },
}

/// Why a VCPU stopped for good
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Relinquished,
    Terminated,
}

// ============================================================================
// Stack
// ============================================================================

/// Kernel stack backing a VCPU
pub struct VcpuStack {
    mem: Box<[u8]>,
}

impl VcpuStack {
    /// Allocate `size` bytes, reporting allocator failure instead of aborting
    pub fn allocate(size: usize) -> KResult<Self> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(size)
            .map_err(|_| KernelError::ResourceExhausted)?;
        mem.resize(size, 0);
        Ok(Self {
            mem: mem.into_boxed_slice(),
        })
    }

    /// Zero-sized stack for VCPUs that never leave the kernel
    pub fn empty() -> Self {
        Self {
            mem: Vec::new().into_boxed_slice(),
        }
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Initial stack pointer (stacks grow down, word aligned)
    pub fn top(&self) -> usize {
        let end = self.mem.as_ptr() as usize + self.mem.len();
        end & !(core::mem::size_of::<usize>() - 1)
    }
}

impl core::fmt::Debug for VcpuStack {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VcpuStack").field("size", &self.size()).finish()
    }
}

// ============================================================================
// VCPU
// ============================================================================

/// One schedulable context
#[derive(Debug)]
pub struct Vcpu {
    pub(crate) id: VcpuId,
    pub(crate) owner: ProcessId,
    pub(crate) role: VcpuRole,
    pub(crate) state: VcpuState,
    pub(crate) priority: Priority,
    /// Ticks left in the current slice
    pub(crate) quantum_left: u32,
    pub(crate) suspension_count: u32,
    pub(crate) context: CpuContext,
    pub(crate) stack: VcpuStack,
    pub(crate) errno: Errno,
    pub(crate) udata: usize,
    pub(crate) wait_result: Option<WaitResult>,
    pub(crate) exit: Option<ExitReason>,
}

impl Vcpu {
    pub(crate) fn new(
        id: VcpuId,
        owner: ProcessId,
        role: VcpuRole,
        priority: Priority,
        stack: VcpuStack,
        context: CpuContext,
    ) -> Self {
        Self {
            id,
            owner,
            role,
            state: VcpuState::Acquired,
            priority,
            quantum_left: priority.quantum(),
            suspension_count: 0,
            context,
            stack,
            errno: EOK,
            udata: 0,
            wait_result: None,
            exit: None,
        }
    }

    pub(crate) fn refill_quantum(&mut self) {
        self.quantum_left = self.priority.quantum();
    }

    pub(crate) fn info(&self) -> VcpuInfo {
        VcpuInfo {
            id: self.id,
            owner: self.owner,
            role: self.role,
            state: self.state,
            priority: self.priority,
            quantum_left: self.quantum_left,
            suspension_count: self.suspension_count,
            errno: self.errno,
            udata: self.udata,
            stack_size: self.stack.size(),
            wait_result: self.wait_result,
            exit: self.exit,
        }
    }
}

/// Read-only snapshot of a VCPU
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VcpuInfo {
    pub id: VcpuId,
    pub owner: ProcessId,
    pub role: VcpuRole,
    pub state: VcpuState,
    pub priority: Priority,
    pub quantum_left: u32,
    pub suspension_count: u32,
    pub errno: Errno,
    pub udata: usize,
    pub stack_size: usize,
    pub wait_result: Option<WaitResult>,
    pub exit: Option<ExitReason>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_context() {
        let ctx = CpuContext::initial(0x1000, 0x8000, 42);
        assert_eq!(ctx.pc(), 0x1000);
        assert_eq!(ctx.sp(), 0x8000);
        assert_eq!(ctx.gpr(REG_ENTRY_ARG), 42);
        assert!(ctx.is_user());
        assert!(!CpuContext::reset().is_user());
    }

    #[test]
    fn test_complete_trap_advances_pc() {
        let mut ctx = CpuContext::initial(0x1000, 0x8000, 0);
        ctx.complete_trap(-1);
        assert_eq!(ctx.pc(), 0x1000 + TRAP_INSN_LEN);
        assert_eq!(ctx.gpr(REG_RESULT) as isize, -1);
    }

    #[test]
    fn test_out_of_range_register_reads_zero() {
        let mut ctx = CpuContext::reset();
        ctx.set_gpr(NUM_GPRS, 7);
        assert_eq!(ctx.gpr(NUM_GPRS), 0);
    }

    #[test]
    fn test_stack_allocation() {
        let stack = VcpuStack::allocate(1024).unwrap();
        assert_eq!(stack.size(), 1024);
        assert_eq!(stack.top() % core::mem::size_of::<usize>(), 0);
        assert_eq!(VcpuStack::empty().size(), 0);
    }

    #[test]
    fn test_params_builder() {
        let params = AcquireParams::new(0x4000)
            .with_priority(50)
            .with_stack_size(2048)
            .with_arg(7)
            .suspended();
        assert_eq!(params.priority, 50);
        assert_eq!(params.stack_size, 2048);
        assert!(params.flags.contains(AcquireFlags::SUSPENDED));
    }

    #[test]
    fn test_terminal_states() {
        assert!(VcpuState::Relinquished.is_terminal());
        assert!(VcpuState::Terminated.is_terminal());
        assert!(!VcpuState::Waiting(WaitReason::Io).is_terminal());
    }
}
