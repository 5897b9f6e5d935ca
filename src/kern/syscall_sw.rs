//! Syscall Table - System Call Switch
//!
//! Maps small syscall numbers to kernel operations. Each entry records its
//! name, its fixed arity and how failures are reported back to user space.
//!
//! ## Numbering
//!
//! - 0-9: VCPU operations
//! - 10-15: dispatch queues
//! - 16: clock
//! - 17-63: free for other subsystems through [`SyscallTable::register`]

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::dispatch::QueueAttrs;
use crate::error::{KResult, KernelError};
use crate::kern::runq::Priority;
use crate::kern::vcpu::{AcquireFlags, AcquireParams, CpuContext, REG_ARG0, REG_SCNO};
use crate::kernel::Kernel;
use crate::types::{ProcessId, QueueId, Tick, VcpuId};

// ============================================================================
// Syscall Numbers (Constants)
// ============================================================================

/// Read the caller's errno
pub const SC_VCPU_ERRNO: usize = 0;
/// Id of the calling VCPU
pub const SC_VCPU_GETID: usize = 1;
/// Give up the rest of the slice
pub const SC_VCPU_YIELD: usize = 2;
/// Bind a new VCPU for the calling process
pub const SC_VCPU_ACQUIRE: usize = 3;
/// End the calling VCPU
pub const SC_VCPU_RELINQUISH_SELF: usize = 4;
/// Suspend a VCPU of the calling process
pub const SC_VCPU_SUSPEND: usize = 5;
/// Resume a VCPU of the calling process
pub const SC_VCPU_RESUME: usize = 6;
/// Read the caller's user data word
pub const SC_VCPU_GETDATA: usize = 7;
/// Write the caller's user data word
pub const SC_VCPU_SETDATA: usize = 8;
/// Move a VCPU of the calling process to another band
pub const SC_VCPU_SETPRIORITY: usize = 9;
/// Create a dispatch queue
pub const SC_DISPATCH_CREATE: usize = 10;
/// Submit `(func, arg)` to a queue
pub const SC_DISPATCH_ASYNC: usize = 11;
/// Submit `(func, arg)` to run at a deadline
pub const SC_DISPATCH_AFTER: usize = 12;
/// Remove pending items by tag
pub const SC_DISPATCH_REMOVE_BY_TAG: usize = 13;
/// Discard all pending items
pub const SC_DISPATCH_FLUSH: usize = 14;
/// Destroy a queue
pub const SC_DISPATCH_DESTROY: usize = 15;
/// Scheduler clock in ticks
pub const SC_CLOCK_TICKS: usize = 16;

/// Number of slots in the table
pub const SYSCALL_TABLE_CAPACITY: usize = 64;

/// Argument registers available to a syscall
pub const MAX_SYSCALL_ARGS: usize = 6;

/// Tag value meaning "untagged" at the syscall level
pub const NO_TAG: usize = 0;

// ============================================================================
// Syscall Flags
// ============================================================================

bitflags! {
    /// How an entry reports to its caller
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SyscallFlags: u32 {
        /// A failure stores its errno in the calling VCPU and returns -1
        const ERRNO = 1 << 0;
        /// Operates on the calling VCPU rather than its process
        const VCPU = 1 << 1;
    }
}

// ============================================================================
// Arguments and Context
// ============================================================================

/// Positional syscall arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrapArgs {
    pub args: [usize; MAX_SYSCALL_ARGS],
    /// Number of valid arguments
    pub arg_count: usize,
}

impl TrapArgs {
    pub fn with_args(args: &[usize]) -> Self {
        let mut trap_args = Self::default();
        let count = args.len().min(MAX_SYSCALL_ARGS);
        trap_args.args[..count].copy_from_slice(&args[..count]);
        trap_args.arg_count = count;
        trap_args
    }

    /// Read all argument registers from a saved context
    pub fn from_context(ctx: &CpuContext) -> Self {
        Self {
            args: core::array::from_fn(|i| ctx.gpr(REG_ARG0 + i)),
            arg_count: MAX_SYSCALL_ARGS,
        }
    }

    pub fn arg(&self, index: usize) -> usize {
        if index < self.arg_count {
            self.args[index]
        } else {
            0
        }
    }

    pub fn arg_u32(&self, index: usize) -> KResult<u32> {
        u32::try_from(self.arg(index)).map_err(|_| KernelError::InvalidArgument)
    }

    pub fn arg_vcpu(&self, index: usize) -> KResult<VcpuId> {
        self.arg_u32(index).map(VcpuId)
    }

    pub fn arg_queue(&self, index: usize) -> KResult<QueueId> {
        self.arg_u32(index).map(QueueId)
    }

    /// Tag argument; [`NO_TAG`] means untagged
    pub fn arg_tag(&self, index: usize) -> KResult<Option<u32>> {
        match self.arg(index) {
            NO_TAG => Ok(None),
            _ => self.arg_u32(index).map(Some),
        }
    }
}

/// The trap as seen by a handler
pub struct SyscallContext<'a> {
    pub kernel: &'a Kernel,
    /// VCPU that trapped
    pub caller: VcpuId,
    /// Process owning `caller`
    pub owner: ProcessId,
}

impl SyscallContext<'_> {
    /// `id` must belong to the calling process
    fn own_vcpu(&self, id: VcpuId) -> KResult<VcpuId> {
        let info = self.kernel.scheduler().info(id)?;
        if info.owner != self.owner || info.state.is_terminal() {
            return Err(KernelError::InvalidHandle);
        }
        Ok(id)
    }
}

// ============================================================================
// Table Entry
// ============================================================================

/// Syscall handler signature
pub type SyscallHandler = fn(&SyscallContext<'_>, &TrapArgs) -> KResult<usize>;

/// Syscall table entry
#[derive(Clone, Copy)]
pub struct Syscall {
    pub name: &'static str,
    /// Number of arguments read
    pub arity: u8,
    pub flags: SyscallFlags,
    pub handler: SyscallHandler,
}

impl Syscall {
    pub const fn new(name: &'static str, arity: u8, handler: SyscallHandler) -> Self {
        Self {
            name,
            arity,
            flags: SyscallFlags::empty(),
            handler,
        }
    }

    pub const fn with_flags(mut self, flags: SyscallFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Run the handler on the first `arity` arguments
    pub fn execute(&self, ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
        let mut args = *args;
        args.arg_count = args.arg_count.min(self.arity as usize);
        (self.handler)(ctx, &args)
    }
}

impl core::fmt::Debug for Syscall {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Syscall")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("flags", &self.flags)
            .finish()
    }
}

// ============================================================================
// VCPU Syscalls
// ============================================================================

fn vcpu_errno(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    Ok(ctx.kernel.scheduler().errno(ctx.caller)? as usize)
}

fn vcpu_getid(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    Ok(ctx.caller.0 as usize)
}

fn vcpu_yield(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    ctx.kernel.scheduler().yield_now();
    Ok(0)
}

/// Arguments: priority, stack_size, entry, arg, flags
fn vcpu_acquire(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let flags = AcquireFlags::from_bits(args.arg_u32(4)?).ok_or(KernelError::InvalidArgument)?;
    let params = AcquireParams {
        priority: args.arg(0),
        stack_size: args.arg(1),
        entry: args.arg(2),
        arg: args.arg(3),
        flags,
    };
    let id = ctx.kernel.scheduler().acquire(&params, ctx.owner)?;
    Ok(id.0 as usize)
}

fn vcpu_relinquish_self(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    ctx.kernel.scheduler().relinquish_self()?;
    Ok(0)
}

fn vcpu_suspend(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let id = ctx.own_vcpu(args.arg_vcpu(0)?)?;
    ctx.kernel.scheduler().suspend(id)?;
    Ok(0)
}

/// Arguments: id, force
fn vcpu_resume(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let id = ctx.own_vcpu(args.arg_vcpu(0)?)?;
    ctx.kernel.scheduler().resume(id, args.arg(1) != 0)?;
    Ok(0)
}

fn vcpu_getdata(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    ctx.kernel.scheduler().udata(ctx.caller)
}

/// Arguments: value; must read back as a non-negative result word
fn vcpu_setdata(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let value = args.arg(0);
    if value > isize::MAX as usize {
        return Err(KernelError::InvalidArgument);
    }
    ctx.kernel.scheduler().set_udata(ctx.caller, value)?;
    Ok(0)
}

/// Arguments: id, priority
fn vcpu_setpriority(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let id = ctx.own_vcpu(args.arg_vcpu(0)?)?;
    let priority = Priority::user(args.arg(1))?;
    ctx.kernel.scheduler().set_priority(id, priority)?;
    Ok(0)
}

// ============================================================================
// Dispatch Syscalls
// ============================================================================

/// Arguments: min, max, priority, capacity (0 for the default)
fn dispatch_create(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let attrs = QueueAttrs {
        min_concurrency: args.arg(0),
        max_concurrency: args.arg(1),
        priority: args.arg(2),
        capacity: match args.arg(3) {
            0 => None,
            cap => Some(cap),
        },
    };
    let id = ctx.kernel.create_queue(ctx.owner, attrs)?;
    Ok(id.0 as usize)
}

/// Arguments: queue, func, arg, tag
fn dispatch_async(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let queue = ctx.kernel.queue_for(ctx.owner, args.arg_queue(0)?)?;
    let tag = args.arg_tag(3)?;
    let closure = ctx.kernel.user_closure(args.arg(1), args.arg(2))?;
    let work = match tag {
        Some(tag) => queue.submit_tagged(tag, Default::default(), closure)?,
        None => queue.submit(closure)?,
    };
    Ok(work.0 as usize)
}

/// Arguments: queue, deadline, func, arg, tag
fn dispatch_after(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let queue = ctx.kernel.queue_for(ctx.owner, args.arg_queue(0)?)?;
    let deadline = Tick(args.arg(1) as u64);
    let tag = args.arg_tag(4)?;
    let closure = ctx.kernel.user_closure(args.arg(2), args.arg(3))?;
    let work = queue.submit_after(deadline, tag, closure)?;
    Ok(work.0 as usize)
}

/// Arguments: queue, tag
fn dispatch_remove_by_tag(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let queue = ctx.kernel.queue_for(ctx.owner, args.arg_queue(0)?)?;
    let tag = args.arg_tag(1)?.ok_or(KernelError::InvalidArgument)?;
    Ok(queue.remove_by_tag(tag))
}

fn dispatch_flush(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let queue = ctx.kernel.queue_for(ctx.owner, args.arg_queue(0)?)?;
    Ok(queue.flush())
}

fn dispatch_destroy(ctx: &SyscallContext<'_>, args: &TrapArgs) -> KResult<usize> {
    let queue = ctx.kernel.queue_for(ctx.owner, args.arg_queue(0)?)?;
    ctx.kernel.destroy_queue(queue.id())
}

fn clock_ticks(ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
    Ok(ctx.kernel.scheduler().now().0 as usize)
}

// ============================================================================
// Trap Statistics
// ============================================================================

/// Syscall statistics
pub struct TrapStats {
    /// Total traps taken
    pub total_calls: AtomicU64,
    /// Traps with a number outside the table
    pub invalid_calls: AtomicU64,
    /// Calls whose handler failed
    pub failed_calls: AtomicU64,
    /// Failures reported through errno
    pub errno_returns: AtomicU64,
}

impl TrapStats {
    pub const fn new() -> Self {
        Self {
            total_calls: AtomicU64::new(0),
            invalid_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            errno_returns: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> TrapStatsSnapshot {
        TrapStatsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            invalid_calls: self.invalid_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            errno_returns: self.errno_returns.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of syscall statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrapStatsSnapshot {
    pub total_calls: u64,
    pub invalid_calls: u64,
    pub failed_calls: u64,
    pub errno_returns: u64,
}

// ============================================================================
// Syscall Table
// ============================================================================

/// Fixed-capacity syscall table
pub struct SyscallTable {
    entries: heapless::Vec<Option<Syscall>, SYSCALL_TABLE_CAPACITY>,
}

impl SyscallTable {
    /// Table with no entries
    pub const fn empty() -> Self {
        Self {
            entries: heapless::Vec::new(),
        }
    }

    /// Table with the standard VCPU, dispatch and clock entries
    pub fn new() -> Self {
        let errno = SyscallFlags::ERRNO;
        let vcpu = SyscallFlags::VCPU;
        let standard = [
            (SC_VCPU_ERRNO, Syscall::new("vcpu_errno", 0, vcpu_errno).with_flags(vcpu)),
            (SC_VCPU_GETID, Syscall::new("vcpu_getid", 0, vcpu_getid).with_flags(vcpu)),
            (SC_VCPU_YIELD, Syscall::new("vcpu_yield", 0, vcpu_yield).with_flags(vcpu)),
            (SC_VCPU_ACQUIRE, Syscall::new("vcpu_acquire", 5, vcpu_acquire).with_flags(errno)),
            (
                SC_VCPU_RELINQUISH_SELF,
                Syscall::new("vcpu_relinquish_self", 0, vcpu_relinquish_self).with_flags(vcpu),
            ),
            (SC_VCPU_SUSPEND, Syscall::new("vcpu_suspend", 1, vcpu_suspend).with_flags(errno)),
            (SC_VCPU_RESUME, Syscall::new("vcpu_resume", 2, vcpu_resume).with_flags(errno)),
            (SC_VCPU_GETDATA, Syscall::new("vcpu_getdata", 0, vcpu_getdata).with_flags(vcpu)),
            (SC_VCPU_SETDATA, Syscall::new("vcpu_setdata", 1, vcpu_setdata).with_flags(vcpu)),
            (
                SC_VCPU_SETPRIORITY,
                Syscall::new("vcpu_setpriority", 2, vcpu_setpriority).with_flags(errno),
            ),
            (
                SC_DISPATCH_CREATE,
                Syscall::new("dispatch_create", 4, dispatch_create).with_flags(errno),
            ),
            (
                SC_DISPATCH_ASYNC,
                Syscall::new("dispatch_async", 4, dispatch_async).with_flags(errno),
            ),
            (
                SC_DISPATCH_AFTER,
                Syscall::new("dispatch_after", 5, dispatch_after).with_flags(errno),
            ),
            (
                SC_DISPATCH_REMOVE_BY_TAG,
                Syscall::new("dispatch_remove_by_tag", 2, dispatch_remove_by_tag).with_flags(errno),
            ),
            (
                SC_DISPATCH_FLUSH,
                Syscall::new("dispatch_flush", 1, dispatch_flush).with_flags(errno),
            ),
            (
                SC_DISPATCH_DESTROY,
                Syscall::new("dispatch_destroy", 1, dispatch_destroy).with_flags(errno),
            ),
            (SC_CLOCK_TICKS, Syscall::new("clock_ticks", 0, clock_ticks)),
        ];

        let mut table = Self::empty();
        for (number, entry) in standard {
            // Numbers are distinct and below capacity
            let _ = table.register(number, entry);
        }
        table
    }

    /// Install `entry` under `number`
    ///
    /// Fails with `InvalidArgument` beyond the table capacity and with
    /// `Busy` if the slot is taken.
    pub fn register(&mut self, number: usize, entry: Syscall) -> KResult<()> {
        if number >= SYSCALL_TABLE_CAPACITY {
            return Err(KernelError::InvalidArgument);
        }
        if self.entries.len() <= number {
            self.entries
                .resize(number + 1, None)
                .map_err(|_| KernelError::ResourceExhausted)?;
        }
        match &mut self.entries[number] {
            Some(_) => Err(KernelError::Busy),
            slot => {
                *slot = Some(entry);
                Ok(())
            }
        }
    }

    /// Decode a syscall number
    pub fn get(&self, number: usize) -> KResult<Syscall> {
        self.entries
            .get(number)
            .copied()
            .flatten()
            .ok_or(KernelError::InvalidSyscall)
    }

    /// Number of registered entries
    pub fn count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }
}

impl Default for SyscallTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Syscall number held by a trapping context
pub fn syscall_number(ctx: &CpuContext) -> usize {
    ctx.gpr(REG_SCNO)
}
