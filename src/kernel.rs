//! Kernel context
//!
//! Owns the interrupt gate, the scheduler, the process and queue tables and
//! the syscall table of one core, and drives the core one step at a time.
//!
//! ## Execution model
//!
//! The platform calls [`Kernel::run_once`] in a loop. A dispatch worker on
//! the core runs one closure per step and parks when its lane is empty. A
//! user VCPU has no code inside the kernel; its step gives up the slice.
//! Every step ends at a preemption point. [`Kernel::timer_interrupt`] is
//! the body of the timer vector and [`Kernel::syscall`] stands in for a
//! trap instruction executed by the running VCPU.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use log::{debug, error, info, warn};
use spin::{Mutex, Once};

use crate::config::KernelConfig;
use crate::dispatch::{Closure, DispatchQueue, DrainStatus, Fault, FaultAction, QueueAttrs, WorkResult};
use crate::error::{KResult, KernelError};
use crate::interrupt::{HandlerId, HandlerKind, IrqGate, IrqLock, IRQ_VECTOR_TIMER};
use crate::kern::sched_prim::WaitReason;
use crate::kern::syscall_sw::{Syscall, SyscallTable, TrapStats, TrapStatsSnapshot, MAX_SYSCALL_ARGS};
use crate::kern::trap::{self, TrapOutcome};
use crate::kern::vcpu::{VcpuRole, REG_ARG0, REG_SCNO};
use crate::process::ProcessTable;
use crate::scheduler::{Scheduler, IDLE_VCPU};
use crate::types::{ProcessId, QueueId, Tick, VcpuId, WorkId};

/// Platform hook that runs a user closure `(func, arg)`
pub type Upcall = Arc<dyn Fn(usize, usize) -> WorkResult + Send + Sync>;

/// What one call to [`Kernel::run_once`] did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Only the idle VCPU is runnable
    Idle,
    /// A user VCPU held the core and gave up its slice
    User(VcpuId),
    /// A dispatch worker ran one closure
    Ran { vcpu: VcpuId, queue: QueueId, work: WorkId },
    /// A closure faulted and the queue's handler decided
    Faulted { vcpu: VcpuId, queue: QueueId, work: WorkId, action: FaultAction },
    /// A closure faulted with no handler and its owner was terminated
    OwnerFault { queue: QueueId, owner: ProcessId, fault: Fault },
    /// A worker found its lane empty and parked
    Parked(VcpuId),
    /// A worker of a stopped or destroyed queue was released
    Retired(VcpuId),
}

struct QueueTable {
    queues: BTreeMap<QueueId, Arc<DispatchQueue>>,
    next_id: u32,
}

/// One core's kernel
pub struct Kernel {
    config: KernelConfig,
    gate: Arc<IrqGate>,
    sched: Arc<Scheduler>,
    processes: ProcessTable,
    queues: IrqLock<QueueTable>,
    syscalls: IrqLock<SyscallTable>,
    trap_stats: TrapStats,
    upcall: Mutex<Option<Upcall>>,
    /// Timer interrupts delivered but not yet charged to the scheduler
    timer_pending: Arc<AtomicU32>,
    timer_handler: HandlerId,
}

impl Kernel {
    /// Boot a core
    ///
    /// The gate stays closed while the tables are built and opens once the
    /// timer handler is live.
    pub fn new(config: KernelConfig) -> KResult<Self> {
        config.validate()?;

        let gate = Arc::new(IrqGate::new());
        let sched = Arc::new(Scheduler::new(gate.clone(), config.sched));

        let timer_pending = Arc::new(AtomicU32::new(0));
        let timer_handler =
            gate.install_handler(IRQ_VECTOR_TIMER, 0, HandlerKind::Counter(timer_pending.clone()))?;
        gate.set_handler_enabled(timer_handler, true)?;

        let kernel = Self {
            config,
            gate,
            sched,
            processes: ProcessTable::new(),
            queues: IrqLock::new(QueueTable {
                queues: BTreeMap::new(),
                next_id: 1,
            }),
            syscalls: IrqLock::new(SyscallTable::new()),
            trap_stats: TrapStats::new(),
            upcall: Mutex::new(None),
            timer_pending,
            timer_handler,
        };
        kernel.gate.enable();
        info!(
            "kernel: up, {} vcpu slots, tick {} ms",
            config.sched.max_vcpus, config.sched.tick_period_ms
        );
        Ok(kernel)
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<IrqGate> {
        &self.gate
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    pub fn timer_handler(&self) -> HandlerId {
        self.timer_handler
    }

    // ------------------------------------------------------------------------
    // Processes
    // ------------------------------------------------------------------------

    pub fn create_process(&self) -> ProcessId {
        self.processes.create(&self.gate)
    }

    pub fn is_alive(&self, pid: ProcessId) -> bool {
        self.processes.is_alive(&self.gate, pid)
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    /// Take a process down together with its VCPUs and queues
    ///
    /// Pending closures of its queues are discarded.
    pub fn terminate_process(&self, pid: ProcessId, reason: KernelError) -> KResult<()> {
        self.processes.terminate(&self.gate, pid, reason)?;

        let owned: Vec<Arc<DispatchQueue>> = {
            let mut table = self.queues.lock(&self.gate);
            let ids: Vec<QueueId> = table
                .queues
                .values()
                .filter(|q| q.owner() == pid)
                .map(|q| q.id())
                .collect();
            ids.iter().filter_map(|id| table.queues.remove(id)).collect()
        };
        let mut discarded = 0;
        for queue in &owned {
            discarded += queue.destroy();
        }

        let vcpus = self.sched.vcpus_of(pid);
        for &vcpu in &vcpus {
            let _ = self.sched.terminate(vcpu);
        }
        warn!(
            "kernel: {:?} terminated ({}): {} vcpus, {} queues, {} closures discarded",
            pid,
            reason,
            vcpus.len(),
            owned.len(),
            discarded
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Dispatch queues
    // ------------------------------------------------------------------------

    /// Create a dispatch queue owned by `owner`
    pub fn create_queue(&self, owner: ProcessId, attrs: QueueAttrs) -> KResult<QueueId> {
        if !self.is_alive(owner) {
            return Err(KernelError::InvalidHandle);
        }
        let id = {
            let mut table = self.queues.lock(&self.gate);
            let id = QueueId(table.next_id);
            table.next_id += 1;
            id
        };
        let queue = DispatchQueue::new(id, owner, attrs, self.sched.clone(), &self.config.dispatch)?;
        self.queues
            .lock(&self.gate)
            .queues
            .insert(id, Arc::new(queue));
        Ok(id)
    }

    /// Look up a queue; destroyed or unknown ids are `InvalidQueue`
    pub fn queue(&self, id: QueueId) -> KResult<Arc<DispatchQueue>> {
        self.queues
            .lock(&self.gate)
            .queues
            .get(&id)
            .cloned()
            .ok_or(KernelError::InvalidQueue)
    }

    /// Look up a queue that `owner` holds
    pub fn queue_for(&self, owner: ProcessId, id: QueueId) -> KResult<Arc<DispatchQueue>> {
        let queue = self.queue(id)?;
        if queue.owner() != owner {
            return Err(KernelError::InvalidQueue);
        }
        Ok(queue)
    }

    /// Destroy a queue and release its workers
    ///
    /// Returns the number of pending closures discarded.
    pub fn destroy_queue(&self, id: QueueId) -> KResult<usize> {
        let queue = self
            .queues
            .lock(&self.gate)
            .queues
            .remove(&id)
            .ok_or(KernelError::InvalidQueue)?;
        Ok(queue.destroy())
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock(&self.gate).queues.len()
    }

    fn all_queues(&self) -> Vec<Arc<DispatchQueue>> {
        self.queues
            .lock(&self.gate)
            .queues
            .values()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------------
    // User closures
    // ------------------------------------------------------------------------

    /// Install the hook that runs `(func, arg)` closures
    pub fn set_upcall<F>(&self, upcall: F)
    where
        F: Fn(usize, usize) -> WorkResult + Send + Sync + 'static,
    {
        *self.upcall.lock() = Some(Arc::new(upcall));
    }

    /// Wrap `(func, arg)` into a closure that calls the upcall hook
    pub fn user_closure(&self, func: usize, arg: usize) -> KResult<Closure> {
        if func == 0 {
            return Err(KernelError::InvalidArgument);
        }
        let upcall = self
            .upcall
            .lock()
            .clone()
            .ok_or(KernelError::InvalidArgument)?;
        Ok(Closure::new(move || upcall(func, arg)))
    }

    // ------------------------------------------------------------------------
    // Syscalls
    // ------------------------------------------------------------------------

    /// Add an entry to the syscall table
    pub fn register_syscall(&self, number: usize, entry: Syscall) -> KResult<()> {
        self.syscalls.lock(&self.gate).register(number, entry)
    }

    pub(crate) fn syscall_entry(&self, number: usize) -> KResult<Syscall> {
        self.syscalls.lock(&self.gate).get(number)
    }

    pub(crate) fn trap_stats(&self) -> &TrapStats {
        &self.trap_stats
    }

    pub fn syscall_stats(&self) -> TrapStatsSnapshot {
        self.trap_stats.snapshot()
    }

    /// Trap from the running VCPU with `scno` and `args` in its registers
    ///
    /// Returns the result word as the VCPU would see it.
    pub fn syscall(&self, scno: usize, args: &[usize]) -> isize {
        self.trap(scno, args).result
    }

    /// Like [`syscall`](Self::syscall) with the full trap record
    pub fn trap(&self, scno: usize, args: &[usize]) -> TrapOutcome {
        self.sched.with_live_context(|ctx| {
            ctx.set_gpr(REG_SCNO, scno);
            for i in 0..MAX_SYSCALL_ARGS {
                ctx.set_gpr(REG_ARG0 + i, args.get(i).copied().unwrap_or(0));
            }
        });
        trap::handle_syscall(self)
    }

    // ------------------------------------------------------------------------
    // Timer
    // ------------------------------------------------------------------------

    /// Timer vector fired
    pub fn timer_interrupt(&self) -> Tick {
        self.gate.raise(IRQ_VECTOR_TIMER);
        self.service_timer()
    }

    /// Charge delivered timer interrupts and wake lanes with due timers
    fn service_timer(&self) -> Tick {
        let ticks = self.timer_pending.swap(0, Ordering::AcqRel);
        if ticks == 0 {
            return self.sched.now();
        }
        let mut now = self.sched.now();
        for _ in 0..ticks {
            now = self.sched.tick();
        }
        for queue in self.all_queues() {
            queue.poll_timers(now);
        }
        now
    }

    // ------------------------------------------------------------------------
    // Core loop
    // ------------------------------------------------------------------------

    /// Run one step of the VCPU on the core
    pub fn run_once(&self) -> Step {
        self.service_timer();
        if self.sched.current() == IDLE_VCPU {
            self.sched.preempt_point();
        }

        let current = self.sched.current();
        let step = match self.sched.role(current) {
            Ok(VcpuRole::DispatchWorker { queue }) => self.run_worker(current, queue),
            Ok(VcpuRole::User) => {
                self.sched.yield_now();
                Step::User(current)
            }
            Ok(VcpuRole::Idle) | Err(_) => Step::Idle,
        };
        self.sched.preempt_point();
        step
    }

    /// Step until only the idle VCPU is runnable or `limit` steps ran
    ///
    /// Returns the number of steps that did work.
    pub fn run_until_idle(&self, limit: usize) -> usize {
        let mut steps = 0;
        while steps < limit {
            match self.run_once() {
                Step::Idle if self.sched.ready_count() == 0 => break,
                Step::Idle => {}
                _ => steps += 1,
            }
        }
        steps
    }

    fn run_worker(&self, vcpu: VcpuId, queue_id: QueueId) -> Step {
        let retire = || {
            let _ = self.sched.terminate(vcpu);
            Step::Retired(vcpu)
        };
        let Ok(queue) = self.queue(queue_id) else {
            return retire();
        };
        let Some(lane) = queue.lane_of(vcpu) else {
            return retire();
        };

        match queue.run_lane(lane) {
            Ok(DrainStatus::Ran(work)) => Step::Ran {
                vcpu,
                queue: queue_id,
                work,
            },
            Ok(DrainStatus::Faulted { work, action, .. }) => Step::Faulted {
                vcpu,
                queue: queue_id,
                work,
                action,
            },
            Ok(DrainStatus::OwnerFault { fault, .. }) => {
                let owner = queue.owner();
                if let Err(err) = self.terminate_process(owner, fault.into()) {
                    error!("kernel: could not terminate {:?} after fault: {}", owner, err);
                    let _ = self.destroy_queue(queue_id);
                }
                Step::OwnerFault {
                    queue: queue_id,
                    owner,
                    fault,
                }
            }
            Ok(DrainStatus::Idle) => {
                queue.park(lane);
                let _ = self.sched.wait(WaitReason::DispatchIdle);
                Step::Parked(vcpu)
            }
            Ok(DrainStatus::Terminated) => retire(),
            Err(err) => {
                debug!("kernel: {} lane {} not runnable: {}", queue_id, lane, err);
                Step::Idle
            }
        }
    }
}

// ============================================================================
// Global Kernel
// ============================================================================

static KERNEL: Once<Kernel> = Once::new();

/// Boot the global kernel; later calls return the first instance
pub fn init(config: KernelConfig) -> KResult<&'static Kernel> {
    KERNEL.try_call_once(|| Kernel::new(config))
}

/// The global kernel, once booted
pub fn kernel() -> Option<&'static Kernel> {
    KERNEL.get()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedConfig;
    use crate::dispatch::QueueState;
    use crate::error::errno::{EBADF, EINVAL, ENOSYS};
    use crate::kern::syscall_sw::*;
    use crate::kern::vcpu::{VcpuState, TRAP_INSN_LEN};

    fn kernel_with(slots: usize) -> Kernel {
        Kernel::new(KernelConfig {
            sched: SchedConfig {
                max_vcpus: slots,
                ..SchedConfig::default()
            },
            ..KernelConfig::default()
        })
        .unwrap()
    }

    /// Acquire a user VCPU for `pid` and put it on the core
    fn run_user(k: &Kernel, pid: ProcessId) -> VcpuId {
        let id = k
            .scheduler()
            .acquire(&crate::kern::vcpu::AcquireParams::new(0x1000).with_priority(50), pid)
            .unwrap();
        k.scheduler().preempt_point();
        assert_eq!(k.scheduler().current(), id);
        id
    }

    #[test]
    fn test_boot_opens_gate() {
        let k = kernel_with(4);
        assert!(k.gate().is_enabled());
        assert_eq!(k.gate().depth(), 0);
        assert_eq!(k.scheduler().current(), IDLE_VCPU);
        assert!(Kernel::new(KernelConfig::with_max_vcpus(0)).is_err());
    }

    #[test]
    fn test_acquire_across_processes_with_one_slot_left() {
        let k = kernel_with(3);
        let a = k.create_process();
        let b = k.create_process();
        let caller_a = run_user(&k, a);
        let caller_b = k
            .scheduler()
            .acquire(&crate::kern::vcpu::AcquireParams::new(0x2000).with_priority(50), b)
            .unwrap();
        assert_eq!(k.scheduler().free_slots(), 1);

        let first = k.syscall(SC_VCPU_ACQUIRE, &[40, 0, 0x3000, 0, 0]);
        assert!(first > 0);

        // Process b gets the core and tries for the same slot
        assert_eq!(k.syscall(SC_VCPU_YIELD, &[]), 0);
        assert_eq!(k.scheduler().current(), caller_b);
        let second = k.syscall(SC_VCPU_ACQUIRE, &[40, 0, 0x3000, 0, 0]);
        assert_eq!(second, -1);
        assert_eq!(k.scheduler().errno(caller_b), Ok(crate::error::errno::ENOMEM));
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), crate::error::errno::ENOMEM as isize);

        assert_eq!(k.scheduler().vcpus_of(a).len(), 2);
        assert_eq!(k.scheduler().vcpus_of(b), [caller_b]);
        assert_eq!(k.scheduler().state(caller_a), VcpuState::Ready);
    }

    #[test]
    fn test_unknown_syscall_resumes_caller() {
        let k = kernel_with(4);
        let pid = k.create_process();
        let caller = run_user(&k, pid);
        let pc = k.scheduler().live_context().pc();

        let outcome = k.trap(SYSCALL_TABLE_CAPACITY + 5, &[]);
        assert_eq!(outcome.error, Some(KernelError::InvalidSyscall));
        assert_eq!(outcome.result, -(ENOSYS as isize));
        assert_eq!(k.scheduler().current(), caller);
        assert_eq!(k.scheduler().live_context().pc(), pc + TRAP_INSN_LEN);
        assert_eq!(k.scheduler().errno(caller), Ok(ENOSYS));
        assert_eq!(k.syscall_stats().invalid_calls, 1);

        // Unregistered slot inside the table behaves the same
        assert_eq!(k.syscall(30, &[]), -(ENOSYS as isize));
    }

    #[test]
    fn test_vcpu_syscalls() {
        let k = kernel_with(4);
        let pid = k.create_process();
        let caller = run_user(&k, pid);

        assert_eq!(k.syscall(SC_VCPU_GETID, &[]), caller.0 as isize);
        assert_eq!(k.syscall(SC_VCPU_SETDATA, &[0xbeef]), 0);
        assert_eq!(k.syscall(SC_VCPU_GETDATA, &[]), 0xbeef);
        assert_eq!(k.live_result(), 0xbeef);

        // Would read back as a negative word
        assert_eq!(k.syscall(SC_VCPU_SETDATA, &[usize::MAX]), -(EINVAL as isize));
        assert_eq!(k.syscall(SC_VCPU_GETDATA, &[]), 0xbeef);

        // Bad band goes through errno
        assert_eq!(k.syscall(SC_VCPU_SETPRIORITY, &[caller.0 as usize, 63]), -1);
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), EINVAL as isize);

        // Unknown acquire flags are rejected
        assert_eq!(k.syscall(SC_VCPU_ACQUIRE, &[40, 0, 0x3000, 0, 0x80]), -1);
    }

    #[test]
    fn test_suspend_other_process_vcpu_is_refused() {
        let k = kernel_with(4);
        let a = k.create_process();
        let b = k.create_process();
        let foreign = k
            .scheduler()
            .acquire(&crate::kern::vcpu::AcquireParams::new(0x2000).with_priority(10), b)
            .unwrap();
        run_user(&k, a);
        assert_eq!(k.syscall(SC_VCPU_SUSPEND, &[foreign.0 as usize]), -1);
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), EBADF as isize);
        assert_eq!(k.scheduler().state(foreign), VcpuState::Ready);
    }

    #[test]
    fn test_relinquish_syscall_frees_slot() {
        let k = kernel_with(1);
        let pid = k.create_process();
        let caller = run_user(&k, pid);
        let outcome = k.trap(SC_VCPU_RELINQUISH_SELF, &[]);
        assert_eq!(outcome.caller, caller);
        assert_eq!(k.scheduler().current(), IDLE_VCPU);
        assert_eq!(k.scheduler().state(caller), VcpuState::Unbound);
        assert_eq!(k.scheduler().free_slots(), 1);
    }

    #[test]
    fn test_yield_syscall_round_robin() {
        let k = kernel_with(4);
        let pid = k.create_process();
        let a = run_user(&k, pid);
        let b = k
            .scheduler()
            .acquire(&crate::kern::vcpu::AcquireParams::new(0x2000).with_priority(50), pid)
            .unwrap();
        let pc = k.scheduler().live_context().pc();
        assert_eq!(k.syscall(SC_VCPU_YIELD, &[]), 0);
        assert_eq!(k.scheduler().current(), b);
        // The yielding VCPU resumes after its trap when it runs again
        assert_eq!(k.scheduler().saved_context(a).unwrap().pc(), pc + TRAP_INSN_LEN);
    }

    #[test]
    fn test_serial_queue_through_syscalls() {
        let k = kernel_with(8);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            k.set_upcall(move |func, arg| {
                seen.lock().push((func, arg));
                Ok(())
            });
        }
        let pid = k.create_process();
        run_user(&k, pid);

        let queue = k.syscall(SC_DISPATCH_CREATE, &[0, 1, 40, 0]);
        assert!(queue > 0);
        for arg in [b'A', b'B', b'C'] {
            assert!(k.syscall(SC_DISPATCH_ASYNC, &[queue as usize, 0x5000, arg as usize, 0]) > 0);
        }
        let q = k.queue(QueueId(queue as u32)).unwrap();
        assert_eq!(q.pending(), 3);

        // Give up the core so the worker can drain
        k.syscall(SC_VCPU_SUSPEND, &[k.scheduler().current().0 as usize]);
        k.run_until_idle(32);
        assert_eq!(
            *seen.lock(),
            [(0x5000, b'A' as usize), (0x5000, b'B' as usize), (0x5000, b'C' as usize)]
        );
        assert_eq!(q.pending(), 0);
        assert_eq!(q.in_flight(), 0);
        assert_eq!(k.scheduler().state(q.lanes()[0]), VcpuState::Waiting(WaitReason::DispatchIdle));
    }

    #[test]
    fn test_submission_wakes_parked_worker() {
        let k = kernel_with(8);
        let pid = k.create_process();
        let id = k.create_queue(pid, QueueAttrs::serial()).unwrap();
        let q = k.queue(id).unwrap();
        let hits = Arc::new(AtomicU32::new(0));

        let counter = hits.clone();
        q.submit(Closure::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        k.run_until_idle(16);
        let worker = q.lanes()[0];
        assert_eq!(k.scheduler().state(worker), VcpuState::Waiting(WaitReason::DispatchIdle));

        let counter = hits.clone();
        q.submit(Closure::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        assert_eq!(k.scheduler().state(worker), VcpuState::Ready);
        k.run_until_idle(16);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_timer_wakes_lane_with_due_item() {
        let k = kernel_with(8);
        let pid = k.create_process();
        let id = k.create_queue(pid, QueueAttrs::serial()).unwrap();
        let q = k.queue(id).unwrap();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        q.submit_after(
            Tick(3),
            None,
            Closure::from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        k.run_until_idle(16);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        for _ in 0..3 {
            k.timer_interrupt();
        }
        assert_eq!(k.scheduler().now(), Tick(3));
        k.run_until_idle(16);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_past_deadline_timer_wakes_parked_lane() {
        let k = kernel_with(8);
        let pid = k.create_process();
        let q = k.queue(k.create_queue(pid, QueueAttrs::serial()).unwrap()).unwrap();
        q.submit(Closure::from_fn(|| {})).unwrap();
        k.run_until_idle(16);
        let worker = q.lanes()[0];
        assert_eq!(k.scheduler().state(worker), VcpuState::Waiting(WaitReason::DispatchIdle));

        k.timer_interrupt();
        k.timer_interrupt();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        q.submit_after(
            Tick(1),
            None,
            Closure::from_fn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();
        assert_eq!(k.scheduler().state(worker), VcpuState::Ready);
        assert!(k.run_until_idle(16) > 0);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_idle_workers_release_their_slots() {
        let k = kernel_with(4);
        let pid = k.create_process();
        let q = k.queue(k.create_queue(pid, QueueAttrs::concurrent(4)).unwrap()).unwrap();
        for _ in 0..12 {
            q.submit(Closure::from_fn(|| {})).unwrap();
        }
        assert_eq!(q.lanes().len(), 4);
        k.run_until_idle(100);
        assert_eq!(q.pending(), 0);
        assert_eq!(k.scheduler().free_slots(), 0);

        for _ in 0..k.config().dispatch.lane_idle_ticks {
            k.timer_interrupt();
        }
        assert!(q.lanes().is_empty());
        assert_eq!(k.scheduler().free_slots(), 4);
        assert!(k
            .scheduler()
            .acquire(&crate::kern::vcpu::AcquireParams::new(0x1000), pid)
            .is_ok());

        // New work brings a lane back
        q.submit(Closure::from_fn(|| {})).unwrap();
        assert_eq!(q.lanes().len(), 1);
    }

    #[test]
    fn test_terminate_releases_parked_workers() {
        let k = kernel_with(4);
        let pid = k.create_process();
        let attrs = QueueAttrs::concurrent(2).with_min_concurrency(2);
        let q = k.queue(k.create_queue(pid, attrs).unwrap()).unwrap();
        q.submit(Closure::from_fn(|| {})).unwrap();
        q.submit(Closure::from_fn(|| {})).unwrap();
        k.run_until_idle(16);
        let workers = q.lanes();
        assert_eq!(workers.len(), 2);

        q.terminate();
        assert_eq!(q.state(), QueueState::Terminating);
        for &worker in &workers {
            assert_eq!(k.scheduler().state(worker), VcpuState::Ready);
        }

        k.run_until_idle(16);
        assert!(q.is_termination_completed());
        assert!(q.lanes().is_empty());
        assert_eq!(k.scheduler().bound_count(), 0);
    }

    #[test]
    fn test_timer_masked_is_charged_later() {
        let k = kernel_with(4);
        {
            let _guard = k.gate().guard();
            k.gate().raise(IRQ_VECTOR_TIMER);
            assert_eq!(k.scheduler().now(), Tick::ZERO);
        }
        k.run_once();
        assert_eq!(k.scheduler().now(), Tick(1));
    }

    #[test]
    fn test_unhandled_fault_terminates_owner_only() {
        let k = kernel_with(8);
        let victim = k.create_process();
        let bystander = k.create_process();
        let bad = k.queue(k.create_queue(victim, QueueAttrs::serial()).unwrap()).unwrap();
        let good = k.queue(k.create_queue(bystander, QueueAttrs::serial()).unwrap()).unwrap();
        let ran = Arc::new(AtomicU32::new(0));

        bad.submit(Closure::new(|| Err(Fault::new(11, "segv")))).unwrap();
        bad.submit(Closure::from_fn(|| {})).unwrap();
        let counter = ran.clone();
        good.submit(Closure::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let mut owner_fault = None;
        for _ in 0..16 {
            if let Step::OwnerFault { owner, fault, .. } = k.run_once() {
                owner_fault = Some((owner, fault.code));
            }
        }
        assert_eq!(owner_fault, Some((victim, 11)));
        assert!(!k.is_alive(victim));
        assert!(k.scheduler().vcpus_of(victim).is_empty());
        assert_eq!(k.queue(bad.id()).err(), Some(KernelError::InvalidQueue));
        assert_eq!(
            k.processes().get(k.gate(), victim).unwrap().exit_reason,
            Some(KernelError::Fault(11))
        );

        // The other process keeps running
        assert!(k.is_alive(bystander));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_terminate_process_discards_queue_work() {
        let k = kernel_with(8);
        let pid = k.create_process();
        let id = k.create_queue(pid, QueueAttrs::serial()).unwrap();
        let q = k.queue(id).unwrap();
        for _ in 0..3 {
            q.submit(Closure::from_fn(|| {})).unwrap();
        }
        k.terminate_process(pid, KernelError::Interrupted).unwrap();
        assert_eq!(q.stats().discarded, 3);
        assert_eq!(k.queue_count(), 0);
        assert_eq!(k.scheduler().bound_count(), 0);
        assert_eq!(k.create_queue(pid, QueueAttrs::serial()), Err(KernelError::InvalidHandle));
    }

    #[test]
    fn test_dispatch_syscalls_check_ownership() {
        let k = kernel_with(8);
        k.set_upcall(|_, _| Ok(()));
        let a = k.create_process();
        let b = k.create_process();
        let foreign = k.create_queue(b, QueueAttrs::serial()).unwrap();
        run_user(&k, a);

        assert_eq!(k.syscall(SC_DISPATCH_ASYNC, &[foreign.0 as usize, 0x5000, 0, 0]), -1);
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), EBADF as isize);
        assert_eq!(k.syscall(SC_DISPATCH_DESTROY, &[foreign.0 as usize]), -1);
        assert!(k.queue(foreign).is_ok());
    }

    #[test]
    fn test_dispatch_after_and_remove_by_tag() {
        let k = kernel_with(8);
        k.set_upcall(|_, _| Ok(()));
        let pid = k.create_process();
        run_user(&k, pid);
        let queue = k.syscall(SC_DISPATCH_CREATE, &[0, 1, 40, 0]) as usize;

        assert!(k.syscall(SC_DISPATCH_AFTER, &[queue, 100, 0x5000, 1, 7]) > 0);
        assert!(k.syscall(SC_DISPATCH_ASYNC, &[queue, 0x5000, 2, 7]) > 0);
        assert!(k.syscall(SC_DISPATCH_ASYNC, &[queue, 0x5000, 3, 8]) > 0);
        assert_eq!(k.syscall(SC_DISPATCH_REMOVE_BY_TAG, &[queue, 7]), 2);
        assert_eq!(k.syscall(SC_DISPATCH_FLUSH, &[queue]), 1);
        assert_eq!(k.syscall(SC_DISPATCH_DESTROY, &[queue]), 0);
        // Stale handle
        assert_eq!(k.syscall(SC_DISPATCH_FLUSH, &[queue]), -1);
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), EBADF as isize);
    }

    #[test]
    fn test_dispatch_async_needs_upcall() {
        let k = kernel_with(8);
        let pid = k.create_process();
        run_user(&k, pid);
        let queue = k.syscall(SC_DISPATCH_CREATE, &[0, 1, 40, 0]) as usize;
        assert_eq!(k.syscall(SC_DISPATCH_ASYNC, &[queue, 0x5000, 0, 0]), -1);
        assert_eq!(k.syscall(SC_VCPU_ERRNO, &[]), EINVAL as isize);
    }

    #[test]
    fn test_clock_syscall() {
        let k = kernel_with(4);
        k.timer_interrupt();
        k.timer_interrupt();
        assert_eq!(k.syscall(SC_CLOCK_TICKS, &[]), 2);
    }

    #[test]
    fn test_register_syscall() {
        fn answer(_ctx: &SyscallContext<'_>, _args: &TrapArgs) -> KResult<usize> {
            Ok(42)
        }
        let k = kernel_with(4);
        k.register_syscall(20, Syscall::new("answer", 0, answer)).unwrap();
        assert_eq!(k.syscall(20, &[]), 42);
        assert_eq!(
            k.register_syscall(SC_VCPU_YIELD, Syscall::new("answer", 0, answer)),
            Err(KernelError::Busy)
        );
    }

    #[test]
    fn test_global_init() {
        let first = init(KernelConfig::default()).unwrap() as *const Kernel;
        let again = init(KernelConfig::with_max_vcpus(2)).unwrap() as *const Kernel;
        assert_eq!(first, again);
        assert!(kernel().is_some());
    }

    impl Kernel {
        fn live_result(&self) -> isize {
            self.sched.live_context().gpr(crate::kern::vcpu::REG_RESULT) as isize
        }
    }
}
