//! VCPU scheduler
//!
//! Fixed priority bands with strict preemption and round-robin within a
//! band. One VCPU owns the core at a time; when nothing is ready the idle
//! VCPU runs.
//!
//! All scheduler state sits behind one [`IrqLock`], so every mutation and
//! every context switch happens with the interrupt gate closed. The timer
//! interrupt only charges the running VCPU and raises `need_resched`; the
//! switch itself happens at the next safe point (`preempt_point`, yield,
//! wait, relinquish).

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use log::{debug, trace};

use crate::config::SchedConfig;
use crate::error::errno::Errno;
use crate::error::{KResult, KernelError};
use crate::interrupt::{IrqGate, IrqLock};
use crate::kern::runq::{Priority, ReadyQueue};
use crate::kern::sched_prim::{WaitReason, WaitResult};
use crate::kern::vcpu::{
    AcquireFlags, AcquireParams, CpuContext, ExitReason, Vcpu, VcpuInfo, VcpuRole, VcpuStack,
    VcpuState,
};
use crate::types::{ProcessId, Tick, VcpuId};

/// Id of the idle VCPU
pub const IDLE_VCPU: VcpuId = VcpuId(0);

// ============================================================================
// Statistics
// ============================================================================

/// Scheduler statistics
pub struct SchedStats {
    /// Total context switches
    pub context_switches: AtomicU64,
    /// Total ticks
    pub ticks: AtomicU64,
    /// Ticks spent in the idle VCPU
    pub idle_ticks: AtomicU64,
    /// Slices that ran out
    pub quantum_expiries: AtomicU64,
    /// Switches forced by a higher band
    pub preemptions: AtomicU64,
    /// Successful acquisitions
    pub acquired: AtomicU64,
    /// VCPUs whose resources were released
    pub reaped: AtomicU64,
}

impl SchedStats {
    const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            quantum_expiries: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            acquired: AtomicU64::new(0),
            reaped: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> SchedStatsSnapshot {
        SchedStatsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
            idle_ticks: self.idle_ticks.load(Ordering::Relaxed),
            quantum_expiries: self.quantum_expiries.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            acquired: self.acquired.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of scheduler statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedStatsSnapshot {
    pub context_switches: u64,
    pub ticks: u64,
    pub idle_ticks: u64,
    pub quantum_expiries: u64,
    pub preemptions: u64,
    pub acquired: u64,
    pub reaped: u64,
}

// ============================================================================
// Scheduler State
// ============================================================================

/// Where the outgoing VCPU goes on a switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requeue {
    /// Tail of its band with a fresh slice
    Tail,
    /// Head of its band, keeping what is left of its slice
    Front,
    /// Not runnable; its state was already set by the caller
    None,
}

struct SchedState {
    vcpus: BTreeMap<VcpuId, Vcpu>,
    ready: ReadyQueue,
    running: VcpuId,
    /// Exited VCPUs whose resources are released once off the core
    finalizer: Vec<VcpuId>,
    /// Stacks of reaped VCPUs kept for reuse
    stack_cache: Vec<VcpuStack>,
    cache_limit: usize,
    /// Slots in use, reservations included
    bound: usize,
    next_id: u32,
    /// Register file of the core
    live: CpuContext,
    now: Tick,
}

impl SchedState {
    fn vcpu(&self, id: VcpuId) -> KResult<&Vcpu> {
        self.vcpus.get(&id).ok_or(KernelError::InvalidHandle)
    }

    fn vcpu_mut(&mut self, id: VcpuId) -> KResult<&mut Vcpu> {
        self.vcpus.get_mut(&id).ok_or(KernelError::InvalidHandle)
    }

    /// Look up a VCPU that may still be scheduled
    fn live_vcpu_mut(&mut self, id: VcpuId) -> KResult<&mut Vcpu> {
        let vcpu = self.vcpu_mut(id)?;
        if vcpu.state.is_terminal() {
            return Err(KernelError::InvalidHandle);
        }
        Ok(vcpu)
    }

    fn running_priority(&self) -> Priority {
        self.vcpus
            .get(&self.running)
            .map(|v| v.priority)
            .unwrap_or(Priority::IDLE)
    }

    fn make_ready(&mut self, id: VcpuId, front: bool) {
        if let Some(vcpu) = self.vcpus.get_mut(&id) {
            vcpu.state = VcpuState::Ready;
            if front {
                self.ready.push_front(id, vcpu.priority);
            } else {
                vcpu.refill_quantum();
                self.ready.push_back(id, vcpu.priority);
            }
        }
    }

    /// A ready VCPU outranks the one on the core
    fn preemption_pending(&self) -> bool {
        self.ready
            .highest()
            .is_some_and(|pri| pri > self.running_priority())
    }

    /// Take the next VCPU off the ready queue, falling back to idle
    fn pick_next(&mut self) -> VcpuId {
        self.ready.pop().map(|(id, _)| id).unwrap_or(IDLE_VCPU)
    }

    /// Move the core from the running VCPU to `next`
    fn switch_to(&mut self, next: VcpuId, stats: &SchedStats) {
        let prev = self.running;
        if prev == next {
            if let Some(vcpu) = self.vcpus.get_mut(&next) {
                vcpu.state = VcpuState::Running;
            }
            return;
        }

        if let Some(old) = self.vcpus.get_mut(&prev) {
            old.context = self.live;
        }
        if let Some(new) = self.vcpus.get_mut(&next) {
            new.state = VcpuState::Running;
            self.live = new.context;
        }
        self.running = next;
        stats.context_switches.fetch_add(1, Ordering::Relaxed);
        trace!("sched: switch {} -> {}", prev, next);
    }

    /// Give up the core; `requeue` says what happens to the outgoing VCPU
    fn reschedule(&mut self, requeue: Requeue, stats: &SchedStats) -> VcpuId {
        let prev = self.running;
        if prev != IDLE_VCPU {
            match requeue {
                Requeue::Tail => self.make_ready(prev, false),
                Requeue::Front => self.make_ready(prev, true),
                Requeue::None => {}
            }
        } else if let Some(idle) = self.vcpus.get_mut(&IDLE_VCPU) {
            idle.state = VcpuState::Ready;
        }

        let next = self.pick_next();
        self.switch_to(next, stats);
        self.reap(stats);
        next
    }

    /// Release every finalized VCPU that is off the core
    fn reap(&mut self, stats: &SchedStats) {
        let running = self.running;
        let mut keep = Vec::new();
        for id in core::mem::take(&mut self.finalizer) {
            if id == running {
                keep.push(id);
                continue;
            }
            if let Some(vcpu) = self.vcpus.remove(&id) {
                self.bound -= 1;
                if self.stack_cache.len() < self.cache_limit {
                    self.stack_cache.push(vcpu.stack);
                }
                stats.reaped.fetch_add(1, Ordering::Relaxed);
                debug!("sched: reaped {} ({:?})", id, vcpu.exit);
            }
        }
        self.finalizer = keep;
    }

    /// Mark `id` as finished and queue it for reaping
    fn finish(&mut self, id: VcpuId, reason: ExitReason) -> KResult<()> {
        let vcpu = self.live_vcpu_mut(id)?;
        let prev_state = vcpu.state;
        let priority = vcpu.priority;
        vcpu.state = match reason {
            ExitReason::Relinquished => VcpuState::Relinquished,
            ExitReason::Terminated => VcpuState::Terminated,
        };
        vcpu.exit = Some(reason);
        if prev_state == VcpuState::Ready {
            self.ready.remove(id, priority);
        }
        self.finalizer.push(id);
        Ok(())
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Main scheduler structure
pub struct Scheduler {
    gate: Arc<IrqGate>,
    config: SchedConfig,
    state: IrqLock<SchedState>,
    stats: SchedStats,
    /// Set by tick/wakeup, consumed at the next safe point
    need_resched: AtomicBool,
}

impl Scheduler {
    /// Create a scheduler whose core is running the idle VCPU
    pub fn new(gate: Arc<IrqGate>, config: SchedConfig) -> Self {
        let mut idle = Vcpu::new(
            IDLE_VCPU,
            ProcessId::KERNEL,
            VcpuRole::Idle,
            Priority::IDLE,
            VcpuStack::empty(),
            CpuContext::reset(),
        );
        idle.state = VcpuState::Running;

        let mut vcpus = BTreeMap::new();
        vcpus.insert(IDLE_VCPU, idle);

        Self {
            gate,
            config,
            state: IrqLock::new(SchedState {
                vcpus,
                ready: ReadyQueue::new(),
                running: IDLE_VCPU,
                finalizer: Vec::new(),
                stack_cache: Vec::new(),
                cache_limit: config.reuse_cache,
                bound: 0,
                next_id: IDLE_VCPU.0 + 1,
                live: CpuContext::reset(),
                now: Tick::ZERO,
            }),
            stats: SchedStats::new(),
            need_resched: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<IrqGate> {
        &self.gate
    }

    // ------------------------------------------------------------------------
    // Acquisition
    // ------------------------------------------------------------------------

    /// Bind a new VCPU for `owner`
    ///
    /// The VCPU is admitted to the ready queue right away unless
    /// `AcquireFlags::SUSPENDED` is set, in which case it stays `Acquired`
    /// until resumed.
    pub fn acquire(&self, params: &AcquireParams, owner: ProcessId) -> KResult<VcpuId> {
        self.acquire_as(params, owner, VcpuRole::User)
    }

    pub(crate) fn acquire_as(
        &self,
        params: &AcquireParams,
        owner: ProcessId,
        role: VcpuRole,
    ) -> KResult<VcpuId> {
        let priority = Priority::user(params.priority)?;
        let stack_size = match params.stack_size {
            0 => self.config.default_stack_size,
            size if size < self.config.min_stack_size || size > self.config.max_stack_size => {
                return Err(KernelError::InvalidArgument)
            }
            size => size,
        };
        if role == VcpuRole::User && params.entry == 0 {
            return Err(KernelError::InvalidArgument);
        }

        // Reserve a slot, then allocate with the gate open
        let cached = {
            let mut st = self.state.lock(&self.gate);
            st.reap(&self.stats);
            if st.bound >= self.config.max_vcpus {
                debug!("sched: acquire for {:?} refused, {} slots in use", owner, st.bound);
                return Err(KernelError::ResourceExhausted);
            }
            st.bound += 1;
            st.stack_cache
                .iter()
                .position(|s| s.size() == stack_size)
                .map(|pos| st.stack_cache.swap_remove(pos))
        };

        let stack = match cached {
            Some(stack) => stack,
            None => match VcpuStack::allocate(stack_size) {
                Ok(stack) => stack,
                Err(err) => {
                    self.state.lock(&self.gate).bound -= 1;
                    return Err(err);
                }
            },
        };

        let context = CpuContext::initial(params.entry, stack.top(), params.arg);
        let mut st = self.state.lock(&self.gate);
        let id = VcpuId(st.next_id);
        st.next_id += 1;
        st.vcpus
            .insert(id, Vcpu::new(id, owner, role, priority, stack, context));

        if !params.flags.contains(AcquireFlags::SUSPENDED) {
            st.make_ready(id, false);
            if st.preemption_pending() {
                self.need_resched.store(true, Ordering::Release);
            }
        }
        self.stats.acquired.fetch_add(1, Ordering::Relaxed);
        debug!(
            "sched: acquired {} for {:?} (pri {}, stack {})",
            id,
            owner,
            priority.value(),
            stack_size
        );
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Voluntary transitions of the running VCPU
    // ------------------------------------------------------------------------

    /// Give up the rest of the slice
    ///
    /// The caller goes to the tail of its band and the highest ready VCPU
    /// takes the core, which may be the caller again. Returns the VCPU now
    /// running.
    pub fn yield_now(&self) -> VcpuId {
        self.assert_gate_open("yield");
        let mut st = self.state.lock(&self.gate);
        self.need_resched.store(false, Ordering::Release);
        st.reschedule(Requeue::Tail, &self.stats)
    }

    /// Permanently end the running VCPU
    ///
    /// Its slot is released once the core has switched away; the id turns
    /// stale. Returns the VCPU now running.
    pub fn relinquish_self(&self) -> KResult<VcpuId> {
        self.assert_gate_open("relinquish");
        let mut st = self.state.lock(&self.gate);
        let current = st.running;
        if current == IDLE_VCPU {
            return Err(KernelError::Busy);
        }
        st.finish(current, ExitReason::Relinquished)?;
        debug!("sched: {} relinquished", current);
        Ok(st.reschedule(Requeue::None, &self.stats))
    }

    /// Park the running VCPU until [`wakeup`](Self::wakeup)
    pub fn wait(&self, reason: WaitReason) -> KResult<VcpuId> {
        self.assert_gate_open("wait");
        let mut st = self.state.lock(&self.gate);
        let current = st.running;
        if current == IDLE_VCPU {
            return Err(KernelError::Busy);
        }
        let vcpu = st.vcpu_mut(current)?;
        vcpu.state = VcpuState::Waiting(reason);
        vcpu.wait_result = None;
        trace!("sched: {} waits ({})", current, reason.name());
        Ok(st.reschedule(Requeue::None, &self.stats))
    }

    // ------------------------------------------------------------------------
    // Transitions of other VCPUs
    // ------------------------------------------------------------------------

    /// End a VCPU on behalf of its owner
    pub fn terminate(&self, id: VcpuId) -> KResult<()> {
        let mut st = self.state.lock(&self.gate);
        if id == IDLE_VCPU {
            return Err(KernelError::Busy);
        }
        st.finish(id, ExitReason::Terminated)?;
        debug!("sched: {} terminated", id);
        if st.running == id {
            st.reschedule(Requeue::None, &self.stats);
        } else {
            st.reap(&self.stats);
        }
        Ok(())
    }

    /// Make a waiting VCPU runnable again
    ///
    /// Returns `false` if `id` was not waiting.
    pub fn wakeup(&self, id: VcpuId, result: WaitResult) -> KResult<bool> {
        let mut st = self.state.lock(&self.gate);
        let vcpu = st.live_vcpu_mut(id)?;
        if !matches!(vcpu.state, VcpuState::Waiting(_)) {
            return Ok(false);
        }
        vcpu.wait_result = Some(result);
        if vcpu.suspension_count > 0 {
            vcpu.state = VcpuState::Suspended;
        } else {
            st.make_ready(id, false);
            if st.preemption_pending() {
                self.need_resched.store(true, Ordering::Release);
            }
        }
        Ok(true)
    }

    /// Increment the suspension count of `id`
    ///
    /// A ready VCPU leaves the ready queue; the running VCPU is switched
    /// away. Waiting and not-yet-resumed VCPUs keep their state and are
    /// parked once they would otherwise become ready.
    pub fn suspend(&self, id: VcpuId) -> KResult<()> {
        if id == IDLE_VCPU {
            return Err(KernelError::Busy);
        }
        if id == self.current() {
            self.assert_gate_open("suspend self");
        }
        let mut st = self.state.lock(&self.gate);
        let vcpu = st.live_vcpu_mut(id)?;
        vcpu.suspension_count = vcpu
            .suspension_count
            .checked_add(1)
            .ok_or(KernelError::InvalidArgument)?;
        let (state, priority) = (vcpu.state, vcpu.priority);
        match state {
            VcpuState::Ready => {
                st.ready.remove(id, priority);
                st.vcpu_mut(id)?.state = VcpuState::Suspended;
            }
            VcpuState::Running => {
                st.vcpu_mut(id)?.state = VcpuState::Suspended;
                st.reschedule(Requeue::None, &self.stats);
            }
            _ => {}
        }
        Ok(())
    }

    /// Undo one suspension (all of them with `force`)
    ///
    /// Also admits a VCPU that was acquired suspended.
    pub fn resume(&self, id: VcpuId, force: bool) -> KResult<()> {
        let mut st = self.state.lock(&self.gate);
        let vcpu = st.live_vcpu_mut(id)?;
        if vcpu.suspension_count > 0 {
            vcpu.suspension_count = if force { 0 } else { vcpu.suspension_count - 1 };
        }
        if vcpu.suspension_count == 0
            && matches!(vcpu.state, VcpuState::Suspended | VcpuState::Acquired)
        {
            st.make_ready(id, false);
            if st.preemption_pending() {
                self.need_resched.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Move `id` to another band
    pub fn set_priority(&self, id: VcpuId, priority: Priority) -> KResult<()> {
        if id == IDLE_VCPU {
            return Err(KernelError::Busy);
        }
        let mut st = self.state.lock(&self.gate);
        let vcpu = st.live_vcpu_mut(id)?;
        let (old, state) = (vcpu.priority, vcpu.state);
        if old == priority {
            return Ok(());
        }
        vcpu.priority = priority;
        match state {
            VcpuState::Ready => {
                st.ready.remove(id, old);
                st.ready.push_back(id, priority);
            }
            VcpuState::Running => {}
            _ => return Ok(()),
        }
        if st.preemption_pending() {
            self.need_resched.store(true, Ordering::Release);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Timer and safe points
    // ------------------------------------------------------------------------

    /// Charge the running VCPU one timer tick
    ///
    /// Called from the timer interrupt; never switches.
    pub fn tick(&self) -> Tick {
        let mut st = self.state.lock(&self.gate);
        st.now = st.now.saturating_add(1);
        self.stats.ticks.fetch_add(1, Ordering::Relaxed);

        let running = st.running;
        if running == IDLE_VCPU {
            self.stats.idle_ticks.fetch_add(1, Ordering::Relaxed);
            if !st.ready.is_empty() {
                self.need_resched.store(true, Ordering::Release);
            }
            return st.now;
        }

        if let Some(vcpu) = st.vcpus.get_mut(&running) {
            vcpu.quantum_left = vcpu.quantum_left.saturating_sub(1);
            if vcpu.quantum_left == 0 {
                self.stats.quantum_expiries.fetch_add(1, Ordering::Relaxed);
                self.need_resched.store(true, Ordering::Release);
            }
        }
        if st.preemption_pending() {
            self.need_resched.store(true, Ordering::Release);
        }
        st.now
    }

    /// Whether a switch is due at the next safe point
    pub fn should_reschedule(&self) -> bool {
        self.need_resched.load(Ordering::Acquire)
    }

    /// Safe preemption point (trap return, after a dispatch item)
    ///
    /// A ready VCPU of a higher band takes the core from the running one,
    /// which goes back to the head of its band. A VCPU whose slice ran out
    /// rotates to the tail of its band if a peer is ready. Returns the new
    /// VCPU if a switch happened.
    pub fn preempt_point(&self) -> Option<VcpuId> {
        let mut st = self.state.lock(&self.gate);
        let flagged = self.need_resched.swap(false, Ordering::AcqRel);
        let running = st.running;

        if st.preemption_pending() {
            if running != IDLE_VCPU {
                self.stats.preemptions.fetch_add(1, Ordering::Relaxed);
            }
            return Some(st.reschedule(Requeue::Front, &self.stats));
        }
        if !flagged || running == IDLE_VCPU {
            return None;
        }

        let (priority, expired) = match st.vcpus.get(&running) {
            Some(vcpu) => (vcpu.priority, vcpu.quantum_left == 0),
            None => return None,
        };
        if !expired {
            return None;
        }
        if st.ready.highest() == Some(priority) {
            Some(st.reschedule(Requeue::Tail, &self.stats))
        } else {
            if let Some(vcpu) = st.vcpus.get_mut(&running) {
                vcpu.refill_quantum();
            }
            None
        }
    }

    // ------------------------------------------------------------------------
    // Trap support
    // ------------------------------------------------------------------------

    /// Save the core's registers into the running VCPU
    pub(crate) fn trap_entry(&self) -> (VcpuId, CpuContext) {
        let mut st = self.state.lock(&self.gate);
        let running = st.running;
        let live = st.live;
        if let Some(vcpu) = st.vcpus.get_mut(&running) {
            vcpu.context = live;
        }
        (running, live)
    }

    /// Write a trap result into `id`'s saved context
    ///
    /// If `id` still owns the core its context is loaded back into the
    /// core's registers. A VCPU that exited during the call is skipped.
    pub(crate) fn trap_exit(&self, id: VcpuId, result: isize, errno: Option<Errno>) {
        let mut st = self.state.lock(&self.gate);
        let running = st.running;
        let Some(vcpu) = st.vcpus.get_mut(&id) else {
            return;
        };
        if vcpu.state.is_terminal() {
            return;
        }
        if let Some(err) = errno {
            vcpu.errno = err;
        }
        vcpu.context.complete_trap(result);
        let ctx = vcpu.context;
        if id == running {
            st.live = ctx;
        }
    }

    /// Copy of the core's register file
    pub fn live_context(&self) -> CpuContext {
        self.state.lock(&self.gate).live
    }

    /// Edit the core's registers (platform side of a trap)
    pub(crate) fn with_live_context<R>(&self, f: impl FnOnce(&mut CpuContext) -> R) -> R {
        let mut st = self.state.lock(&self.gate);
        f(&mut st.live)
    }

    /// Saved context of a VCPU that is not on the core
    pub fn saved_context(&self, id: VcpuId) -> KResult<CpuContext> {
        let st = self.state.lock(&self.gate);
        if st.running == id {
            return Ok(st.live);
        }
        Ok(st.vcpu(id)?.context)
    }

    // ------------------------------------------------------------------------
    // Per-VCPU user fields
    // ------------------------------------------------------------------------

    pub fn errno(&self, id: VcpuId) -> KResult<Errno> {
        Ok(self.state.lock(&self.gate).vcpu(id)?.errno)
    }

    pub fn set_errno(&self, id: VcpuId, err: Errno) -> KResult<()> {
        self.state.lock(&self.gate).live_vcpu_mut(id)?.errno = err;
        Ok(())
    }

    pub fn udata(&self, id: VcpuId) -> KResult<usize> {
        Ok(self.state.lock(&self.gate).vcpu(id)?.udata)
    }

    pub fn set_udata(&self, id: VcpuId, value: usize) -> KResult<()> {
        self.state.lock(&self.gate).live_vcpu_mut(id)?.udata = value;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// VCPU that owns the core
    pub fn current(&self) -> VcpuId {
        self.state.lock(&self.gate).running
    }

    pub fn now(&self) -> Tick {
        self.state.lock(&self.gate).now
    }

    /// State of `id`; ids that are no longer bound report `Unbound`
    pub fn state(&self, id: VcpuId) -> VcpuState {
        self.state
            .lock(&self.gate)
            .vcpus
            .get(&id)
            .map(|v| v.state)
            .unwrap_or(VcpuState::Unbound)
    }

    pub fn info(&self, id: VcpuId) -> KResult<VcpuInfo> {
        Ok(self.state.lock(&self.gate).vcpu(id)?.info())
    }

    /// Live (non-terminal) VCPUs owned by `owner`
    pub fn vcpus_of(&self, owner: ProcessId) -> Vec<VcpuId> {
        self.state
            .lock(&self.gate)
            .vcpus
            .values()
            .filter(|v| v.owner == owner && v.role != VcpuRole::Idle && !v.state.is_terminal())
            .map(|v| v.id)
            .collect()
    }

    /// Role of `id`
    pub fn role(&self, id: VcpuId) -> KResult<VcpuRole> {
        Ok(self.state.lock(&self.gate).vcpu(id)?.role)
    }

    /// Slots currently bound (exited but unreaped VCPUs included)
    pub fn bound_count(&self) -> usize {
        self.state.lock(&self.gate).bound
    }

    pub fn free_slots(&self) -> usize {
        self.config.max_vcpus - self.bound_count()
    }

    pub fn ready_count(&self) -> usize {
        self.state.lock(&self.gate).ready.len()
    }

    pub fn stats(&self) -> SchedStatsSnapshot {
        self.stats.snapshot()
    }

    fn assert_gate_open(&self, op: &str) {
        assert!(
            self.gate.depth() == 0,
            "{} with the interrupt gate closed (depth {})",
            op,
            self.gate.depth()
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
