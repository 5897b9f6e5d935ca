//! Dispatch queues
//!
//! A dispatch queue holds deferred closures and runs them on worker VCPUs
//! acquired from the scheduler. Each worker drains one *lane*; a serial
//! queue has exactly one lane, so at most one of its closures is ever in
//! flight and closures run in submission order. A concurrent queue grows
//! extra lanes under load; claims are still FIFO but completion order is
//! not.
//!
//! Immediate items wait in a FIFO, timed items in a list sorted by
//! deadline. A due timer is claimed before any immediate item.
//!
//! A worker with nothing to do parks. Once it has been parked for longer
//! than the configured idle limit and the queue has more lanes than its
//! `min_concurrency`, the lane is released and its VCPU slot returns to
//! the scheduler.
//!
//! Pending lists are only touched with the interrupt gate closed; closures
//! and fault handlers always run with it open.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use log::{debug, error, trace, warn};

use crate::config::DispatchConfig;
use crate::error::{KResult, KernelError};
use crate::interrupt::IrqLock;
use crate::kern::runq::Priority;
use crate::kern::sched_prim::WaitResult;
use crate::kern::vcpu::{AcquireParams, VcpuRole};
use crate::scheduler::Scheduler;
use crate::types::{ProcessId, QueueId, Tick, VcpuId, WorkId};

// ============================================================================
// Work
// ============================================================================

/// Unrecoverable condition raised by a closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fault {
    pub code: i32,
    pub reason: &'static str,
}

impl Fault {
    pub const fn new(code: i32, reason: &'static str) -> Self {
        Self { code, reason }
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.reason, self.code)
    }
}

impl From<Fault> for KernelError {
    fn from(fault: Fault) -> Self {
        KernelError::Fault(fault.code)
    }
}

/// Outcome of one closure; the queue observes nothing but faults
pub type WorkResult = Result<(), Fault>;

/// Owned unit of deferred work
pub enum Closure {
    /// Runs once and is released
    Once(Box<dyn FnOnce() -> WorkResult + Send>),
    /// Runs on every firing of a periodic timer
    Repeating(Box<dyn FnMut() -> WorkResult + Send>),
}

impl Closure {
    /// Fallible one-shot closure
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce() -> WorkResult + Send + 'static,
    {
        Closure::Once(Box::new(f))
    }

    /// One-shot closure that cannot fault
    pub fn from_fn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Closure::Once(Box::new(move || {
            f();
            Ok(())
        }))
    }

    /// Closure for periodic timers
    pub fn repeating<F>(f: F) -> Self
    where
        F: FnMut() -> WorkResult + Send + 'static,
    {
        Closure::Repeating(Box::new(f))
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Closure::Once(_) => f.write_str("Closure::Once"),
            Closure::Repeating(_) => f.write_str("Closure::Repeating"),
        }
    }
}

bitflags! {
    /// Submission options
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SubmitFlags: u32 {
        /// Skip the submission if an item with the same tag is pending or running
        const COALESCE = 1 << 0;
    }
}

const COMPLETION_PENDING: u8 = 0;
const COMPLETION_DONE: u8 = 1;
const COMPLETION_INTERRUPTED: u8 = 2;

/// Completion cell of a `sync` submission
#[derive(Debug, Default)]
struct Completion(AtomicU8);

impl Completion {
    fn set(&self, state: u8) {
        let _ = self.0.compare_exchange(
            COMPLETION_PENDING,
            state,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn get(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

struct WorkItem {
    id: WorkId,
    tag: Option<u32>,
    closure: Closure,
    deadline: Option<Tick>,
    interval: Option<u64>,
    completion: Option<Arc<Completion>>,
}

impl WorkItem {
    /// Drop without running; wakes a `sync` caller with `Interrupted`
    fn discard(self) {
        if let Some(completion) = &self.completion {
            completion.set(COMPLETION_INTERRUPTED);
        }
    }
}

// ============================================================================
// Attributes and Reports
// ============================================================================

/// Creation parameters of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttrs {
    /// Lanes kept once work has arrived
    pub min_concurrency: usize,
    /// Upper bound on closures in flight; 1 makes the queue serial
    pub max_concurrency: usize,
    /// Band of the worker VCPUs
    pub priority: usize,
    /// Maximum pending items; `None` defers to the configured default
    pub capacity: Option<usize>,
}

impl QueueAttrs {
    pub fn serial() -> Self {
        Self {
            min_concurrency: 0,
            max_concurrency: 1,
            priority: Priority::NORMAL.value() as usize,
            capacity: None,
        }
    }

    pub fn concurrent(max_concurrency: usize) -> Self {
        Self {
            max_concurrency,
            ..Self::serial()
        }
    }

    pub fn with_priority(mut self, priority: usize) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_min_concurrency(mut self, min_concurrency: usize) -> Self {
        self.min_concurrency = min_concurrency;
        self
    }

    pub fn is_serial(&self) -> bool {
        self.max_concurrency == 1
    }
}

/// Details handed to a fault handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    pub queue: QueueId,
    pub owner: ProcessId,
    pub work: WorkId,
    pub tag: Option<u32>,
    pub fault: Fault,
}

/// Fault handler verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultAction {
    /// Keep draining
    Continue,
    /// Terminate the queue
    Terminate,
}

pub type FaultHandler = Box<dyn FnMut(&FaultReport) -> FaultAction + Send>;

/// Result of one lane step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// A closure ran to completion
    Ran(WorkId),
    /// A closure faulted and the handler decided
    Faulted { work: WorkId, fault: Fault, action: FaultAction },
    /// A closure faulted with no handler installed; the queue has been
    /// terminated and its owner should be terminated too
    OwnerFault { work: WorkId, fault: Fault },
    /// Nothing runnable on this lane
    Idle,
    /// The queue no longer runs work; an idle lane has been released
    Terminated,
}

/// Lifecycle of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Running,
    /// No longer accepts work; some lanes still hold a worker
    Terminating,
    /// Every worker has been released
    Terminated,
}

// ============================================================================
// Statistics
// ============================================================================

/// Dispatch queue statistics
pub struct DispatchStats {
    pub submitted: AtomicU64,
    pub executed: AtomicU64,
    /// Dropped unexecuted by cancel, flush or termination
    pub discarded: AtomicU64,
    pub faulted: AtomicU64,
    /// Submissions folded into an existing item
    pub coalesced: AtomicU64,
}

impl DispatchStats {
    const fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            faulted: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            faulted: self.faulted.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of dispatch queue statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub submitted: u64,
    pub executed: u64,
    pub discarded: u64,
    pub faulted: u64,
    pub coalesced: u64,
}

// ============================================================================
// Queue State
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ActiveItem {
    id: WorkId,
    tag: Option<u32>,
}

#[derive(Debug)]
struct Lane {
    vcpu: VcpuId,
    active: Option<ActiveItem>,
    /// Worker is waiting for work
    parked: bool,
    /// Clock value when the worker last parked
    parked_at: Tick,
}

struct Inner {
    state: QueueState,
    items: VecDeque<WorkItem>,
    /// Sorted by deadline, earliest first
    timers: Vec<WorkItem>,
    lanes: Vec<Lane>,
    next_work: u64,
    fault_handler: Option<FaultHandler>,
}

impl Inner {
    fn pending(&self) -> usize {
        self.items.len() + self.timers.len()
    }

    fn in_flight(&self) -> usize {
        self.lanes.iter().filter(|l| l.active.is_some()).count()
    }

    fn find_tagged(&self, tag: u32) -> Option<WorkId> {
        self.items
            .iter()
            .chain(self.timers.iter())
            .find(|w| w.tag == Some(tag))
            .map(|w| w.id)
            .or_else(|| {
                self.lanes
                    .iter()
                    .filter_map(|l| l.active)
                    .find(|a| a.tag == Some(tag))
                    .map(|a| a.id)
            })
    }

    fn insert_timer(&mut self, item: WorkItem) {
        let deadline = item.deadline.unwrap_or(Tick::ZERO);
        let pos = self
            .timers
            .partition_point(|t| t.deadline.unwrap_or(Tick::ZERO) <= deadline);
        self.timers.insert(pos, item);
    }

    /// Next item for a lane: a due timer first, then the FIFO head
    fn claim(&mut self, now: Tick) -> Option<WorkItem> {
        let timer_due = self
            .timers
            .first()
            .is_some_and(|t| t.deadline.is_some_and(|d| d <= now));
        if timer_due {
            Some(self.timers.remove(0))
        } else {
            self.items.pop_front()
        }
    }

    fn has_runnable(&self, now: Tick) -> bool {
        !self.items.is_empty()
            || self
                .timers
                .first()
                .is_some_and(|t| t.deadline.is_some_and(|d| d <= now))
    }

    /// Discard everything pending, returning the count
    fn flush(&mut self) -> usize {
        let count = self.pending();
        for item in self.items.drain(..) {
            item.discard();
        }
        for item in self.timers.drain(..) {
            item.discard();
        }
        count
    }

    /// Unpark one lane, returning its worker
    fn unpark_one(&mut self) -> Option<VcpuId> {
        self.lanes.iter_mut().find(|l| l.parked).map(|lane| {
            lane.parked = false;
            lane.vcpu
        })
    }

    fn unpark_all(&mut self) -> Vec<VcpuId> {
        self.lanes
            .iter_mut()
            .filter(|l| l.parked)
            .map(|lane| {
                lane.parked = false;
                lane.vcpu
            })
            .collect()
    }

    /// Drop lane `pos`; a stopping queue is terminated with its last lane
    fn remove_lane(&mut self, pos: usize) -> VcpuId {
        let lane = self.lanes.remove(pos);
        if self.state == QueueState::Terminating && self.lanes.is_empty() {
            self.state = QueueState::Terminated;
        }
        lane.vcpu
    }

    /// Release lanes parked for at least `limit` ticks, keeping `keep` lanes
    fn retire_idle(&mut self, now: Tick, limit: u64, keep: usize) -> Vec<VcpuId> {
        let mut retired = Vec::new();
        while self.lanes.len() > keep {
            let idle = self
                .lanes
                .iter()
                .rposition(|l| l.parked && now.0.saturating_sub(l.parked_at.0) >= limit);
            match idle {
                Some(pos) => retired.push(self.remove_lane(pos)),
                None => break,
            }
        }
        retired
    }
}

// ============================================================================
// Dispatch Queue
// ============================================================================

/// Ordered holder of deferred closures
pub struct DispatchQueue {
    id: QueueId,
    owner: ProcessId,
    attrs: QueueAttrs,
    priority: Priority,
    capacity: Option<usize>,
    spawn_threshold: usize,
    lane_idle_ticks: u64,
    sched: Arc<Scheduler>,
    inner: IrqLock<Inner>,
    stats: DispatchStats,
}

impl DispatchQueue {
    /// Create a queue; workers are acquired lazily as work arrives
    pub fn new(
        id: QueueId,
        owner: ProcessId,
        attrs: QueueAttrs,
        sched: Arc<Scheduler>,
        config: &DispatchConfig,
    ) -> KResult<Self> {
        let priority = Priority::user(attrs.priority)?;
        if attrs.max_concurrency == 0
            || attrs.max_concurrency > config.max_concurrency_limit
            || attrs.min_concurrency > attrs.max_concurrency
            || attrs.capacity == Some(0)
        {
            return Err(KernelError::InvalidArgument);
        }

        debug!(
            "dispatch: created {} for {:?} ({}..={} lanes, pri {})",
            id,
            owner,
            attrs.min_concurrency,
            attrs.max_concurrency,
            priority.value()
        );
        Ok(Self {
            id,
            owner,
            attrs,
            priority,
            capacity: attrs.capacity.or(config.default_capacity),
            spawn_threshold: config.spawn_threshold,
            lane_idle_ticks: config.lane_idle_ticks,
            sched,
            inner: IrqLock::new(Inner {
                state: QueueState::Running,
                items: VecDeque::new(),
                timers: Vec::new(),
                lanes: Vec::new(),
                next_work: 1,
                fault_handler: None,
            }),
            stats: DispatchStats::new(),
        })
    }

    pub fn id(&self) -> QueueId {
        self.id
    }

    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn attrs(&self) -> &QueueAttrs {
        &self.attrs
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Append a closure
    pub fn submit(&self, closure: Closure) -> KResult<WorkId> {
        self.enqueue(closure, None, SubmitFlags::empty(), None, None, None)
    }

    /// Append a tagged closure
    pub fn submit_tagged(&self, tag: u32, flags: SubmitFlags, closure: Closure) -> KResult<WorkId> {
        self.enqueue(closure, Some(tag), flags, None, None, None)
    }

    /// Run `closure` once the scheduler clock reaches `deadline`
    pub fn submit_after(&self, deadline: Tick, tag: Option<u32>, closure: Closure) -> KResult<WorkId> {
        self.enqueue(closure, tag, SubmitFlags::empty(), Some(deadline), None, None)
    }

    /// Run `closure` at `deadline` and then every `interval` ticks
    pub fn submit_periodic(
        &self,
        deadline: Tick,
        interval: u64,
        tag: Option<u32>,
        closure: Closure,
    ) -> KResult<WorkId> {
        if interval == 0 || !matches!(closure, Closure::Repeating(_)) {
            return Err(KernelError::InvalidArgument);
        }
        self.enqueue(closure, tag, SubmitFlags::empty(), Some(deadline), Some(interval), None)
    }

    fn enqueue(
        &self,
        closure: Closure,
        tag: Option<u32>,
        flags: SubmitFlags,
        deadline: Option<Tick>,
        interval: Option<u64>,
        completion: Option<Arc<Completion>>,
    ) -> KResult<WorkId> {
        let now = self.sched.now();
        let (id, grow, wake) = {
            let mut inner = self.inner.lock(self.sched.gate());
            if inner.state != QueueState::Running {
                return Err(KernelError::InvalidQueue);
            }
            if flags.contains(SubmitFlags::COALESCE) {
                if let Some(existing) = tag.and_then(|t| inner.find_tagged(t)) {
                    self.stats.coalesced.fetch_add(1, Ordering::Relaxed);
                    return Ok(existing);
                }
            }
            if self.capacity.is_some_and(|cap| inner.pending() >= cap) {
                return Err(KernelError::QueueFull);
            }

            let id = WorkId(inner.next_work);
            inner.next_work += 1;
            let item = WorkItem {
                id,
                tag,
                closure,
                deadline,
                interval,
                completion,
            };
            if deadline.is_some() {
                inner.insert_timer(item);
            } else {
                inner.items.push_back(item);
            }

            let lanes = inner.lanes.len();
            let grow = lanes == 0
                || lanes < self.attrs.min_concurrency
                || (inner.pending() > self.spawn_threshold && lanes < self.attrs.max_concurrency);
            let wake = if inner.has_runnable(now) {
                inner.unpark_one()
            } else {
                None
            };
            (id, grow, wake)
        };
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        trace!("dispatch: {} queued work {}", self.id, id.0);

        if grow {
            if let Err(err) = self.add_lane() {
                let mut inner = self.inner.lock(self.sched.gate());
                if inner.lanes.is_empty() {
                    if let Some(pos) = inner.items.iter().position(|w| w.id == id) {
                        inner.items.remove(pos);
                    } else if let Some(pos) = inner.timers.iter().position(|w| w.id == id) {
                        inner.timers.remove(pos);
                    }
                    self.stats.submitted.fetch_sub(1, Ordering::Relaxed);
                    return Err(err);
                }
                debug!("dispatch: {} could not grow: {}", self.id, err);
            }
        }
        if let Some(vcpu) = wake {
            let _ = self.sched.wakeup(vcpu, WaitResult::Normal);
        }
        Ok(id)
    }

    /// Acquire a worker VCPU for one more lane
    fn add_lane(&self) -> KResult<VcpuId> {
        let params = AcquireParams {
            priority: self.priority.value() as usize,
            stack_size: 0,
            entry: 0,
            arg: self.id.0 as usize,
            flags: Default::default(),
        };
        let vcpu = self
            .sched
            .acquire_as(&params, self.owner, VcpuRole::DispatchWorker { queue: self.id })?;

        let mut inner = self.inner.lock(self.sched.gate());
        if inner.state != QueueState::Running {
            drop(inner);
            let _ = self.sched.terminate(vcpu);
            return Err(KernelError::InvalidQueue);
        }
        inner.lanes.push(Lane {
            vcpu,
            active: None,
            parked: false,
            parked_at: Tick::ZERO,
        });
        debug!("dispatch: {} lane {} on {}", self.id, inner.lanes.len() - 1, vcpu);
        Ok(vcpu)
    }

    // ------------------------------------------------------------------------
    // Removal
    // ------------------------------------------------------------------------

    /// Remove a pending item
    ///
    /// Fails with `NotFound` if the item already started or does not exist.
    pub fn cancel(&self, work: WorkId) -> KResult<()> {
        let mut inner = self.inner.lock(self.sched.gate());
        let item = if let Some(pos) = inner.items.iter().position(|w| w.id == work) {
            inner.items.remove(pos)
        } else if let Some(pos) = inner.timers.iter().position(|w| w.id == work) {
            Some(inner.timers.remove(pos))
        } else {
            None
        };
        let item = item.ok_or(KernelError::NotFound)?;
        item.discard();
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Remove every pending item carrying `tag`; a running one is left alone
    pub fn remove_by_tag(&self, tag: u32) -> usize {
        let mut inner = self.inner.lock(self.sched.gate());
        let mut removed = 0;
        let mut kept = VecDeque::with_capacity(inner.items.len());
        for item in inner.items.drain(..) {
            if item.tag == Some(tag) {
                item.discard();
                removed += 1;
            } else {
                kept.push_back(item);
            }
        }
        inner.items = kept;

        let mut kept_timers = Vec::with_capacity(inner.timers.len());
        for item in inner.timers.drain(..) {
            if item.tag == Some(tag) {
                item.discard();
                removed += 1;
            } else {
                kept_timers.push(item);
            }
        }
        inner.timers = kept_timers;
        self.stats.discarded.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Discard every pending item, immediate and timed
    pub fn flush(&self) -> usize {
        let count = self.inner.lock(self.sched.gate()).flush();
        self.stats.discarded.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Stop accepting work and discard what is pending
    ///
    /// Closures already in flight finish. Parked workers are woken so they
    /// can release their lanes; the queue reaches `Terminated` when the last
    /// lane is gone. Returns the discarded count.
    pub fn terminate(&self) -> usize {
        let (count, parked) = {
            let mut inner = self.inner.lock(self.sched.gate());
            if inner.state != QueueState::Running {
                return 0;
            }
            inner.state = if inner.lanes.is_empty() {
                QueueState::Terminated
            } else {
                QueueState::Terminating
            };
            (inner.flush(), inner.unpark_all())
        };
        for vcpu in parked {
            let _ = self.sched.wakeup(vcpu, WaitResult::Interrupted);
        }
        self.stats.discarded.fetch_add(count as u64, Ordering::Relaxed);
        if count > 0 {
            warn!("dispatch: {} terminated, {} pending closures discarded", self.id, count);
        } else {
            debug!("dispatch: {} terminated", self.id);
        }
        count
    }

    /// Terminate and release every worker VCPU
    ///
    /// Pending closures are discarded, never run; the count is returned.
    /// A lane that is in the middle of a closure is released once that
    /// closure returns.
    pub fn destroy(&self) -> usize {
        let discarded = self.terminate();
        let idle: Vec<VcpuId> = {
            let mut inner = self.inner.lock(self.sched.gate());
            let mut idle = Vec::new();
            while let Some(pos) = inner.lanes.iter().position(|l| l.active.is_none()) {
                idle.push(inner.remove_lane(pos));
            }
            idle
        };
        for vcpu in idle {
            let _ = self.sched.terminate(vcpu);
        }
        discarded
    }

    /// Install the handler that decides what happens after a fault
    pub fn set_fault_handler(&self, handler: FaultHandler) {
        self.inner.lock(self.sched.gate()).fault_handler = Some(handler);
    }

    // ------------------------------------------------------------------------
    // Draining
    // ------------------------------------------------------------------------

    /// Claim and run one closure on `lane`
    ///
    /// Fails with `Busy` if the lane already has a closure in flight.
    pub fn run_lane(&self, lane: usize) -> KResult<DrainStatus> {
        let now = self.sched.now();
        let item = {
            let mut inner = self.inner.lock(self.sched.gate());
            if inner.state != QueueState::Running {
                let idle = inner.lanes.get(lane).is_some_and(|l| l.active.is_none());
                let retired = idle.then(|| inner.remove_lane(lane));
                drop(inner);
                if let Some(vcpu) = retired {
                    let _ = self.sched.terminate(vcpu);
                }
                return Ok(DrainStatus::Terminated);
            }
            match inner.lanes.get(lane) {
                None => return Err(KernelError::InvalidArgument),
                Some(l) if l.active.is_some() => return Err(KernelError::Busy),
                Some(_) => {}
            }
            let Some(item) = inner.claim(now) else {
                return Ok(DrainStatus::Idle);
            };
            inner.lanes[lane].active = Some(ActiveItem {
                id: item.id,
                tag: item.tag,
            });
            item
        };

        let WorkItem {
            id: work,
            tag,
            closure,
            deadline,
            interval,
            completion,
        } = item;
        let (result, again) = match closure {
            Closure::Once(f) => (f(), None),
            Closure::Repeating(mut f) => {
                let result = f();
                (result, Some(Closure::Repeating(f)))
            }
        };
        self.stats.executed.fetch_add(1, Ordering::Relaxed);

        let retired = {
            let mut inner = self.inner.lock(self.sched.gate());
            let running = inner.state == QueueState::Running;
            let mut retired = None;
            match inner.lanes.iter().position(|l| l.active.is_some_and(|a| a.id == work)) {
                Some(pos) if running => inner.lanes[pos].active = None,
                Some(pos) => retired = Some(inner.remove_lane(pos)),
                None => {}
            }
            if let Some(completion) = &completion {
                completion.set(COMPLETION_DONE);
            }
            // A periodic item that faulted is not re-armed
            if let (Some(closure), Some(interval), Some(deadline)) = (again, interval, deadline) {
                if running && result.is_ok() {
                    let mut next = deadline.saturating_add(interval);
                    while next <= now {
                        next = next.saturating_add(interval);
                    }
                    inner.insert_timer(WorkItem {
                        id: work,
                        tag,
                        closure,
                        deadline: Some(next),
                        interval: Some(interval),
                        completion: None,
                    });
                }
            }
            retired
        };
        if let Some(vcpu) = retired {
            let _ = self.sched.terminate(vcpu);
        }

        match result {
            Ok(()) => Ok(DrainStatus::Ran(work)),
            Err(fault) => Ok(self.report_fault(work, tag, fault)),
        }
    }

    fn report_fault(&self, work: WorkId, tag: Option<u32>, fault: Fault) -> DrainStatus {
        self.stats.faulted.fetch_add(1, Ordering::Relaxed);
        // Taken out so the handler runs with the gate open
        let handler = self.inner.lock(self.sched.gate()).fault_handler.take();
        let report = FaultReport {
            queue: self.id,
            owner: self.owner,
            work,
            tag,
            fault,
        };

        match handler {
            Some(mut handler) => {
                let action = handler(&report);
                {
                    let mut inner = self.inner.lock(self.sched.gate());
                    if inner.fault_handler.is_none() {
                        inner.fault_handler = Some(handler);
                    }
                }
                warn!("dispatch: {} work {} faulted: {}, {:?}", self.id, work.0, fault, action);
                if action == FaultAction::Terminate {
                    self.terminate();
                }
                DrainStatus::Faulted {
                    work,
                    fault,
                    action,
                }
            }
            None => {
                error!(
                    "dispatch: {} work {} faulted with no handler: {}; owner {:?} goes down",
                    self.id, work.0, fault, self.owner
                );
                self.terminate();
                DrainStatus::OwnerFault { work, fault }
            }
        }
    }

    /// Run pending closures on the caller until the queue is empty
    ///
    /// Uses lane 0. Returns the number of closures run, or the first status
    /// that stopped the drain if it was a fault with no handler.
    pub fn drain(&self) -> KResult<usize> {
        let mut ran = 0;
        if self.inner.lock(self.sched.gate()).lanes.is_empty() {
            return Ok(0);
        }
        loop {
            match self.run_lane(0)? {
                DrainStatus::Ran(_) | DrainStatus::Faulted { action: FaultAction::Continue, .. } => {
                    ran += 1
                }
                DrainStatus::Faulted { .. } | DrainStatus::Idle | DrainStatus::Terminated => {
                    return Ok(ran)
                }
                DrainStatus::OwnerFault { fault, .. } => return Err(fault.into()),
            }
        }
    }

    /// Run `closure` after everything submitted before it
    ///
    /// Earlier items and the closure itself run on the caller. Fails with
    /// `Interrupted` if the queue is flushed or terminated first.
    ///
    /// Fails with `Busy`, without queueing anything, when lane 0 is in the
    /// middle of a closure, as it is when called from one of this queue's
    /// own closures.
    pub fn sync(&self, closure: Closure) -> KResult<()> {
        let busy = self
            .inner
            .lock(self.sched.gate())
            .lanes
            .first()
            .is_some_and(|l| l.active.is_some());
        if busy {
            return Err(KernelError::Busy);
        }

        let completion = Arc::new(Completion::default());
        let work = self.enqueue(
            closure,
            None,
            SubmitFlags::empty(),
            None,
            None,
            Some(completion.clone()),
        )?;

        loop {
            match completion.get() {
                COMPLETION_DONE => return Ok(()),
                COMPLETION_INTERRUPTED => return Err(KernelError::Interrupted),
                _ => {}
            }
            let status = match self.run_lane(0) {
                Ok(status) => status,
                Err(err) => {
                    let _ = self.cancel(work);
                    return Err(err);
                }
            };
            match status {
                DrainStatus::Idle | DrainStatus::Terminated => {
                    return match completion.get() {
                        COMPLETION_DONE => Ok(()),
                        _ => Err(KernelError::Interrupted),
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------------
    // Worker support
    // ------------------------------------------------------------------------

    /// Lane drained by `vcpu`
    pub fn lane_of(&self, vcpu: VcpuId) -> Option<usize> {
        self.inner
            .lock(self.sched.gate())
            .lanes
            .iter()
            .position(|l| l.vcpu == vcpu)
    }

    /// Record that a lane's worker went to sleep
    pub fn park(&self, lane: usize) {
        let now = self.sched.now();
        if let Some(l) = self.inner.lock(self.sched.gate()).lanes.get_mut(lane) {
            l.parked = true;
            l.parked_at = now;
        }
    }

    /// Timer pass over the queue
    ///
    /// Wakes a parked worker if a timer is due and releases lanes that have
    /// been parked past the idle limit. Returns the worker woken.
    pub fn poll_timers(&self, now: Tick) -> Option<VcpuId> {
        let (woken, retired) = {
            let mut inner = self.inner.lock(self.sched.gate());
            if inner.state != QueueState::Running {
                return None;
            }
            let woken = if inner.has_runnable(now) {
                inner.unpark_one()
            } else {
                None
            };
            // Armed timers need a lane to fire on
            let keep = self
                .attrs
                .min_concurrency
                .max(usize::from(!inner.timers.is_empty()));
            (woken, inner.retire_idle(now, self.lane_idle_ticks, keep))
        };
        for vcpu in retired {
            debug!("dispatch: {} released idle worker {}", self.id, vcpu);
            let _ = self.sched.terminate(vcpu);
        }
        if let Some(vcpu) = woken {
            let _ = self.sched.wakeup(vcpu, WaitResult::Normal);
        }
        woken
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Items waiting to run (immediate and timed)
    pub fn pending(&self) -> usize {
        self.inner.lock(self.sched.gate()).pending()
    }

    /// Closures currently executing
    pub fn in_flight(&self) -> usize {
        self.inner.lock(self.sched.gate()).in_flight()
    }

    /// Worker VCPUs, one per lane
    pub fn lanes(&self) -> Vec<VcpuId> {
        self.inner
            .lock(self.sched.gate())
            .lanes
            .iter()
            .map(|l| l.vcpu)
            .collect()
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock(self.sched.gate()).state
    }

    /// The queue stopped accepting work; workers may still be winding down
    pub fn is_terminated(&self) -> bool {
        self.state() != QueueState::Running
    }

    /// Every worker of a stopped queue has been released
    pub fn is_termination_completed(&self) -> bool {
        self.state() == QueueState::Terminated
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }
}

impl fmt::Debug for DispatchQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchQueue")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("attrs", &self.attrs)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================
