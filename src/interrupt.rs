//! Interrupt gate and vector dispatch
//!
//! The gate is the interrupt mask of the (single) core and the only
//! synchronization primitive of the scheduling core: ready lists, dispatch
//! lists and VCPU contexts are touched only while it is closed.
//!
//! ## Mask discipline
//!
//! `disable()` returns an [`IrqToken`] holding the previous level and the
//! nesting depth. `restore()` must receive tokens most-recent-first; a token
//! restored out of order is a programming error and panics.
//!
//! ## Vectors
//!
//! Each vector has a short list of handlers sorted by priority. A vector
//! raised while the gate is closed is latched and delivered as soon as the
//! mask drops back to the enabled level.

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use spin::{Mutex, MutexGuard};

use crate::error::{KResult, KernelError};

// ============================================================================
// Constants
// ============================================================================

/// Mask level with every interrupt enabled
pub const IRQ_LEVEL_ENABLED: u8 = 0;

/// Mask level with every maskable interrupt blocked
pub const IRQ_LEVEL_DISABLED: u8 = 7;

/// Number of interrupt vectors
pub const IRQ_VECTOR_COUNT: usize = 32;

/// Maximum handlers installed on one vector
pub const MAX_HANDLERS_PER_VECTOR: usize = 8;

/// Vector driven by the scheduler clock
pub const IRQ_VECTOR_TIMER: u8 = 6;

// ============================================================================
// Mask Token
// ============================================================================

/// Opaque prior-state token returned by [`IrqGate::disable`]
///
/// Not `Clone`: every token is restored exactly once.
#[must_use = "a disabled gate must be restored with this token"]
#[derive(Debug, PartialEq, Eq)]
pub struct IrqToken {
    level: u8,
    depth: u32,
}

impl IrqToken {
    /// Whether restoring this token re-opens the gate
    pub fn was_enabled(&self) -> bool {
        self.level == IRQ_LEVEL_ENABLED
    }
}

// ============================================================================
// Handlers
// ============================================================================

/// Handle for an installed interrupt handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerId(pub u32);

/// What a handler does when its vector fires
pub enum HandlerKind {
    /// Run a closure
    Direct(Box<dyn FnMut() + Send>),
    /// Bump a shared counter that a waiter polls
    Counter(Arc<AtomicU32>),
}

struct InterruptHandler {
    id: HandlerId,
    priority: i8,
    enabled: bool,
    kind: HandlerKind,
}

impl InterruptHandler {
    fn invoke(&mut self) {
        match &mut self.kind {
            HandlerKind::Direct(func) => func(),
            HandlerKind::Counter(count) => {
                count.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

type HandlerList = heapless::Vec<InterruptHandler, MAX_HANDLERS_PER_VECTOR>;

// ============================================================================
// Statistics
// ============================================================================

/// Interrupt counters
pub struct IrqStats {
    /// Deliveries per vector
    pub per_vector: [AtomicU64; IRQ_VECTOR_COUNT],
    /// Vectors raised with no enabled handler, or out of range
    pub spurious: AtomicU64,
    /// Vectors latched while the gate was closed
    pub deferred: AtomicU64,
}

impl IrqStats {
    const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            per_vector: [ZERO; IRQ_VECTOR_COUNT],
            spurious: AtomicU64::new(0),
            deferred: AtomicU64::new(0),
        }
    }

    pub fn snapshot(&self) -> IrqStatsSnapshot {
        let mut per_vector = [0u64; IRQ_VECTOR_COUNT];
        for (slot, count) in per_vector.iter_mut().zip(self.per_vector.iter()) {
            *slot = count.load(Ordering::Relaxed);
        }
        IrqStatsSnapshot {
            per_vector,
            spurious: self.spurious.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of interrupt counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IrqStatsSnapshot {
    pub per_vector: [u64; IRQ_VECTOR_COUNT],
    pub spurious: u64,
    pub deferred: u64,
}

// ============================================================================
// Gate
// ============================================================================

/// Interrupt mask plus the vector table it protects
pub struct IrqGate {
    /// Current mask level
    level: AtomicU8,
    /// Number of outstanding `disable` tokens
    depth: AtomicU32,
    /// Vectors raised while masked
    pending: AtomicU32,
    /// Installed handlers per vector
    handlers: Mutex<[HandlerList; IRQ_VECTOR_COUNT]>,
    next_handler: AtomicU32,
    stats: IrqStats,
}

impl IrqGate {
    /// Create a gate in the disabled state, as the core comes out of reset
    pub fn new() -> Self {
        Self {
            level: AtomicU8::new(IRQ_LEVEL_DISABLED),
            depth: AtomicU32::new(0),
            pending: AtomicU32::new(0),
            handlers: Mutex::new(core::array::from_fn(|_| HandlerList::new())),
            next_handler: AtomicU32::new(1),
            stats: IrqStats::new(),
        }
    }

    /// Current mask level
    pub fn level(&self) -> u8 {
        self.level.load(Ordering::SeqCst)
    }

    /// Whether interrupts are currently delivered
    pub fn is_enabled(&self) -> bool {
        self.level() == IRQ_LEVEL_ENABLED
    }

    /// Outstanding disable depth
    pub fn depth(&self) -> u32 {
        self.depth.load(Ordering::SeqCst)
    }

    /// Drop the mask to the enabled level and deliver anything latched
    pub fn enable(&self) {
        self.level.store(IRQ_LEVEL_ENABLED, Ordering::SeqCst);
        self.deliver_pending();
    }

    /// Raise the mask to fully disabled, returning the previous state
    pub fn disable(&self) -> IrqToken {
        let level = self.level.swap(IRQ_LEVEL_DISABLED, Ordering::SeqCst);
        let depth = self.depth.fetch_add(1, Ordering::SeqCst);
        IrqToken { level, depth }
    }

    /// Put the mask back to exactly the state held by `token`
    ///
    /// # Panics
    ///
    /// If `token` is not the most recently issued outstanding token.
    pub fn restore(&self, token: IrqToken) {
        self.restore_level(token);
        if self.is_enabled() {
            self.deliver_pending();
        }
    }

    fn restore_level(&self, token: IrqToken) {
        let depth = self.depth.load(Ordering::SeqCst);
        assert!(
            depth == token.depth + 1,
            "irq gate restored out of order (token depth {}, current depth {})",
            token.depth,
            depth
        );
        self.level.store(token.level, Ordering::SeqCst);
        self.depth.store(token.depth, Ordering::SeqCst);
    }

    /// Close the gate for the lifetime of the returned guard
    pub fn guard(&self) -> IrqGuard<'_> {
        IrqGuard {
            gate: self,
            token: Some(self.disable()),
        }
    }

    /// Run `f` with the gate closed
    pub fn without_interrupts<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.guard();
        f()
    }

    // ------------------------------------------------------------------------
    // Vector table
    // ------------------------------------------------------------------------

    /// Install a handler on `vector`. The handler starts out disabled.
    pub fn install_handler(&self, vector: u8, priority: i8, kind: HandlerKind) -> KResult<HandlerId> {
        let vector = Self::check_vector(vector)?;
        let id = HandlerId(self.next_handler.fetch_add(1, Ordering::Relaxed));
        let handler = InterruptHandler {
            id,
            priority,
            enabled: false,
            kind,
        };

        let _guard = self.guard();
        let mut table = self.handlers.lock();
        let list = &mut table[vector];
        // Higher priority first, ties in installation order
        let pos = list
            .iter()
            .position(|h| h.priority < priority)
            .unwrap_or(list.len());
        list.insert(pos, handler)
            .map_err(|_| KernelError::ResourceExhausted)?;
        log::debug!("irq: installed handler {} on vector {} (pri {})", id.0, vector, priority);
        Ok(id)
    }

    /// Remove a previously installed handler
    pub fn remove_handler(&self, id: HandlerId) -> KResult<()> {
        let _guard = self.guard();
        let mut table = self.handlers.lock();
        for list in table.iter_mut() {
            if let Some(pos) = list.iter().position(|h| h.id == id) {
                list.remove(pos);
                return Ok(());
            }
        }
        Err(KernelError::NotFound)
    }

    /// Enable or disable delivery to one handler
    pub fn set_handler_enabled(&self, id: HandlerId, enabled: bool) -> KResult<()> {
        let _guard = self.guard();
        let mut table = self.handlers.lock();
        table
            .iter_mut()
            .flat_map(|list| list.iter_mut())
            .find(|h| h.id == id)
            .map(|h| h.enabled = enabled)
            .ok_or(KernelError::NotFound)
    }

    /// Signal `vector` from the platform
    ///
    /// Handlers run with the gate closed and must not block or touch the
    /// handler table.
    pub fn raise(&self, vector: u8) {
        let Ok(index) = Self::check_vector(vector) else {
            self.stats.spurious.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if !self.is_enabled() {
            self.pending.fetch_or(1 << index, Ordering::SeqCst);
            self.stats.deferred.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let token = self.disable();
        self.run_handlers(index);
        self.restore(token);
    }

    /// Vectors currently latched
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> IrqStatsSnapshot {
        self.stats.snapshot()
    }

    fn deliver_pending(&self) {
        loop {
            let pending = self.pending.load(Ordering::SeqCst);
            if pending == 0 {
                break;
            }
            let index = pending.trailing_zeros() as usize;
            self.pending.fetch_and(!(1 << index), Ordering::SeqCst);

            let token = self.disable();
            self.run_handlers(index);
            self.restore_level(token);
        }
    }

    fn run_handlers(&self, index: usize) {
        let mut table = self.handlers.lock();
        let mut delivered = false;
        for handler in table[index].iter_mut().filter(|h| h.enabled) {
            handler.invoke();
            delivered = true;
        }
        if delivered {
            self.stats.per_vector[index].fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.spurious.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn check_vector(vector: u8) -> KResult<usize> {
        let index = vector as usize;
        if index < IRQ_VECTOR_COUNT {
            Ok(index)
        } else {
            Err(KernelError::InvalidArgument)
        }
    }
}

// ============================================================================
// Scoped Acquisition
// ============================================================================

/// Closes the gate on creation and restores it on drop
///
/// Guards must be dropped in reverse order of creation.
pub struct IrqGuard<'a> {
    gate: &'a IrqGate,
    token: Option<IrqToken>,
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.gate.restore(token);
        }
    }
}

/// Data reachable only while the gate is closed
///
/// The inner spin mutex never contends on one core; it hands out the
/// exclusive borrow and catches re-entrant access.
pub struct IrqLock<T> {
    inner: Mutex<T>,
}

impl<T> IrqLock<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }

    /// Close `gate` and borrow the contents
    ///
    /// # Panics
    ///
    /// If the lock is already held, which on one core means re-entry.
    pub fn lock<'a>(&'a self, gate: &'a IrqGate) -> IrqLockGuard<'a, T> {
        let irq = gate.guard();
        let data = self
            .inner
            .try_lock()
            .unwrap_or_else(|| panic!("re-entrant access to gate-protected state"));
        IrqLockGuard { data, _irq: irq }
    }
}

/// Borrow of an [`IrqLock`]; the data is released before the gate re-opens
pub struct IrqLockGuard<'a, T> {
    data: MutexGuard<'a, T>,
    _irq: IrqGuard<'a>,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use proptest::prelude::*;

    fn open_gate() -> IrqGate {
        let gate = IrqGate::new();
        gate.enable();
        gate
    }

    #[test]
    fn test_gate_starts_disabled() {
        let gate = IrqGate::new();
        assert!(!gate.is_enabled());
        gate.enable();
        assert!(gate.is_enabled());
    }

    #[test]
    fn test_nested_disable_keeps_gate_closed() {
        let gate = open_gate();
        let outer = gate.disable();
        let inner = gate.disable();
        assert!(!inner.was_enabled());
        gate.restore(inner);
        assert!(!gate.is_enabled());
        gate.restore(outer);
        assert!(gate.is_enabled());
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    #[should_panic(expected = "out of order")]
    fn test_restore_out_of_order_panics() {
        let gate = open_gate();
        let outer = gate.disable();
        let _inner = gate.disable();
        gate.restore(outer);
    }

    #[test]
    fn test_guard_restores_on_drop() {
        let gate = open_gate();
        {
            let _a = gate.guard();
            let _b = gate.guard();
            assert_eq!(gate.depth(), 2);
        }
        assert!(gate.is_enabled());
        assert_eq!(gate.depth(), 0);
    }

    #[test]
    fn test_handlers_start_disabled() {
        let gate = open_gate();
        let hits = Arc::new(AtomicU32::new(0));
        let id = gate
            .install_handler(3, 0, HandlerKind::Counter(hits.clone()))
            .unwrap();

        gate.raise(3);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(gate.stats().spurious, 1);

        gate.set_handler_enabled(id, true).unwrap();
        gate.raise(3);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(gate.stats().per_vector[3], 1);
    }

    #[test]
    fn test_handlers_run_in_priority_order_with_gate_closed() {
        let gate = Arc::new(open_gate());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (tag, pri) in [(1u32, -5i8), (2, 10), (3, 10), (4, 0)] {
            let order = order.clone();
            let seen_gate = gate.clone();
            let id = gate
                .install_handler(
                    5,
                    pri,
                    HandlerKind::Direct(Box::new(move || {
                        assert!(!seen_gate.is_enabled());
                        order.lock().push(tag);
                    })),
                )
                .unwrap();
            gate.set_handler_enabled(id, true).unwrap();
        }

        gate.raise(5);
        assert_eq!(*order.lock(), [2, 3, 4, 1]);
        assert!(gate.is_enabled());
    }

    #[test]
    fn test_masked_vector_is_deferred_until_enable() {
        let gate = open_gate();
        let hits = Arc::new(AtomicU32::new(0));
        let id = gate
            .install_handler(IRQ_VECTOR_TIMER, 0, HandlerKind::Counter(hits.clone()))
            .unwrap();
        gate.set_handler_enabled(id, true).unwrap();

        let token = gate.disable();
        gate.raise(IRQ_VECTOR_TIMER);
        gate.raise(IRQ_VECTOR_TIMER);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(gate.pending(), 1 << IRQ_VECTOR_TIMER);

        // Latched vectors coalesce into one delivery
        gate.restore(token);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(gate.pending(), 0);
        assert_eq!(gate.stats().deferred, 2);
    }

    #[test]
    fn test_out_of_range_vector() {
        let gate = open_gate();
        assert!(gate
            .install_handler(IRQ_VECTOR_COUNT as u8, 0, HandlerKind::Counter(Arc::default()))
            .is_err());
        gate.raise(200);
        assert_eq!(gate.stats().spurious, 1);
    }

    #[test]
    fn test_remove_handler() {
        let gate = open_gate();
        let id = gate
            .install_handler(1, 0, HandlerKind::Counter(Arc::default()))
            .unwrap();
        assert!(gate.remove_handler(id).is_ok());
        assert_eq!(gate.remove_handler(id), Err(KernelError::NotFound));
        assert_eq!(gate.set_handler_enabled(id, true), Err(KernelError::NotFound));
    }

    #[test]
    fn test_vector_list_capacity() {
        let gate = open_gate();
        for _ in 0..MAX_HANDLERS_PER_VECTOR {
            gate.install_handler(2, 0, HandlerKind::Counter(Arc::default()))
                .unwrap();
        }
        assert_eq!(
            gate.install_handler(2, 0, HandlerKind::Counter(Arc::default())),
            Err(KernelError::ResourceExhausted)
        );
    }

    #[test]
    #[should_panic(expected = "re-entrant")]
    fn test_irq_lock_reentry_panics() {
        let gate = open_gate();
        let lock = IrqLock::new(0u32);
        let _first = lock.lock(&gate);
        let _second = lock.lock(&gate);
    }

    #[test]
    fn test_irq_lock_closes_gate() {
        let gate = open_gate();
        let lock = IrqLock::new(5u32);
        {
            let mut value = lock.lock(&gate);
            assert!(!gate.is_enabled());
            *value += 1;
        }
        assert!(gate.is_enabled());
        assert_eq!(*lock.lock(&gate), 6);
    }

    proptest! {
        /// Any lexically nested disable/restore sequence leaves the mask
        /// where it started, and every restore returns the level seen
        /// before its matching disable.
        #[test]
        fn prop_nesting_restores_prior_state(start_enabled in any::<bool>(), ops in proptest::collection::vec(any::<bool>(), 0..64)) {
            let gate = IrqGate::new();
            if start_enabled {
                gate.enable();
            }
            let initial = gate.level();

            let mut stack: Vec<(IrqToken, u8)> = Vec::new();
            for push in ops {
                if push || stack.is_empty() {
                    let before = gate.level();
                    stack.push((gate.disable(), before));
                    prop_assert!(!gate.is_enabled());
                } else if let Some((token, before)) = stack.pop() {
                    gate.restore(token);
                    prop_assert_eq!(gate.level(), before);
                }
            }
            while let Some((token, before)) = stack.pop() {
                gate.restore(token);
                prop_assert_eq!(gate.level(), before);
            }
            prop_assert_eq!(gate.level(), initial);
            prop_assert_eq!(gate.depth(), 0);
        }
    }
}
