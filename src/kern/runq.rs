//! Ready Queue Management
//!
//! One FIFO per priority band plus a populated bitmap, so the highest ready
//! band is found with a single leading-zero count.
//!
//! ## Priority Bands
//!
//! 64 bands, 0-63, higher is more urgent:
//! - 62-63: reserved for the kernel
//! - 2-61: available to acquired VCPUs
//! - 0-1: reserved (the idle VCPU runs at 0)
//!
//! The queue itself holds no lock; the scheduler only touches it with the
//! interrupt gate closed.

use alloc::collections::VecDeque;

use crate::error::{KResult, KernelError};
use crate::types::VcpuId;

// ============================================================================
// Constants
// ============================================================================

/// Number of priority bands
pub const PRIORITY_COUNT: usize = 64;

/// Highest band
pub const PRIORITY_HIGHEST: u8 = 63;

/// Band for latency sensitive work
pub const PRIORITY_REALTIME: u8 = 56;

/// Default band for user VCPUs
pub const PRIORITY_NORMAL: u8 = 42;

/// Lowest band
pub const PRIORITY_LOWEST: u8 = 0;

/// Band of the idle VCPU
pub const PRIORITY_IDLE: u8 = PRIORITY_LOWEST;

/// Lowest band open to acquisition
pub const PRIORITY_USER_MIN: u8 = PRIORITY_LOWEST + 2;

/// Highest band open to acquisition
pub const PRIORITY_USER_MAX: u8 = PRIORITY_HIGHEST - 2;

// ============================================================================
// Priority
// ============================================================================

/// A scheduling band
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(u8);

impl Priority {
    pub const IDLE: Self = Priority(PRIORITY_IDLE);
    pub const NORMAL: Self = Priority(PRIORITY_NORMAL);
    pub const REALTIME: Self = Priority(PRIORITY_REALTIME);

    /// Any band, reserved ones included
    pub const fn new(value: u8) -> Option<Self> {
        if (value as usize) < PRIORITY_COUNT {
            Some(Priority(value))
        } else {
            None
        }
    }

    /// A band open to acquired VCPUs
    pub fn user(value: usize) -> KResult<Self> {
        if (PRIORITY_USER_MIN as usize..=PRIORITY_USER_MAX as usize).contains(&value) {
            Ok(Priority(value as u8))
        } else {
            Err(KernelError::InvalidArgument)
        }
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    /// Timeslice length in ticks; lower bands get longer slices
    pub const fn quantum(self) -> u32 {
        (((PRIORITY_HIGHEST - self.0) >> 3) + 1) as u32
    }
}

// ============================================================================
// Ready Queue
// ============================================================================

/// Multi-band ready queue with bitmap lookup
#[derive(Debug)]
pub struct ReadyQueue {
    /// FIFO per band, indexed by priority value
    bands: [VecDeque<VcpuId>; PRIORITY_COUNT],
    /// Bit `n` set when band `n` is non-empty
    populated: u64,
    /// Total entries
    count: usize,
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self {
            bands: core::array::from_fn(|_| VecDeque::new()),
            populated: 0,
            count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Append at the tail of the band
    pub fn push_back(&mut self, id: VcpuId, priority: Priority) {
        self.bands[priority.0 as usize].push_back(id);
        self.mark(priority);
    }

    /// Insert at the head of the band (preempted before its slice ran out)
    pub fn push_front(&mut self, id: VcpuId, priority: Priority) {
        self.bands[priority.0 as usize].push_front(id);
        self.mark(priority);
    }

    /// Highest populated band
    pub fn highest(&self) -> Option<Priority> {
        if self.populated == 0 {
            None
        } else {
            Some(Priority(63 - self.populated.leading_zeros() as u8))
        }
    }

    /// Head of the highest band without removing it
    pub fn peek(&self) -> Option<(VcpuId, Priority)> {
        let pri = self.highest()?;
        self.bands[pri.0 as usize].front().map(|id| (*id, pri))
    }

    /// Remove the head of the highest band
    pub fn pop(&mut self) -> Option<(VcpuId, Priority)> {
        let pri = self.highest()?;
        let id = self.bands[pri.0 as usize].pop_front()?;
        self.unmark_if_empty(pri);
        Some((id, pri))
    }

    /// Remove a specific VCPU from `priority`'s band
    pub fn remove(&mut self, id: VcpuId, priority: Priority) -> bool {
        let band = &mut self.bands[priority.0 as usize];
        match band.iter().position(|e| *e == id) {
            Some(pos) => {
                band.remove(pos);
                self.count -= 1;
                self.unmark_if_empty_no_count(priority);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: VcpuId) -> bool {
        self.bands.iter().any(|band| band.contains(&id))
    }

    /// Number of entries in one band
    pub fn band_len(&self, priority: Priority) -> usize {
        self.bands[priority.0 as usize].len()
    }

    fn mark(&mut self, priority: Priority) {
        self.populated |= 1u64 << priority.0;
        self.count += 1;
    }

    fn unmark_if_empty(&mut self, priority: Priority) {
        self.count -= 1;
        self.unmark_if_empty_no_count(priority);
    }

    fn unmark_if_empty_no_count(&mut self, priority: Priority) {
        if self.bands[priority.0 as usize].is_empty() {
            self.populated &= !(1u64 << priority.0);
        }
    }
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantum_by_band() {
        assert_eq!(Priority(PRIORITY_HIGHEST).quantum(), 1);
        assert_eq!(Priority::REALTIME.quantum(), 1);
        assert_eq!(Priority::NORMAL.quantum(), 3);
        assert_eq!(Priority::IDLE.quantum(), 8);
    }

    #[test]
    fn test_user_range() {
        assert!(Priority::user(PRIORITY_USER_MIN as usize).is_ok());
        assert!(Priority::user(PRIORITY_USER_MAX as usize).is_ok());
        assert_eq!(Priority::user(1), Err(KernelError::InvalidArgument));
        assert_eq!(Priority::user(62), Err(KernelError::InvalidArgument));
        assert_eq!(Priority::user(1000), Err(KernelError::InvalidArgument));
        assert!(Priority::new(63).is_some());
        assert!(Priority::new(64).is_none());
    }

    #[test]
    fn test_highest_band_wins() {
        let mut rq = ReadyQueue::new();
        rq.push_back(VcpuId(1), Priority::NORMAL);
        rq.push_back(VcpuId(2), Priority::REALTIME);
        rq.push_back(VcpuId(3), Priority::IDLE);

        assert_eq!(rq.highest(), Some(Priority::REALTIME));
        assert_eq!(rq.pop(), Some((VcpuId(2), Priority::REALTIME)));
        assert_eq!(rq.pop(), Some((VcpuId(1), Priority::NORMAL)));
        assert_eq!(rq.pop(), Some((VcpuId(3), Priority::IDLE)));
        assert!(rq.is_empty());
        assert_eq!(rq.highest(), None);
    }

    #[test]
    fn test_fifo_within_band() {
        let mut rq = ReadyQueue::new();
        for i in 1..=3 {
            rq.push_back(VcpuId(i), Priority::NORMAL);
        }
        rq.push_front(VcpuId(9), Priority::NORMAL);
        assert_eq!(rq.band_len(Priority::NORMAL), 4);

        let order: alloc::vec::Vec<u32> = core::iter::from_fn(|| rq.pop()).map(|(id, _)| id.0).collect();
        assert_eq!(order, [9, 1, 2, 3]);
    }

    #[test]
    fn test_remove_clears_bitmap() {
        let mut rq = ReadyQueue::new();
        rq.push_back(VcpuId(1), Priority::REALTIME);
        rq.push_back(VcpuId(2), Priority::NORMAL);

        assert!(rq.remove(VcpuId(1), Priority::REALTIME));
        assert!(!rq.remove(VcpuId(1), Priority::REALTIME));
        assert_eq!(rq.highest(), Some(Priority::NORMAL));
        assert_eq!(rq.len(), 1);
        assert!(rq.contains(VcpuId(2)));
    }
}
