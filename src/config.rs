//! Kernel configuration
//!
//! Tunables for the scheduler and dispatch layer. Architecture constants
//! (band count, trap arity, vector count) stay next to the types they bound.

use crate::error::{KResult, KernelError};

/// Smallest stack a VCPU may be given (bytes)
pub const MIN_STACK_SIZE: usize = 512;

/// Scheduler tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedConfig {
    /// Number of VCPU slots available to `acquire` (idle VCPU not included)
    pub max_vcpus: usize,
    /// Smallest stack accepted by `acquire`
    pub min_stack_size: usize,
    /// Largest stack accepted by `acquire`
    pub max_stack_size: usize,
    /// Stack used when the caller passes 0
    pub default_stack_size: usize,
    /// Timer period; informational, quanta are counted in ticks
    pub tick_period_ms: u32,
    /// Finalized stacks kept around for the next acquisition
    pub reuse_cache: usize,
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self {
            max_vcpus: 32,
            min_stack_size: MIN_STACK_SIZE,
            max_stack_size: 64 * 1024,
            default_stack_size: 4 * 1024,
            tick_period_ms: 16,
            reuse_cache: 16,
        }
    }
}

impl SchedConfig {
    pub fn validate(&self) -> KResult<()> {
        if self.max_vcpus == 0
            || self.min_stack_size < MIN_STACK_SIZE
            || self.min_stack_size > self.max_stack_size
            || self.default_stack_size < self.min_stack_size
            || self.default_stack_size > self.max_stack_size
            || self.tick_period_ms == 0
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

/// Dispatch queue tunables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    /// Capacity for queues created without an explicit bound (`None` = unbounded)
    pub default_capacity: Option<usize>,
    /// Upper limit for a queue's `max_concurrency`
    pub max_concurrency_limit: usize,
    /// Pending items above which a concurrent queue grows another lane
    pub spawn_threshold: usize,
    /// Ticks a parked worker may sit idle before its lane is released
    pub lane_idle_ticks: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_capacity: None,
            max_concurrency_limit: 8,
            spawn_threshold: 4,
            // About two seconds at the default tick period
            lane_idle_ticks: 125,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self) -> KResult<()> {
        if self.max_concurrency_limit == 0
            || self.default_capacity == Some(0)
            || self.lane_idle_ticks == 0
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(())
    }
}

/// Complete kernel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KernelConfig {
    pub sched: SchedConfig,
    pub dispatch: DispatchConfig,
}

impl KernelConfig {
    /// Check every section
    pub fn validate(&self) -> KResult<()> {
        self.sched.validate()?;
        self.dispatch.validate()
    }

    /// Default configuration with a different slot count
    pub fn with_max_vcpus(max_vcpus: usize) -> Self {
        let mut config = Self::default();
        config.sched.max_vcpus = max_vcpus;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_stack_bounds() {
        let mut config = KernelConfig::default();
        config.sched.min_stack_size = 128;
        assert_eq!(config.validate(), Err(KernelError::InvalidArgument));

        let mut config = KernelConfig::default();
        config.sched.default_stack_size = config.sched.max_stack_size + 1;
        assert_eq!(config.validate(), Err(KernelError::InvalidArgument));
    }

    #[test]
    fn test_rejects_zero_slots_and_capacity() {
        assert!(KernelConfig::with_max_vcpus(0).validate().is_err());

        let mut config = KernelConfig::default();
        config.dispatch.default_capacity = Some(0);
        assert!(config.validate().is_err());

        let mut config = KernelConfig::default();
        config.dispatch.lane_idle_ticks = 0;
        assert!(config.validate().is_err());
    }
}
