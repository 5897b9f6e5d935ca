//! vcpu_kernel - VCPU scheduling and dispatch core of a small microkernel
//!
//! This crate provides the execution side of the kernel: the interrupt
//! gate, virtual processors and their priority scheduler, dispatch queues
//! for deferred work, and the syscall trap boundary that ties user code to
//! all of it.

#![cfg_attr(not(test), no_std)]
// Kernel-appropriate clippy configuration
// Many kernel types have specialized initialization that doesn't fit Default
#![allow(clippy::new_without_default)]
// Register and id conversions are explicit for documentation
#![allow(clippy::unnecessary_cast)]

extern crate alloc;

// Core types
pub mod config;
pub mod error;
pub mod types;

// Execution core
pub mod dispatch;
pub mod interrupt;
pub mod kern;
pub mod kernel;
pub mod process;
pub mod scheduler;

pub use config::{DispatchConfig, KernelConfig, SchedConfig};
pub use dispatch::{
    Closure, DispatchQueue, DrainStatus, Fault, FaultAction, QueueAttrs, QueueState, SubmitFlags,
};
pub use error::{ErrorKind, KResult, KernelError};
pub use interrupt::{IrqGate, IrqGuard, IrqLock, IrqToken};
pub use kernel::{init, kernel, Kernel, Step};
pub use scheduler::{Scheduler, IDLE_VCPU};
pub use types::{ProcessId, QueueId, Tick, VcpuId, WorkId};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Kernel name
pub const NAME: &str = "vcpu_kernel";
