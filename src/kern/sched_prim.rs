//! Scheduling Primitives - Wait/Wakeup vocabulary
//!
//! A VCPU that cannot make progress parks in `Waiting` with a reason and
//! is handed a [`WaitResult`] when something wakes it.

/// Result of a wait, read by the VCPU once it runs again
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum WaitResult {
    /// Awakened by the event it waited for
    Normal = 0,
    /// Awakened because the wait was cut short
    Interrupted = 1,
    /// Deadline passed first
    TimedOut = 2,
}

/// Why a VCPU is waiting (debugging and statistics)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum WaitReason {
    /// Generic kernel event
    Event = 0,
    /// Dispatch worker with an empty lane
    DispatchIdle = 1,
    /// Waiting for I/O completion in another subsystem
    Io = 2,
    /// Waiting for a timer deadline
    Timer = 3,
}

impl WaitReason {
    pub fn name(self) -> &'static str {
        match self {
            WaitReason::Event => "event",
            WaitReason::DispatchIdle => "dispatch-idle",
            WaitReason::Io => "io",
            WaitReason::Timer => "timer",
        }
    }
}
