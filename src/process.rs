//! Process table
//!
//! Processes here are bookkeeping only: an id, a liveness flag and the
//! reason a process went down. VCPUs and dispatch queues point back at
//! their owner; tearing those down is the kernel's job.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use log::{debug, info};

use crate::error::{KResult, KernelError};
use crate::interrupt::{IrqGate, IrqLock};
use crate::types::ProcessId;

/// Lifecycle of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Alive,
    Terminated,
}

/// Entry of the process table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Process {
    pub pid: ProcessId,
    pub state: ProcessState,
    /// Why the process was terminated
    pub exit_reason: Option<KernelError>,
}

struct Table {
    entries: BTreeMap<ProcessId, Process>,
    next_pid: u32,
}

/// Process manager
pub struct ProcessTable {
    table: IrqLock<Table>,
}

impl ProcessTable {
    /// Table holding only the kernel process
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            ProcessId::KERNEL,
            Process {
                pid: ProcessId::KERNEL,
                state: ProcessState::Alive,
                exit_reason: None,
            },
        );
        Self {
            table: IrqLock::new(Table {
                entries,
                next_pid: ProcessId::KERNEL.0 + 1,
            }),
        }
    }

    pub fn create(&self, gate: &IrqGate) -> ProcessId {
        let mut table = self.table.lock(gate);
        let pid = ProcessId(table.next_pid);
        table.next_pid += 1;
        table.entries.insert(
            pid,
            Process {
                pid,
                state: ProcessState::Alive,
                exit_reason: None,
            },
        );
        debug!("process: created {:?}", pid);
        pid
    }

    /// Mark `pid` terminated
    ///
    /// The kernel process cannot be terminated. Terminating a process twice
    /// fails with `InvalidHandle`.
    pub fn terminate(&self, gate: &IrqGate, pid: ProcessId, reason: KernelError) -> KResult<()> {
        if pid == ProcessId::KERNEL {
            return Err(KernelError::Busy);
        }
        let mut table = self.table.lock(gate);
        let process = table
            .entries
            .get_mut(&pid)
            .filter(|p| p.state == ProcessState::Alive)
            .ok_or(KernelError::InvalidHandle)?;
        process.state = ProcessState::Terminated;
        process.exit_reason = Some(reason);
        info!("process: {:?} terminated ({})", pid, reason);
        Ok(())
    }

    pub fn get(&self, gate: &IrqGate, pid: ProcessId) -> Option<Process> {
        self.table.lock(gate).entries.get(&pid).copied()
    }

    pub fn is_alive(&self, gate: &IrqGate, pid: ProcessId) -> bool {
        self.get(gate, pid)
            .is_some_and(|p| p.state == ProcessState::Alive)
    }

    /// Live processes, kernel included
    pub fn alive(&self, gate: &IrqGate) -> Vec<ProcessId> {
        self.table
            .lock(gate)
            .entries
            .values()
            .filter(|p| p.state == ProcessState::Alive)
            .map(|p| p.pid)
            .collect()
    }
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}
