//! Registry of supervised child processes
//!
//! Supervisors own record lifecycle (register on spawn, deregister on any
//! exit path); the shutdown coordinator only enumerates and force-kills.
//! Registration and removal go through the same map, so enumeration never
//! sees a half-registered process.

use dashmap::DashMap;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use provd_types::StageKind;
use std::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// One supervised child process
#[derive(Debug, Clone)]
pub struct ActiveProcessRecord {
    pub process_id: Uuid,
    /// Request this stage belongs to, for log correlation
    pub request_id: Uuid,
    pub stage: StageKind,
    pub pid: i32,
    pub started_at: Instant,
}

/// Shared view of all currently running stage executors
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: DashMap<Uuid, ActiveProcessRecord>,
}

impl ProcessRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, record: ActiveProcessRecord) {
        self.processes.insert(record.process_id, record);
    }

    pub(crate) fn deregister(&self, process_id: Uuid) {
        self.processes.remove(&process_id);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    /// Snapshot of active records, for diagnostics
    #[must_use]
    pub fn snapshot(&self) -> Vec<ActiveProcessRecord> {
        self.processes.iter().map(|r| r.value().clone()).collect()
    }

    /// Force-kill every process still registered
    ///
    /// Used by the shutdown coordinator once the graceful drain window has
    /// elapsed. Returns the number of kill signals sent.
    pub fn kill_all(&self) -> usize {
        let mut killed = 0;
        for record in &self.processes {
            let pid = Pid::from_raw(record.pid);
            match kill(pid, Signal::SIGKILL) {
                Ok(()) => killed += 1,
                Err(nix::errno::Errno::ESRCH) => {} // already gone
                Err(e) => {
                    warn!(pid = record.pid, stage = %record.stage, "failed to kill process: {e}");
                }
            }
        }
        killed
    }
}

/// Send SIGTERM to a process, ignoring already-exited children
pub(crate) fn terminate_gracefully(pid: i32) {
    let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pid: i32) -> ActiveProcessRecord {
        ActiveProcessRecord {
            process_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            stage: StageKind::ImageWrite,
            pid,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn register_and_deregister() {
        let registry = ProcessRegistry::new();
        let rec = record(12345);
        let id = rec.process_id;

        registry.register(rec);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.snapshot()[0].pid, 12345);

        registry.deregister(id);
        assert!(registry.is_empty());
    }

    #[test]
    fn kill_all_skips_missing_processes() {
        let registry = ProcessRegistry::new();
        // A pid that certainly does not exist; ESRCH is swallowed
        registry.register(record(i32::MAX - 1));
        assert_eq!(registry.kill_all(), 0);
    }
}
