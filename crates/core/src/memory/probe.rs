//! Sources of the current memory usage figure.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use sysinfo::{Pid, ProcessExt, System, SystemExt};

use crate::Error;

/// Reports how many bytes the process currently uses.
pub trait UsageProbe: Send + Sync {
    fn current_usage(&self) -> Result<u64, Error>;
}

/// Resident set size of the current process, read through `sysinfo`.
pub struct ProcessProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self { system: Mutex::new(System::new()), pid: sysinfo::get_current_pid().ok() }
    }
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageProbe for ProcessProbe {
    fn current_usage(&self) -> Result<u64, Error> {
        let pid = self.pid.ok_or_else(|| Error::IoFailure("current process id is unavailable".into()))?;

        let mut system = self.system.lock().unwrap_or_else(|e| e.into_inner());
        system.refresh_process(pid);
        system
            .process(pid)
            .map(|process| process.memory())
            .ok_or_else(|| Error::IoFailure(format!("no process entry for pid {pid}")))
    }
}

/// Usage figure set by the caller.
///
/// Useful when the embedding application tracks its own allocations, and in tests.
#[derive(Debug, Default)]
pub struct ManualProbe {
    usage: AtomicU64,
}

impl ManualProbe {
    pub fn new(usage: u64) -> Self {
        Self { usage: AtomicU64::new(usage) }
    }

    pub fn set(&self, usage: u64) {
        self.usage.store(usage, Ordering::Release);
    }
}

impl UsageProbe for ManualProbe {
    fn current_usage(&self) -> Result<u64, Error> {
        Ok(self.usage.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_probe_reports_nonzero_usage() {
        let probe = ProcessProbe::new();
        let usage = probe.current_usage().unwrap();
        assert!(usage > 0);
    }

    #[test]
    fn test_manual_probe() {
        let probe = ManualProbe::new(10);
        assert_eq!(probe.current_usage().unwrap(), 10);
        probe.set(42);
        assert_eq!(probe.current_usage().unwrap(), 42);
    }
}
