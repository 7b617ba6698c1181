//! Resident-memory sampling around a task call.
//!
//! The probe reads the resident set size of the OS process the task runs in.
//! On the thread backend several tasks share one process, so the delta is an
//! approximation that includes whatever the sibling threads allocated.

use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Samples wall-clock time and RSS at the start of a call.
pub struct ResourceProbe {
    system: System,
    pid: Option<Pid>,
    started: Instant,
    rss_start: Option<u64>,
}

/// Measurements taken when a call finishes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub elapsed: Duration,
    /// Resident-memory delta in megabytes, `None` when the OS refused the read
    pub memory_delta_mb: Option<f64>,
}

impl ResourceProbe {
    /// Take the starting sample
    pub fn start() -> Self {
        let mut system = System::new();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!("current pid unavailable, memory sampling disabled: {}", e);
                None
            }
        };
        let rss_start = pid.and_then(|pid| sample_rss(&mut system, pid));
        Self {
            system,
            pid,
            started: Instant::now(),
            rss_start,
        }
    }

    /// Take the closing sample
    pub fn finish(mut self) -> ResourceUsage {
        let elapsed = self.started.elapsed();
        let rss_end = self.pid.and_then(|pid| sample_rss(&mut self.system, pid));
        let memory_delta_mb = match (self.rss_start, rss_end) {
            (Some(start), Some(end)) => Some((end as f64 - start as f64) / BYTES_PER_MB),
            _ => None,
        };
        ResourceUsage {
            elapsed,
            memory_delta_mb,
        }
    }
}

fn sample_rss(system: &mut System, pid: Pid) -> Option<u64> {
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::nothing().with_memory(),
    );
    system.process(pid).map(|process| process.memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_measures_elapsed() {
        let probe = ResourceProbe::start();
        std::thread::sleep(Duration::from_millis(20));
        let usage = probe.finish();
        assert!(usage.elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_probe_reports_finite_delta() {
        let probe = ResourceProbe::start();
        let buffer = vec![1u8; 4 * 1024 * 1024];
        let usage = probe.finish();
        drop(buffer);
        if let Some(delta) = usage.memory_delta_mb {
            assert!(delta.is_finite());
        }
    }
}
