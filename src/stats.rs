//! Resource usage snapshots for the supervised process.
use std::{thread, time::Duration};

use serde::Serialize;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time statistics of one process.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerStats {
    pub cpu_percent: f32,
    pub memory_mb: f64,
    pub thread_count: usize,
    pub uptime: Duration,
}

/// Total physical memory of the host in megabytes.
pub fn total_memory_mb() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory() / 1024 / 1024
}

/// Samples `pid`, returning `None` when the process does not exist.
///
/// CPU usage needs two refreshes, so this blocks for sysinfo's minimum update interval.
pub fn sample_process(pid: u32) -> Option<ServerStats> {
    let mut system = System::new();
    let pid_sys = Pid::from_u32(pid);
    let processes = [pid_sys];

    let refresh = |system: &mut System| {
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&processes),
            true,
            ProcessRefreshKind::everything(),
        );
    };

    refresh(&mut system);
    thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    refresh(&mut system);

    let process = system.process(pid_sys)?;
    Some(ServerStats {
        cpu_percent: process.cpu_usage(),
        memory_mb: process.memory() as f64 / (1024.0 * 1024.0),
        thread_count: process.tasks().map(|tasks| tasks.len()).unwrap_or(1),
        uptime: Duration::from_secs(process.run_time()),
    })
}
