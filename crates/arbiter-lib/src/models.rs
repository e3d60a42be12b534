//! Core data models for usage events

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Usage of one process inside one event. CPU is a percent of a single core,
/// memory is bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessUsage {
    pub pid: u32,
    /// Kernel comm, at most 15 bytes.
    pub name: String,
    /// Real owner of the process; can differ from the slice's uid (e.g.
    /// root-owned sshd children).
    pub uid_owner: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    /// How many processes were folded into this record (see
    /// [`fold_processes_by_name`]).
    pub count: u32,
    pub whitelisted: bool,
}

/// Averaged usage of one user over one sub-interval of the control cycle.
///
/// The cgroup totals are authoritative; the per-process list explains them
/// but may sum to less (the kernel accounts short-lived work no pid sample
/// caught). The accounted fields exclude whitelisted usage and the optional
/// "other processes" remainder, and are what the badness scorer sees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub ts_start: i64,
    pub ts_end: i64,
    /// Whole-cgroup CPU usage as a percent of a single core.
    pub cpu_pct: f64,
    /// Whole-cgroup memory usage in bytes.
    pub mem_bytes: u64,
    pub processes: Vec<ProcessUsage>,
    /// CPU usage counted against the user.
    pub accounted_cpu_pct: f64,
    /// Memory counted against the user, in bytes.
    pub accounted_mem_bytes: u64,
}

impl Event {
    /// CPU usage excluded from scoring (whitelisted processes plus the
    /// "other processes" remainder when configured).
    pub fn whitelisted_cpu_pct(&self) -> f64 {
        (self.cpu_pct - self.accounted_cpu_pct).max(0.0)
    }

    pub fn whitelisted_mem_bytes(&self) -> u64 {
        self.mem_bytes.saturating_sub(self.accounted_mem_bytes)
    }
}

/// Fold processes sharing a comm into single records: usages and counts add,
/// a whitelisted member marks the fold. Used when snapshotting an event ring
/// for the notifier so `python (x12)` reads as one line.
pub fn fold_processes_by_name(processes: &[ProcessUsage]) -> Vec<ProcessUsage> {
    let mut folded: HashMap<&str, ProcessUsage> = HashMap::new();
    for proc in processes {
        folded
            .entry(proc.name.as_str())
            .and_modify(|f| {
                f.cpu_pct += proc.cpu_pct;
                f.mem_bytes += proc.mem_bytes;
                f.count += proc.count;
                f.whitelisted |= proc.whitelisted;
            })
            .or_insert_with(|| proc.clone());
    }
    let mut out: Vec<ProcessUsage> = folded.into_values().collect();
    out.sort_by(|a, b| {
        b.cpu_pct
            .partial_cmp(&a.cpu_pct)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_usage(pid: u32, name: &str, cpu: f64, mem: u64) -> ProcessUsage {
        ProcessUsage {
            pid,
            name: name.to_string(),
            uid_owner: 1000,
            cpu_pct: cpu,
            mem_bytes: mem,
            count: 1,
            whitelisted: false,
        }
    }

    #[test]
    fn test_fold_processes_by_name() {
        let procs = vec![
            proc_usage(100, "python", 50.0, 1024),
            proc_usage(101, "python", 30.0, 2048),
            proc_usage(102, "bash", 1.0, 512),
        ];
        let folded = fold_processes_by_name(&procs);
        assert_eq!(folded.len(), 2);

        let python = folded.iter().find(|p| p.name == "python").unwrap();
        assert_eq!(python.count, 2);
        assert_eq!(python.cpu_pct, 80.0);
        assert_eq!(python.mem_bytes, 3072);
    }

    #[test]
    fn test_fold_sorts_by_cpu() {
        let procs = vec![
            proc_usage(1, "idle", 0.1, 10),
            proc_usage(2, "busy", 390.0, 10),
        ];
        let folded = fold_processes_by_name(&procs);
        assert_eq!(folded[0].name, "busy");
    }

    #[test]
    fn test_whitelisted_remainder() {
        let event = Event {
            ts_start: 0,
            ts_end: 10,
            cpu_pct: 100.0,
            mem_bytes: 4096,
            processes: vec![],
            accounted_cpu_pct: 75.0,
            accounted_mem_bytes: 1024,
        };
        assert_eq!(event.whitelisted_cpu_pct(), 25.0);
        assert_eq!(event.whitelisted_mem_bytes(), 3072);
    }
}
