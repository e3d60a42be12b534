//! Usage collection from cgroups and /proc
//!
//! The collector runs `poll` instantaneous passes per sub-interval, spaced
//! evenly, and pairs consecutive passes into rates: a CPU percentage only
//! exists between two reads of the same monotonic counter. Pairs poisoned
//! by pid reuse or a recreated cgroup (counter went backwards) are dropped
//! rather than extrapolated.

mod cgroup;
mod process;


pub use cgroup::{parse_memory_stat, scan_slice_uids, uid_from_slice_name, SystemdSlice};
pub use process::{
    parse_stat_cputime, parse_status, sum_pss_bytes, truncate_comm, ProcReader, ProcessInstant,
};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::ArbiterConfig;
use crate::sysinfo::{self, SystemSpecs};

/// A user eligible for tracking this tick.
#[derive(Debug, Clone)]
pub struct TrackedUser {
    pub uid: u32,
    pub username: String,
    pub gids: Vec<u32>,
}

/// Usage of one process averaged over one sub-interval, before whitelist
/// decomposition.
#[derive(Debug, Clone)]
pub struct RawProcess {
    pub pid: u32,
    pub name: String,
    pub owner_uid: u32,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
}

/// Usage of one user's cgroup averaged over one sub-interval.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub ts_start: i64,
    pub ts_end: i64,
    pub cpu_pct: f64,
    pub mem_bytes: u64,
    pub processes: Vec<RawProcess>,
}

/// Whole-machine usage of the user.slice aggregate, for the high-usage
/// watcher.
#[derive(Debug, Clone, Copy)]
pub struct MachineUsage {
    /// Percent of a single core, summed across all users.
    pub cpu_pct: f64,
    /// Percent of the machine's memory.
    pub mem_pct: f64,
}

/// One instantaneous pass over every tracked slice.
struct Pass {
    at: Instant,
    all_users: Option<SliceInstant>,
    slices: HashMap<u32, SliceInstant>,
    processes: HashMap<u32, HashMap<u32, ProcessInstant>>,
}

#[derive(Debug, Clone, Copy)]
struct SliceInstant {
    cpu_user_ns: u64,
    cpu_system_ns: u64,
    mem_bytes: u64,
}

impl SliceInstant {
    fn cpu_total_ns(&self) -> u64 {
        self.cpu_user_ns + self.cpu_system_ns
    }
}

/// Collects usage samples for every tracked user.
pub struct Collector {
    cgroup_root: PathBuf,
    proc: ProcReader,
    specs: SystemSpecs,
    min_uid: u32,
    memsw: bool,
    poll: u32,
    /// Primary gid of the daemon's own group; its members are service
    /// accounts, not people.
    daemon_gid: Option<u32>,
    /// Uids warned about once for having no passwd entry.
    warned_no_passwd: HashSet<u32>,
}

impl Collector {
    pub fn new(cfg: &ArbiterConfig, specs: SystemSpecs) -> Self {
        Self::with_roots(cfg, specs, "/sys/fs/cgroup", "/proc")
    }

    /// Create a collector with custom cgroup and proc roots (for testing).
    pub fn with_roots(
        cfg: &ArbiterConfig,
        specs: SystemSpecs,
        cgroup_root: impl Into<PathBuf>,
        proc_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            proc: ProcReader::new(
                proc_root,
                cfg.processes.pss,
                cfg.processes.pss_threshold,
                cfg.processes.memsw,
            ),
            specs,
            min_uid: cfg.general.min_uid,
            memsw: cfg.processes.memsw,
            poll: cfg.general.poll.max(2),
            daemon_gid: sysinfo::gid_of_group(&cfg.daemon.groupname),
            warned_no_passwd: HashSet::new(),
        }
    }

    /// Find users with an active slice who should be tracked: uid at or
    /// above the minimum, a passwd entry, and not one of the daemon's own
    /// service accounts.
    pub async fn discover_users(&mut self) -> Result<Vec<TrackedUser>> {
        let uids = scan_slice_uids(&self.cgroup_root, self.min_uid).await?;

        let mut users = Vec::with_capacity(uids.len());
        for uid in uids {
            let Some(entry) = sysinfo::passwd_entry(uid) else {
                // Sessions can outlive LDAP accounts; complain once
                if self.warned_no_passwd.insert(uid) {
                    warn!(uid, "Found a user without a passwd entry, ignoring");
                }
                continue;
            };
            if Some(entry.primary_gid) == self.daemon_gid {
                continue;
            }
            users.push(TrackedUser {
                uid,
                username: entry.name,
                gids: sysinfo::group_gids(uid),
            });
        }
        Ok(users)
    }

    /// Collect one sub-interval's usage for the given uids: `poll` passes
    /// spaced `poll_interval` apart, paired and averaged into one event per
    /// user that stayed observable.
    pub async fn collect_event(
        &self,
        uids: &[u32],
        poll_interval: Duration,
    ) -> (HashMap<u32, RawEvent>, Option<MachineUsage>) {
        let ts_start = chrono::Utc::now().timestamp();
        let mut passes: Vec<Pass> = Vec::with_capacity(self.poll as usize);

        for round in 0..self.poll {
            let deadline = Instant::now() + poll_interval;
            passes.push(self.instant_pass(uids).await);

            if round + 1 < self.poll {
                if Instant::now() > deadline {
                    debug!(
                        behind_ms = (Instant::now() - deadline).as_millis() as u64,
                        "Collection poll is running behind"
                    );
                }
                tokio::time::sleep_until(deadline).await;
            }
        }
        let ts_end = chrono::Utc::now().timestamp();

        let mut events = HashMap::new();
        for &uid in uids {
            if let Some(event) = assemble_event(&passes, uid, &self.specs, ts_start, ts_end) {
                events.insert(uid, event);
            }
        }

        (events, assemble_machine_usage(&passes, &self.specs))
    }

    /// Read every slice and pid once. Vanished units are simply absent from
    /// the result.
    async fn instant_pass(&self, uids: &[u32]) -> Pass {
        let mut pass = Pass {
            at: Instant::now(),
            all_users: None,
            slices: HashMap::new(),
            processes: HashMap::new(),
        };

        pass.all_users = self
            .read_slice(&SystemdSlice::all_users(&self.cgroup_root))
            .await;

        for &uid in uids {
            let slice = SystemdSlice::user(&self.cgroup_root, uid);
            let pids = match slice.pids().await {
                Ok(pids) => pids,
                Err(err) => {
                    debug!(uid, error = %err, "User slice vanished during collection");
                    continue;
                }
            };
            let Some(instant) = self.read_slice(&slice).await else {
                continue;
            };
            pass.slices.insert(uid, instant);

            let mut procs = HashMap::new();
            for pid in pids {
                match self.proc.read(pid).await {
                    Ok(instant) => {
                        procs.insert(pid, instant);
                    }
                    Err(err) => {
                        debug!(uid, pid, error = %err, "Process vanished during collection");
                    }
                }
            }
            pass.processes.insert(uid, procs);
        }

        pass
    }

    async fn read_slice(&self, slice: &SystemdSlice) -> Option<SliceInstant> {
        let (cpu_user_ns, cpu_system_ns) = slice.cpu_usage_ns().await.ok()?;
        let mem_bytes = slice.memory_bytes(self.memsw).await.ok()?;
        Some(SliceInstant {
            cpu_user_ns,
            cpu_system_ns,
            mem_bytes,
        })
    }
}

/// Pair consecutive passes into rates for one uid and average them. Returns
/// None when no valid cgroup pair survived (the user contributes no data).
fn assemble_event(
    passes: &[Pass],
    uid: u32,
    specs: &SystemSpecs,
    ts_start: i64,
    ts_end: i64,
) -> Option<RawEvent> {
    let mut cpu_pcts = Vec::new();
    let mut mem_totals = Vec::new();
    let mut proc_cpu: HashMap<u32, Vec<f64>> = HashMap::new();
    let mut proc_mem: HashMap<u32, Vec<u64>> = HashMap::new();
    let mut proc_info: HashMap<u32, &ProcessInstant> = HashMap::new();
    let empty = HashMap::new();

    for pair in passes.windows(2) {
        let (first, second) = (&pair[0], &pair[1]);
        let wall_secs = (second.at - first.at).as_secs_f64();
        if wall_secs <= 0.0 {
            continue;
        }

        if let (Some(a), Some(b)) = (first.slices.get(&uid), second.slices.get(&uid)) {
            // A lower second read means the slice was torn down and
            // recreated between passes; the delta is meaningless.
            if b.cpu_total_ns() >= a.cpu_total_ns() {
                let delta_ns = (b.cpu_total_ns() - a.cpu_total_ns()) as f64;
                cpu_pcts.push(delta_ns / (wall_secs * 1e9) * 100.0);
                mem_totals.push((a.mem_bytes + b.mem_bytes) / 2);
            }
        }

        let first_procs = first.processes.get(&uid).unwrap_or(&empty);
        let second_procs = second.processes.get(&uid).unwrap_or(&empty);
        for (pid, a) in first_procs {
            let Some(b) = second_procs.get(pid) else {
                continue;
            };
            // Same pid, different comm or a smaller counter: the pid was
            // reused. Drop the pair.
            if a.name != b.name || b.cputime_ticks < a.cputime_ticks {
                continue;
            }
            let delta_secs =
                (b.cputime_ticks - a.cputime_ticks) as f64 / specs.clockticks_per_sec as f64;
            proc_cpu
                .entry(*pid)
                .or_default()
                .push(delta_secs / wall_secs * 100.0);
            proc_mem
                .entry(*pid)
                .or_default()
                .push((a.mem_bytes + b.mem_bytes) / 2);
            proc_info.entry(*pid).or_insert(a);
        }
    }

    if cpu_pcts.is_empty() {
        return None;
    }

    let mut processes: Vec<RawProcess> = proc_info
        .into_iter()
        .map(|(pid, info)| {
            let cpus = &proc_cpu[&pid];
            let mems = &proc_mem[&pid];
            RawProcess {
                pid,
                name: info.name.clone(),
                owner_uid: info.owner_uid,
                cpu_pct: cpus.iter().sum::<f64>() / cpus.len() as f64,
                mem_bytes: mems.iter().sum::<u64>() / mems.len() as u64,
            }
        })
        .collect();
    processes.sort_by_key(|p| p.pid);

    Some(RawEvent {
        ts_start,
        ts_end,
        cpu_pct: cpu_pcts.iter().sum::<f64>() / cpu_pcts.len() as f64,
        mem_bytes: mem_totals.iter().sum::<u64>() / mem_totals.len() as u64,
        processes,
    })
}

fn assemble_machine_usage(passes: &[Pass], specs: &SystemSpecs) -> Option<MachineUsage> {
    let mut cpu_pcts = Vec::new();
    let mut mem_totals = Vec::new();

    for pair in passes.windows(2) {
        let (first, second) = (&pair[0], &pair[1]);
        let wall_secs = (second.at - first.at).as_secs_f64();
        if wall_secs <= 0.0 {
            continue;
        }
        if let (Some(a), Some(b)) = (&first.all_users, &second.all_users) {
            if b.cpu_total_ns() >= a.cpu_total_ns() {
                let delta_ns = (b.cpu_total_ns() - a.cpu_total_ns()) as f64;
                cpu_pcts.push(delta_ns / (wall_secs * 1e9) * 100.0);
                mem_totals.push((a.mem_bytes + b.mem_bytes) / 2);
            }
        }
    }

    if cpu_pcts.is_empty() {
        return None;
    }
    Some(MachineUsage {
        cpu_pct: cpu_pcts.iter().sum::<f64>() / cpu_pcts.len() as f64,
        mem_pct: specs.bytes_to_pct(mem_totals.iter().sum::<u64>() / mem_totals.len() as u64),
    })
}
