//! Event assembly and whitelist decomposition
//!
//! Raw collector output becomes an [`Event`] here: each process is marked
//! whitelisted or accounted, and the cgroup total is split so the badness
//! scorer only ever sees the accounted share. Events land in a bounded
//! per-user ring that backs emails and the historical log.

use std::collections::VecDeque;

use crate::collector::RawEvent;
use crate::models::{Event, ProcessUsage};
use crate::status::StatusPolicy;

/// Bounded, newest-last ring of a user's events.
#[derive(Debug, Clone)]
pub struct EventRing {
    events: VecDeque<Event>,
    cap: usize,
}

impl EventRing {
    pub fn new(cap: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(cap.min(256)),
            cap: cap.max(1),
        }
    }

    /// Append an event, evicting the oldest once full.
    pub fn push(&mut self, event: Event) {
        while self.events.len() >= self.cap {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    pub fn latest(&self) -> Option<&Event> {
        self.events.back()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Newest-first copy of the ring, for the notifier and historical log.
    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().rev().cloned().collect()
    }

    /// Average accounted usage over the newest `count` events. Returns
    /// (cpu percent of a core, memory bytes).
    pub fn average_accounted(&self, count: usize) -> (f64, u64) {
        let taken = self.events.iter().rev().take(count.max(1));
        let mut cpu = 0.0;
        let mut mem = 0u64;
        let mut n = 0u32;
        for event in taken {
            cpu += event.accounted_cpu_pct;
            mem += event.accounted_mem_bytes;
            n += 1;
        }
        if n == 0 {
            return (0.0, 0);
        }
        (cpu / n as f64, mem / n as u64)
    }
}

/// Turn a raw sample into an event under the user's current status group.
///
/// The accounted share is the cgroup total minus whitelisted process usage,
/// minus the "other processes" remainder when that is configured as
/// whitelisted. The remainder is the nonnegative gap between what the
/// kernel charged the cgroup and what the surviving pid samples explain.
pub fn build_event(raw: RawEvent, policy: &StatusPolicy, current_group: &str) -> Event {
    let mut processes: Vec<ProcessUsage> = Vec::with_capacity(raw.processes.len());
    let mut proc_cpu = 0.0f64;
    let mut proc_mem = 0u64;
    let mut whitelisted_cpu = 0.0f64;
    let mut whitelisted_mem = 0u64;

    for proc in raw.processes {
        let whitelisted = policy.is_whitelisted(&proc.name, proc.owner_uid, current_group);
        proc_cpu += proc.cpu_pct;
        proc_mem += proc.mem_bytes;
        if whitelisted {
            whitelisted_cpu += proc.cpu_pct;
            whitelisted_mem += proc.mem_bytes;
        }
        processes.push(ProcessUsage {
            pid: proc.pid,
            name: proc.name,
            uid_owner: proc.owner_uid,
            cpu_pct: proc.cpu_pct,
            mem_bytes: proc.mem_bytes,
            count: 1,
            whitelisted,
        });
    }

    let other_cpu = (raw.cpu_pct - proc_cpu).max(0.0);
    let other_mem = raw.mem_bytes.saturating_sub(proc_mem);
    if policy.whitelist_other_processes() {
        whitelisted_cpu += other_cpu;
        whitelisted_mem += other_mem;
    }

    let accounted_cpu_pct = (raw.cpu_pct - whitelisted_cpu).clamp(0.0, raw.cpu_pct.max(0.0));
    let accounted_mem_bytes = raw.mem_bytes.saturating_sub(whitelisted_mem);

    Event {
        ts_start: raw.ts_start,
        ts_end: raw.ts_end,
        cpu_pct: raw.cpu_pct,
        mem_bytes: raw.mem_bytes,
        processes,
        accounted_cpu_pct,
        accounted_mem_bytes,
    }
}
