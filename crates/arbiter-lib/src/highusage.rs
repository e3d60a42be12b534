//! Whole-machine high-usage watch
//!
//! Penalties handle single bad actors; this catches the machine being
//! pinned by many users at once. Usage of the user.slice aggregate is kept
//! in a short ring, and only when every event in the ring is above the
//! thresholds does a report fire, followed by a cooldown.

use crate::collector::MachineUsage;
use crate::config::HighUsageConfig;
use crate::notifier::HighUsageUser;
use crate::sysinfo::SystemSpecs;
use crate::user::UserState;
use std::collections::VecDeque;

pub struct HighUsageWatcher {
    history: VecDeque<MachineUsage>,
    threshold_period: usize,
    /// Percent of a single core the aggregate must exceed.
    cpu_threshold_pct: f64,
    /// Percent of machine memory.
    mem_threshold_pct: f64,
    user_count: usize,
    cooldown_secs: i64,
    cooldown_until: i64,
}

impl HighUsageWatcher {
    pub fn new(cfg: &HighUsageConfig, specs: &SystemSpecs) -> Self {
        let mut cpu_count = specs.cpu_count as f64;
        if cfg.div_cpu_thresholds_by_threads_per_core {
            cpu_count /= specs.threads_per_core as f64;
        }

        let threshold_period = cfg.threshold_period.max(1);
        let mut history = VecDeque::with_capacity(threshold_period);
        // Pre-fill with zeros so startup needs a full period of evidence
        for _ in 0..threshold_period {
            history.push_back(MachineUsage {
                cpu_pct: 0.0,
                mem_pct: 0.0,
            });
        }

        Self {
            history,
            threshold_period,
            cpu_threshold_pct: cfg.cpu_usage_threshold * cpu_count * 100.0,
            mem_threshold_pct: cfg.mem_usage_threshold * 100.0,
            user_count: cfg.user_count,
            cooldown_secs: cfg.timeout,
            cooldown_until: 0,
        }
    }

    /// Record one aggregate usage event.
    pub fn add_usage(&mut self, usage: MachineUsage) {
        while self.history.len() >= self.threshold_period {
            self.history.pop_front();
        }
        self.history.push_back(usage);
    }

    /// Whether a report should fire now. Arms the cooldown when it does.
    pub fn check(&mut self, now: i64) -> Option<MachineUsage> {
        if now < self.cooldown_until {
            return None;
        }
        let sustained = self.history.len() == self.threshold_period
            && self.history.iter().all(|event| {
                event.cpu_pct > self.cpu_threshold_pct || event.mem_pct > self.mem_threshold_pct
            });
        if !sustained {
            return None;
        }
        self.cooldown_until = now + self.cooldown_secs;
        self.history.back().copied()
    }

    /// The heaviest users right now, by usage relative to the whole
    /// machine (status quotas are irrelevant here).
    pub fn top_users(&self, users: &[&UserState], specs: &SystemSpecs) -> Vec<HighUsageUser> {
        let total_cpu_pct = specs.cpu_count as f64 * 100.0;
        let mut ranked: Vec<HighUsageUser> = users
            .iter()
            .filter_map(|user| {
                let event = user.ring.latest()?;
                Some(HighUsageUser {
                    uid: user.uid,
                    username: user.username.clone(),
                    cpu_pct: event.cpu_pct,
                    mem_pct: specs.bytes_to_pct(event.mem_bytes),
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            let a_rel = a.cpu_pct / total_cpu_pct + a.mem_pct / 100.0;
            let b_rel = b.cpu_pct / total_cpu_pct + b.mem_pct / 100.0;
            b_rel.partial_cmp(&a_rel).unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked.truncate(self.user_count);
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn specs() -> SystemSpecs {
        SystemSpecs {
            total_mem_bytes: 16 * 1024 * 1024 * 1024,
            total_swap_bytes: 0,
            cpu_count: 8,
            threads_per_core: 1,
            clockticks_per_sec: 100,
            hostname: "testhost".to_string(),
        }
    }

    fn config(threshold_period: usize) -> HighUsageConfig {
        HighUsageConfig {
            high_usage_watcher: true,
            cpu_usage_threshold: 0.8,
            mem_usage_threshold: 0.8,
            user_count: 4,
            div_cpu_thresholds_by_threads_per_core: false,
            threshold_period,
            timeout: 3600,
        }
    }

    fn high() -> MachineUsage {
        // above 0.8 * 8 cores * 100
        MachineUsage {
            cpu_pct: 700.0,
            mem_pct: 10.0,
        }
    }

    fn low() -> MachineUsage {
        MachineUsage {
            cpu_pct: 100.0,
            mem_pct: 10.0,
        }
    }

    #[test]
    fn test_fires_only_after_full_period() {
        let mut watcher = HighUsageWatcher::new(&config(3), &specs());

        // Ring starts zero-filled; two high events are not enough
        watcher.add_usage(high());
        watcher.add_usage(high());
        assert!(watcher.check(100).is_none());

        watcher.add_usage(high());
        assert!(watcher.check(100).is_some());
    }

    #[test]
    fn test_one_low_event_resets_evidence() {
        let mut watcher = HighUsageWatcher::new(&config(3), &specs());
        watcher.add_usage(high());
        watcher.add_usage(low());
        watcher.add_usage(high());
        assert!(watcher.check(100).is_none());
    }

    #[test]
    fn test_cooldown_suppresses_repeat_reports() {
        let mut watcher = HighUsageWatcher::new(&config(1), &specs());
        watcher.add_usage(high());
        assert!(watcher.check(100).is_some());

        watcher.add_usage(high());
        assert!(watcher.check(200).is_none());
        // after the hour-long cooldown it may fire again
        watcher.add_usage(high());
        assert!(watcher.check(100 + 3600).is_some());
    }

    #[test]
    fn test_memory_threshold_alone_can_fire() {
        let mut watcher = HighUsageWatcher::new(&config(1), &specs());
        watcher.add_usage(MachineUsage {
            cpu_pct: 0.0,
            mem_pct: 95.0,
        });
        assert!(watcher.check(0).is_some());
    }
}
