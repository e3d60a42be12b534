//! Status groups and the penalty state machine
//!
//! Every user has a default status group (matched from configuration by uid
//! or gid) and may temporarily sit in one of the ordered penalty tiers. The
//! state machine here decides promotions into penalty on a badness
//! violation, releases on timeout, and the slow forgiveness of historical
//! occurrences.

use anyhow::{Context, Result};
use std::collections::HashMap;

use crate::badness::Badness;
use crate::config::{ArbiterConfig, PenaltyTierConfig, StatusGroupConfig};
use crate::sysinfo::SystemSpecs;

/// A user's position in the status machine.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    /// The group currently applied to the user's cgroup.
    pub current: String,
    /// The group the user returns to after penalties expire.
    pub default: String,
    /// Historical penalty count; indexes into the penalty order.
    pub occurrences: u32,
    /// When the current penalty ends. None outside penalty.
    pub penalty_expiry_ts: Option<i64>,
    /// When the next occurrence is forgiven. None when the clock is unarmed.
    pub occur_expiry_ts: Option<i64>,
    /// Hostname that applied the current penalty; gates release emails so
    /// only one host of a sync group sends them.
    pub authority: Option<String>,
}

impl Status {
    /// A fresh status sitting in the given default group.
    pub fn new_default(group: &str) -> Self {
        Self {
            current: group.to_string(),
            default: group.to_string(),
            occurrences: 0,
            penalty_expiry_ts: None,
            occur_expiry_ts: None,
            authority: None,
        }
    }

    pub fn in_penalty(&self) -> bool {
        self.current != self.default
    }

    /// Whether this status carries no state worth persisting.
    pub fn is_empty(&self) -> bool {
        !self.in_penalty() && self.occurrences == 0
    }
}

/// What the state machine decided for a user this tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The user was promoted into a penalty tier.
    Penalized { group: String },
    /// A penalty timed out; `notify` is set only on the authority host.
    Released { group: String, notify: bool },
    /// One occurrence was forgiven after sustained good behavior.
    Forgiven,
}

/// Resolved quotas for one user under one status group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quotas {
    /// Percent of a single core; negative means unlimited.
    pub cpu_pct: f64,
    /// Percent of the machine's memory.
    pub mem_pct: f64,
    /// Absolute memory limit in bytes.
    pub mem_bytes: u64,
}

/// Immutable view of the configured status groups, with whitelists compiled.
pub struct StatusPolicy {
    order: Vec<String>,
    fallback: String,
    groups: HashMap<String, StatusGroupConfig>,
    penalty_order: Vec<String>,
    tiers: HashMap<String, PenaltyTierConfig>,
    relative_quotas: bool,
    pub occur_timeout: i64,
    div_cpu_by_threads: bool,
    global_whitelist: Vec<glob::Pattern>,
    group_whitelists: HashMap<String, Vec<glob::Pattern>>,
    proc_owner_whitelist: Vec<u32>,
    whitelist_other_processes: bool,
    specs: SystemSpecs,
}

impl StatusPolicy {
    pub fn new(cfg: &ArbiterConfig, specs: &SystemSpecs) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<glob::Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    glob::Pattern::new(p).with_context(|| format!("Invalid pattern '{}'", p))
                })
                .collect()
        };

        let mut group_whitelists = HashMap::new();
        for (name, group) in &cfg.status.groups {
            group_whitelists.insert(name.clone(), compile(&group.whitelist)?);
        }
        for (name, tier) in &cfg.status.penalty.tiers {
            group_whitelists.insert(name.clone(), compile(&tier.whitelist)?);
        }

        Ok(Self {
            order: cfg.status.order.clone(),
            fallback: cfg.status.fallback_status.clone(),
            groups: cfg.status.groups.clone(),
            penalty_order: cfg.status.penalty.order.clone(),
            tiers: cfg.status.penalty.tiers.clone(),
            relative_quotas: cfg.status.penalty.relative_quotas,
            occur_timeout: cfg.status.penalty.occur_timeout,
            div_cpu_by_threads: cfg.status.div_cpu_quotas_by_threads_per_core,
            global_whitelist: compile(&cfg.processes.whitelist)?,
            group_whitelists,
            proc_owner_whitelist: cfg.processes.proc_owner_whitelist.clone(),
            whitelist_other_processes: cfg.processes.whitelist_other_processes,
            specs: specs.clone(),
        })
    }

    pub fn is_penalty(&self, group: &str) -> bool {
        self.penalty_order.iter().any(|name| name == group)
    }

    pub fn is_known_group(&self, group: &str) -> bool {
        self.groups.contains_key(group) || self.tiers.contains_key(group)
    }

    /// The penalty tier applied at a given occurrence count, clamped to the
    /// last tier.
    pub fn penalty_for_occurrences(&self, occurrences: u32) -> &str {
        let index = (occurrences.max(1) as usize - 1).min(self.penalty_order.len() - 1);
        &self.penalty_order[index]
    }

    pub fn max_occurrences(&self) -> u32 {
        self.penalty_order.len() as u32
    }

    pub fn penalty_timeout(&self, tier: &str) -> i64 {
        self.tiers.get(tier).map(|t| t.timeout).unwrap_or(0)
    }

    /// The user's configured default group: first entry of `status.order`
    /// matching by uid or gid, else the fallback.
    pub fn default_group_for(&self, uid: u32, gids: &[u32]) -> &str {
        for name in &self.order {
            if let Some(group) = self.groups.get(name) {
                if group.uids.contains(&uid) || gids.iter().any(|gid| group.gids.contains(gid)) {
                    return name;
                }
            }
        }
        &self.fallback
    }

    /// Resolve the quotas a user gets under `current`, given their default
    /// group. Penalty quotas are fractions of the default quotas when
    /// `relative_quotas` is set.
    pub fn quotas(&self, default_group: &str, current: &str) -> Quotas {
        let default_cfg = self
            .groups
            .get(default_group)
            .or_else(|| self.groups.get(&self.fallback));

        let (mut cpu, mem_gb) = if self.is_penalty(current) {
            let tier = &self.tiers[current];
            if self.relative_quotas {
                match default_cfg {
                    Some(default) => (
                        tier.cpu_quota * default.cpu_quota,
                        tier.mem_quota * default.mem_quota,
                    ),
                    None => (tier.cpu_quota, tier.mem_quota),
                }
            } else {
                (tier.cpu_quota, tier.mem_quota)
            }
        } else {
            match self.groups.get(current).or(default_cfg) {
                Some(group) => (group.cpu_quota, group.mem_quota),
                None => (-1.0, 0.0),
            }
        };

        if self.div_cpu_by_threads && cpu > 0.0 {
            cpu /= self.specs.threads_per_core as f64;
        }

        Quotas {
            cpu_pct: cpu,
            mem_pct: self.specs.gb_to_pct(mem_gb),
            mem_bytes: (mem_gb * 1024.0 * 1024.0 * 1024.0) as u64,
        }
    }

    /// Whether a process is exempt from accounting for a user currently in
    /// `current_group`.
    pub fn is_whitelisted(&self, name: &str, owner_uid: u32, current_group: &str) -> bool {
        if self.proc_owner_whitelist.contains(&owner_uid) {
            return true;
        }
        let group_patterns = self
            .group_whitelists
            .get(current_group)
            .map(|p| p.as_slice())
            .unwrap_or(&[]);
        self.global_whitelist
            .iter()
            .chain(group_patterns)
            .any(|pattern| pattern.matches(name))
    }

    pub fn whitelist_other_processes(&self) -> bool {
        self.whitelist_other_processes
    }

    /// Make a stored status consistent with the current configuration. The
    /// configuration wins on the default group; an unknown current group
    /// (e.g. a tier removed from config) falls back to the default.
    pub fn reconcile_with_config(&self, uid: u32, gids: &[u32], status: &mut Status) {
        let configured = self.default_group_for(uid, gids).to_string();
        if status.default != configured {
            if status.current == status.default {
                status.current = configured.clone();
            }
            status.default = configured;
        }
        if !self.is_known_group(&status.current) {
            tracing::warn!(
                uid,
                group = %status.current,
                "Stored status group is unknown to this configuration; using default"
            );
            status.current = status.default.clone();
            status.penalty_expiry_ts = None;
            status.authority = None;
        }
    }

    /// Run one tick of the state machine for a user. Mutates the status and
    /// badness in place and reports any transition taken.
    ///
    /// Inside a penalty only the release timer matters; badness does not
    /// accumulate there and stays zero.
    pub fn evaluate(
        &self,
        status: &mut Status,
        badness: &mut Badness,
        hostname: &str,
        now: i64,
    ) -> Option<Transition> {
        if self.is_penalty(&status.current) {
            let expiry = status.penalty_expiry_ts.unwrap_or(0);
            if now >= expiry {
                status.current = status.default.clone();
                status.penalty_expiry_ts = None;
                status.occur_expiry_ts = Some(now + self.occur_timeout);
                let notify = status.authority.as_deref() == Some(hostname);
                status.authority = None;
                badness.reset(now);
                return Some(Transition::Released {
                    group: status.default.clone(),
                    notify,
                });
            }
            return None;
        }

        if badness.is_violation() {
            status.occurrences = (status.occurrences + 1).min(self.max_occurrences());
            let tier = self.penalty_for_occurrences(status.occurrences).to_string();
            status.penalty_expiry_ts = Some(now + self.penalty_timeout(&tier));
            status.occur_expiry_ts = None;
            status.current = tier.clone();
            status.authority = Some(hostname.to_string());
            badness.reset(now);
            return Some(Transition::Penalized { group: tier });
        }

        if badness.is_bad() {
            // Any nonzero badness in the default state restarts the
            // forgiveness clock.
            status.occur_expiry_ts = Some(now + self.occur_timeout);
            return None;
        }

        if status.occurrences > 0 {
            match status.occur_expiry_ts {
                Some(expiry) if now >= expiry => {
                    status.occurrences -= 1;
                    status.occur_expiry_ts = Some(now + self.occur_timeout);
                    return Some(Transition::Forgiven);
                }
                None => {
                    status.occur_expiry_ts = Some(now + self.occur_timeout);
                }
                _ => {}
            }
        }

        None
    }
}
