//! Daemon configuration
//!
//! Configuration is read from one or more TOML files cascaded left to right
//! (later files override earlier ones), expanded for special variables and
//! validated once at startup. The resulting [`ArbiterConfig`] is immutable
//! and threaded through component constructors; there is no global config
//! state.
//!
//! Special substitutions inside string values: `%H` becomes the machine
//! hostname and `${VAR}` becomes the contents of the environment variable
//! (or the empty string when unset).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::sysinfo;

/// Top-level configuration, one section per field.
#[derive(Debug, Clone, Deserialize)]
pub struct ArbiterConfig {
    pub general: GeneralConfig,
    #[serde(rename = "self")]
    pub daemon: SelfConfig,
    pub badness: BadnessConfig,
    pub email: EmailConfig,
    pub database: DatabaseConfig,
    pub processes: ProcessesConfig,
    pub status: StatusConfig,
    #[serde(default)]
    pub high_usage_watcher: HighUsageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Whether to observe without enforcing quotas or emailing users.
    pub debug_mode: bool,
    /// Length of one full control cycle in seconds. Must be at least 5.
    pub arbiter_refresh: u64,
    /// How many usage events are collected per refresh.
    pub history_per_refresh: u32,
    /// Sub-samples averaged into one event. Must be at least 2.
    #[serde(default = "default_poll")]
    pub poll: u32,
    /// Users below this uid are never tracked.
    #[serde(default = "default_min_uid")]
    pub min_uid: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelfConfig {
    /// Group that owns the daemon's writable cgroup files and the exit file.
    pub groupname: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BadnessConfig {
    /// Maximum usage events retained per user.
    pub max_history_kept: usize,
    /// Fraction of the CPU quota above which badness accumulates.
    pub cpu_badness_threshold: f64,
    /// Fraction of the memory quota above which badness accumulates.
    pub mem_badness_threshold: f64,
    /// Seconds of maximal overuse required to reach a badness of 100.
    pub time_to_max_bad: u64,
    /// Seconds of zero usage required to fall from 100 back to 0.
    pub time_to_min_bad: u64,
    /// Cap per-tick badness increases at the rate seen at 100% of quota.
    #[serde(default = "default_true")]
    pub cap_badness_incr: bool,
    /// Stored badness and statuses older than this many seconds are ignored.
    #[serde(default = "default_imported_badness_timeout")]
    pub imported_badness_timeout: i64,
}

/// Email settings are carried for the external notifier; the core never
/// composes or sends mail itself.
#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub email_domain: String,
    pub from_email: String,
    pub admin_emails: Vec<String>,
    pub mail_server: String,
    #[serde(default)]
    pub reply_to: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Directory for logs and the fallback sqlite status store.
    pub log_location: String,
    /// Days between log rotations.
    #[serde(default = "default_log_rotate_period")]
    pub log_rotate_period: u32,
    /// URL of the shared status store. Empty means a local sqlite file under
    /// `log_location`.
    #[serde(default)]
    pub statusdb_url: String,
    /// Hosts sharing a sync group reconcile statuses with each other every
    /// tick. Empty disables cross-host synchronization.
    #[serde(default)]
    pub statusdb_sync_group: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessesConfig {
    /// Account swap against users via the memsw cgroup counters.
    pub memsw: bool,
    /// Read proportional set size for processes with large shared mappings.
    pub pss: bool,
    /// Minimum shared memory (RssShmem + RssFile, bytes) before PSS is read
    /// for a process. Reading smaps is slow; this keeps it selective.
    #[serde(default)]
    pub pss_threshold: u64,
    /// Process names never counted against any user.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Whether usage the kernel saw but no surviving pid accounts for is
    /// whitelisted rather than counted.
    #[serde(default = "default_true")]
    pub whitelist_other_processes: bool,
    /// Processes owned by these uids are always whitelisted.
    #[serde(default = "default_proc_owner_whitelist")]
    pub proc_owner_whitelist: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Default status groups, matched in order by uid or gid.
    pub order: Vec<String>,
    /// Status group for users matching no entry in `order`.
    pub fallback_status: String,
    #[serde(default)]
    pub div_cpu_quotas_by_threads_per_core: bool,
    pub penalty: PenaltyConfig,
    /// Per-group quota tables, keyed by group name.
    #[serde(flatten)]
    pub groups: HashMap<String, StatusGroupConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyConfig {
    /// Escalating penalty tiers; occurrences index into this list.
    pub order: Vec<String>,
    /// Seconds of good behavior before an occurrence is forgiven.
    pub occur_timeout: i64,
    /// Interpret penalty quotas as fractions of the user's default quotas.
    #[serde(default = "default_true")]
    pub relative_quotas: bool,
    #[serde(flatten)]
    pub tiers: HashMap<String, PenaltyTierConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusGroupConfig {
    /// CPU quota as a percent of a single core (e.g. 400 for 4 cores).
    /// Negative means unlimited.
    pub cpu_quota: f64,
    /// Memory quota in gigabytes.
    pub mem_quota: f64,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub uids: Vec<u32>,
    #[serde(default)]
    pub gids: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyTierConfig {
    /// Quota, relative to the default group when `relative_quotas` is set.
    pub cpu_quota: f64,
    pub mem_quota: f64,
    /// Seconds a user spends in this tier before release.
    pub timeout: i64,
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Free-form description used by the notifier, never evaluated here.
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HighUsageConfig {
    /// Whether to watch for whole-machine high usage at all.
    #[serde(default)]
    pub high_usage_watcher: bool,
    /// Fraction of total CPU considered high.
    #[serde(default = "default_high_usage_threshold")]
    pub cpu_usage_threshold: f64,
    /// Fraction of total memory considered high.
    #[serde(default = "default_high_usage_threshold")]
    pub mem_usage_threshold: f64,
    /// How many top users to report.
    #[serde(default = "default_high_usage_user_count")]
    pub user_count: usize,
    #[serde(default)]
    pub div_cpu_thresholds_by_threads_per_core: bool,
    /// Consecutive events that must all be high before reporting.
    #[serde(default = "default_threshold_period")]
    pub threshold_period: usize,
    /// Cooldown in seconds between reports.
    #[serde(default = "default_high_usage_timeout")]
    pub timeout: i64,
}

impl Default for HighUsageConfig {
    fn default() -> Self {
        Self {
            high_usage_watcher: false,
            cpu_usage_threshold: default_high_usage_threshold(),
            mem_usage_threshold: default_high_usage_threshold(),
            user_count: default_high_usage_user_count(),
            div_cpu_thresholds_by_threads_per_core: false,
            threshold_period: default_threshold_period(),
            timeout: default_high_usage_timeout(),
        }
    }
}

fn default_poll() -> u32 {
    2
}

fn default_min_uid() -> u32 {
    1000
}

fn default_true() -> bool {
    true
}

fn default_imported_badness_timeout() -> i64 {
    3600
}

fn default_log_rotate_period() -> u32 {
    7
}

fn default_proc_owner_whitelist() -> Vec<u32> {
    vec![0]
}

fn default_high_usage_threshold() -> f64 {
    0.8
}

fn default_high_usage_user_count() -> usize {
    8
}

fn default_threshold_period() -> usize {
    1
}

fn default_high_usage_timeout() -> i64 {
    3600
}

impl ArbiterConfig {
    /// Load and validate a cascade of TOML files.
    pub fn load<P: AsRef<Path>>(paths: &[P]) -> Result<Self> {
        Self::load_with_hostname(paths, &sysinfo::hostname())
    }

    /// Load with an explicit hostname for `%H` expansion.
    pub fn load_with_hostname<P: AsRef<Path>>(paths: &[P], hostname: &str) -> Result<Self> {
        if paths.is_empty() {
            bail!("At least one configuration file is required");
        }

        let mut builder = config::Config::builder();
        for path in paths {
            builder = builder.add_source(config::File::from(path.as_ref()));
        }
        let raw: serde_json::Value = builder
            .build()
            .context("Failed to read configuration files")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        let expanded = expand_special_vars(raw, hostname);
        let cfg: ArbiterConfig = serde_json::from_value(expanded)
            .context("Configuration is missing keys or has wrong types")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints that serde cannot express. Fatal at
    /// startup, never re-checked afterwards.
    pub fn validate(&self) -> Result<()> {
        if self.general.arbiter_refresh < 5 {
            bail!("general.arbiter_refresh must be at least 5 seconds");
        }
        if self.general.history_per_refresh < 1 {
            bail!("general.history_per_refresh must be at least 1");
        }
        if self.general.poll < 2 {
            bail!("general.poll must be at least 2");
        }
        if self.daemon.groupname.is_empty() {
            bail!("self.groupname must not be empty");
        }

        for (name, value) in [
            ("cpu_badness_threshold", self.badness.cpu_badness_threshold),
            ("mem_badness_threshold", self.badness.mem_badness_threshold),
        ] {
            if value <= 0.0 || value > 1.0 {
                bail!("badness.{} must be in (0, 1]", name);
            }
        }
        if self.badness.time_to_max_bad == 0 || self.badness.time_to_min_bad == 0 {
            bail!("badness.time_to_max_bad and time_to_min_bad must be nonzero");
        }
        if self.badness.max_history_kept < 1 {
            bail!("badness.max_history_kept must be at least 1");
        }

        if self.status.order.is_empty() {
            bail!("status.order must not be empty");
        }
        for name in &self.status.order {
            if !self.status.groups.contains_key(name) {
                bail!("status group '{}' is in status.order but not defined", name);
            }
        }
        if !self.status.groups.contains_key(&self.status.fallback_status) {
            bail!(
                "status.fallback_status '{}' is not a defined status group",
                self.status.fallback_status
            );
        }

        if self.status.penalty.order.is_empty() {
            bail!("status.penalty.order must not be empty");
        }
        for name in &self.status.penalty.order {
            let tier = self
                .status
                .penalty
                .tiers
                .get(name)
                .with_context(|| format!("penalty tier '{}' is in order but not defined", name))?;
            if tier.timeout <= 0 {
                bail!("penalty tier '{}' must have a positive timeout", name);
            }
        }
        if self.status.penalty.occur_timeout < 1 {
            bail!("status.penalty.occur_timeout must be at least 1 second");
        }

        for pattern in self.whitelist_patterns() {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid whitelist pattern '{}'", pattern))?;
        }

        let high = &self.high_usage_watcher;
        if high.high_usage_watcher {
            for (name, value) in [
                ("cpu_usage_threshold", high.cpu_usage_threshold),
                ("mem_usage_threshold", high.mem_usage_threshold),
            ] {
                if value <= 0.0 || value > 1.0 {
                    bail!("high_usage_watcher.{} must be in (0, 1]", name);
                }
            }
        }

        Ok(())
    }

    /// Seconds between two instantaneous sub-samples.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(
            self.general.arbiter_refresh as f64
                / self.general.history_per_refresh as f64
                / self.general.poll as f64,
        )
    }

    /// Seconds covered by one usage event.
    pub fn event_interval(&self) -> Duration {
        Duration::from_secs_f64(
            self.general.arbiter_refresh as f64 / self.general.history_per_refresh as f64,
        )
    }

    /// Every whitelist pattern in the configuration, global and per-group.
    fn whitelist_patterns(&self) -> impl Iterator<Item = &String> {
        self.processes
            .whitelist
            .iter()
            .chain(self.status.groups.values().flat_map(|g| g.whitelist.iter()))
            .chain(
                self.status
                    .penalty
                    .tiers
                    .values()
                    .flat_map(|t| t.whitelist.iter()),
            )
    }
}

/// Walk a configuration tree and expand `%H` and `${VAR}` inside every
/// string value.
fn expand_special_vars(value: serde_json::Value, hostname: &str) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(expand_str(&s, hostname)),
        serde_json::Value::Array(items) => serde_json::Value::Array(
            items
                .into_iter()
                .map(|v| expand_special_vars(v, hostname))
                .collect(),
        ),
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_special_vars(v, hostname)))
                .collect(),
        ),
        other => other,
    }
}

fn expand_str(raw: &str, hostname: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(idx) = rest.find("${") {
        out.push_str(&rest[..idx]);
        match rest[idx + 2..].find('}') {
            Some(end) => {
                let var = &rest[idx + 2..idx + 2 + end];
                out.push_str(&std::env::var(var).unwrap_or_default());
                rest = &rest[idx + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[idx..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out.replace("%H", hostname)
}
