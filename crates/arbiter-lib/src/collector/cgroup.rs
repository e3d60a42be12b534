//! Reads from the systemd user-slice cgroup hierarchy (cgroup v1)
//!
//! Accounting comes from three controllers:
//! - systemd for membership (cgroup.procs)
//! - cpuacct for CPU time in nanoseconds
//! - memory for resident and mapped usage
//!
//! Every read can race a user logging out; callers treat any error from a
//! single slice as "no data this sample" and move on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;

/// A systemd cgroup under /sys/fs/cgroup, addressed relative to each
/// controller root (e.g. `user.slice/user-1000.slice`).
#[derive(Debug, Clone)]
pub struct SystemdSlice {
    cgroup_root: PathBuf,
    rel_path: String,
}

impl SystemdSlice {
    /// The slice of a single logged-in user.
    pub fn user(cgroup_root: impl Into<PathBuf>, uid: u32) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            rel_path: format!("user.slice/user-{}.slice", uid),
        }
    }

    /// The parent slice holding every logged-in user.
    pub fn all_users(cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            rel_path: "user.slice".to_string(),
        }
    }

    /// Path of a file under the given controller for this slice.
    pub fn controller_path(&self, controller: &str, cgfile: &str) -> PathBuf {
        let mut path = self.cgroup_root.join(controller).join(&self.rel_path);
        if !cgfile.is_empty() {
            path = path.join(cgfile);
        }
        path
    }

    /// Whether the controller directory for this slice exists.
    pub async fn controller_exists(&self, controller: &str) -> bool {
        fs::metadata(self.controller_path(controller, "")).await.is_ok()
    }

    /// Whether the slice is still present in the hierarchy.
    pub async fn active(&self) -> bool {
        self.controller_exists("systemd").await
    }

    /// Pids currently in the slice, from the systemd controller.
    pub async fn pids(&self) -> Result<Vec<u32>> {
        let path = self.controller_path("systemd", "cgroup.procs");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(content
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    /// Cumulative (user, system) CPU time in nanoseconds from cpuacct.
    pub async fn cpu_usage_ns(&self) -> Result<(u64, u64)> {
        let user = self.read_counter("cpuacct", "cpuacct.usage_user").await?;
        let sys = self.read_counter("cpuacct", "cpuacct.usage_sys").await?;
        Ok((user, sys))
    }

    /// Memory charged to the slice in bytes. Without memsw this is
    /// `total_rss + total_mapped_file` from memory.stat; with memsw the
    /// kernel's combined memory+swap counter is used instead.
    pub async fn memory_bytes(&self, memsw: bool) -> Result<u64> {
        if memsw {
            return self.read_counter("memory", "memory.memsw.usage_in_bytes").await;
        }

        let path = self.controller_path("memory", "memory.stat");
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let stats = parse_memory_stat(&content);

        let rss = stats
            .get("total_rss")
            .or_else(|| stats.get("rss"))
            .copied()
            .unwrap_or(0);
        let mapped = stats
            .get("total_mapped_file")
            .or_else(|| stats.get("mapped_file"))
            .copied()
            .unwrap_or(0);
        Ok(rss + mapped)
    }

    async fn read_counter(&self, controller: &str, cgfile: &str) -> Result<u64> {
        let path = self.controller_path(controller, cgfile);
        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        content
            .trim()
            .parse()
            .with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// Parse memory.stat contents into a key/value map.
pub fn parse_memory_stat(content: &str) -> HashMap<String, u64> {
    let mut stats = HashMap::new();
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        if let (Some(key), Some(value)) = (parts.next(), parts.next()) {
            if let Ok(value) = value.parse::<u64>() {
                stats.insert(key.to_string(), value);
            }
        }
    }
    stats
}

/// Extract the uid from a `user-<uid>.slice` directory name.
pub fn uid_from_slice_name(name: &str) -> Option<u32> {
    name.strip_prefix("user-")?
        .strip_suffix(".slice")?
        .parse()
        .ok()
}

/// Scan the systemd hierarchy for active user slices at or above `min_uid`.
pub async fn scan_slice_uids(cgroup_root: &Path, min_uid: u32) -> Result<Vec<u32>> {
    let user_slice = cgroup_root.join("systemd").join("user.slice");
    let mut uids = Vec::new();
    let mut entries = fs::read_dir(&user_slice)
        .await
        .with_context(|| format!("Failed to read {}", user_slice.display()))?;

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if let Some(uid) = uid_from_slice_name(&name.to_string_lossy()) {
            if uid >= min_uid {
                uids.push(uid);
            }
        }
    }
    uids.sort_unstable();
    Ok(uids)
}
