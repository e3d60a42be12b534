//! Quota enforcement against the cgroup filesystem
//!
//! Writes each tracked user's resolved quotas into their slice's cpu and
//! memory controller files. Writes are idempotent (current file contents are
//! checked first) and race-tolerant: systemd recreating or removing a slice
//! mid-write just means the quota is reasserted next tick. In debug mode the
//! enforcer never writes.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tokio::fs;
use tracing::{debug, warn};

use crate::collector::SystemdSlice;
use crate::config::ArbiterConfig;
use crate::status::Quotas;

/// The kernel's default CFS period; quota files are written relative to the
/// period actually present on the slice.
const DEFAULT_CFS_PERIOD_US: i64 = 100_000;

pub struct Enforcer {
    cgroup_root: PathBuf,
    debug_mode: bool,
    memsw: bool,
    use_sudo: bool,
    groupname: String,
}

impl Enforcer {
    pub fn new(cfg: &ArbiterConfig, use_sudo: bool) -> Self {
        Self::with_root(cfg, use_sudo, "/sys/fs/cgroup")
    }

    /// Create an enforcer against a custom cgroup root (for testing).
    pub fn with_root(cfg: &ArbiterConfig, use_sudo: bool, cgroup_root: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_root: cgroup_root.into(),
            debug_mode: cfg.general.debug_mode,
            memsw: cfg.processes.memsw,
            use_sudo,
            groupname: cfg.daemon.groupname.clone(),
        }
    }

    /// Bring a user's cgroup files in line with their quotas. Returns
    /// whether anything actually had to be written.
    pub async fn apply(&self, uid: u32, quotas: &Quotas) -> Result<bool> {
        if self.debug_mode {
            return Ok(false);
        }

        let slice = SystemdSlice::user(&self.cgroup_root, uid);
        let mut wrote = false;

        wrote |= self.apply_cpu(&slice, quotas).await?;
        wrote |= self.apply_memory(&slice, quotas).await?;
        Ok(wrote)
    }

    async fn apply_cpu(&self, slice: &SystemdSlice, quotas: &Quotas) -> Result<bool> {
        let period_path = slice.controller_path("cpuacct", "cpu.cfs_period_us");
        let period = match fs::read_to_string(&period_path).await {
            Ok(content) => content.trim().parse::<i64>().unwrap_or(DEFAULT_CFS_PERIOD_US),
            // Slice gone; the user logged out
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to read {}", period_path.display()))
            }
        };

        // -1 disables the quota entirely
        let quota_us = if quotas.cpu_pct < 0.0 {
            -1
        } else {
            (quotas.cpu_pct / 100.0 * period as f64).round() as i64
        };
        self.write_if_changed(
            &slice.controller_path("cpuacct", "cpu.cfs_quota_us"),
            &quota_us.to_string(),
        )
        .await
    }

    async fn apply_memory(&self, slice: &SystemdSlice, quotas: &Quotas) -> Result<bool> {
        let limit = quotas.mem_bytes.to_string();
        let mem_path = slice.controller_path("memory", "memory.limit_in_bytes");

        if !self.memsw {
            return self.write_if_changed(&mem_path, &limit).await;
        }

        // memory.memsw.limit_in_bytes must never sit below
        // memory.limit_in_bytes, so the write order depends on whether the
        // limit is being raised or lowered.
        let memsw_path = slice.controller_path("memory", "memory.memsw.limit_in_bytes");
        let current_memsw: i64 = match fs::read_to_string(&memsw_path).await {
            Ok(content) => content.trim().parse().unwrap_or(i64::MAX),
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(_) => i64::MAX,
        };

        let mut wrote = false;
        if quotas.mem_bytes as i64 >= current_memsw {
            wrote |= self.write_if_changed(&memsw_path, &limit).await?;
            wrote |= self.write_if_changed(&mem_path, &limit).await?;
        } else {
            wrote |= self.write_if_changed(&mem_path, &limit).await?;
            wrote |= self.write_if_changed(&memsw_path, &limit).await?;
        }
        Ok(wrote)
    }

    /// Write `value` to a cgroup file unless it already holds it. A missing
    /// file is a logged-out user; a permission error triggers one repair
    /// attempt through the sudo helpers before giving up until next tick.
    async fn write_if_changed(&self, path: &Path, value: &str) -> Result<bool> {
        match fs::read_to_string(path).await {
            Ok(current) if current.trim() == value => return Ok(false),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(_) => {}
        }

        match fs::write(path, value).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                debug!(path = %path.display(), "No write permission, attempting repair");
                self.fix_permissions(path).await?;
                fs::write(path, value)
                    .await
                    .with_context(|| format!("Failed to write {} after repair", path.display()))?;
                Ok(true)
            }
            Err(err) => {
                Err(err).with_context(|| format!("Failed to write {}", path.display()))
            }
        }
    }

    /// Chgrp the file to the daemon's group and make it group-writable via
    /// the sudoers-gated helpers.
    async fn fix_permissions(&self, path: &Path) -> Result<()> {
        if !self.use_sudo {
            bail!(
                "No write permission for {} and sudo helpers are disabled",
                path.display()
            );
        }

        for args in [
            vec!["chgrp", self.groupname.as_str()],
            vec!["chmod", "g+w"],
        ] {
            let status = tokio::process::Command::new("sudo")
                .arg("-n")
                .args(&args)
                .arg(path)
                .status()
                .await
                .context("Failed to spawn sudo")?;
            if !status.success() {
                warn!(path = %path.display(), helper = args[0], "Permission repair helper failed");
                bail!("sudo {} failed for {}", args[0], path.display());
            }
        }
        Ok(())
    }
}
