//! Startup verification and the accounting bootstrap slice
//!
//! Everything here runs before the first tick and is fatal on failure;
//! a misconfigured daemon must refuse to start rather than silently
//! monitor nothing.

use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::fs;
use tracing::{info, warn};

use crate::collector::{scan_slice_uids, SystemdSlice};

/// Verify that per-user CPU and memory accounting is present in the cgroup
/// hierarchy, waiting for the first user slice to appear if the host is
/// empty.
pub async fn verify_cgroup_accounting(cgroup_root: &Path, min_uid: u32) -> Result<()> {
    let mut waited = 0u64;
    let uid = loop {
        if let Ok(uids) = scan_slice_uids(cgroup_root, min_uid).await {
            if let Some(&uid) = uids.first() {
                break uid;
            }
        }
        if waited % 30 == 0 {
            info!("Waiting for a user slice to appear to verify accounting");
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        waited += 2;
    };

    let slice = SystemdSlice::user(cgroup_root, uid);
    for controller in ["cpuacct", "memory"] {
        if !slice.controller_exists(controller).await {
            bail!(
                "cgroup {} accounting is not enabled for user slices \
                 (it can be turned on via --account-uid)",
                controller
            );
        }
    }
    Ok(())
}

/// Verify the daemon can read PSS for foreign processes. Without
/// CAP_SYS_PTRACE the smaps files of other users' processes return EACCES.
pub async fn verify_pss_readable(proc_root: &Path) -> Result<()> {
    let rollup = proc_root.join("1/smaps_rollup");
    let path = if fs::metadata(&rollup).await.is_ok() {
        rollup
    } else {
        proc_root.join("1/smaps")
    };
    match fs::read_to_string(&path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == ErrorKind::PermissionDenied => {
            bail!(
                "PSS is enabled but {} is unreadable; the daemon needs \
                 CAP_SYS_PTRACE (or root) for smaps",
                path.display()
            )
        }
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Verify the quota files of at least one user slice are writable, so
/// enforcement will not silently fail on every tick. With sudo helpers the
/// check is skipped; repairs happen lazily on first write.
pub async fn verify_write_permissions(
    cgroup_root: &Path,
    min_uid: u32,
    memsw: bool,
    use_sudo: bool,
) -> Result<()> {
    if use_sudo {
        return Ok(());
    }
    let uids = scan_slice_uids(cgroup_root, min_uid).await?;
    let Some(&uid) = uids.first() else {
        // Nobody logged in; nothing to check yet
        return Ok(());
    };

    let slice = SystemdSlice::user(cgroup_root, uid);
    let mut files = vec![
        slice.controller_path("cpuacct", "cpu.cfs_quota_us"),
        slice.controller_path("memory", "memory.limit_in_bytes"),
    ];
    if memsw {
        files.push(slice.controller_path("memory", "memory.memsw.limit_in_bytes"));
    }

    for path in files {
        match fs::OpenOptions::new().write(true).open(&path).await {
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::PermissionDenied => {
                bail!(
                    "No write permission for {} (run with --sudo or fix group ownership)",
                    path.display()
                );
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to open {}", path.display()))
            }
        }
    }
    Ok(())
}

/// Keeps a persistent slice alive for an inactive user so the kernel never
/// turns per-user accounting back off. Slices vanish on logout and reboot,
/// so the slice is recreated whenever it is found missing.
pub struct AccountingSlice {
    uid: u32,
    use_sudo: bool,
}

impl AccountingSlice {
    pub fn new(uid: u32, use_sudo: bool) -> Self {
        Self { uid, use_sudo }
    }

    /// Recreate the slice if it has disappeared. Errors are returned so the
    /// caller can decide between fatal (startup) and retry (mid-run).
    pub async fn create_if_needed(&self, cgroup_root: &Path) -> Result<()> {
        let slice = SystemdSlice::user(cgroup_root, self.uid);
        if slice.controller_exists("cpuacct").await && slice.controller_exists("memory").await {
            return Ok(());
        }

        info!(uid = self.uid, "Creating accounting slice");
        // A short command under the slice forces systemd to create it; the
        // slice then persists because the user never logs out.
        self.run(&[
            "/usr/bin/systemd-run".to_string(),
            format!("--uid={}", self.uid),
            format!("--slice=user-{}", self.uid),
            "sleep".to_string(),
            "10".to_string(),
        ])
        .await?;
        self.run(&[
            "/bin/systemctl".to_string(),
            "set-property".to_string(),
            format!("user-{}.slice", self.uid),
            "CPUAccounting=true".to_string(),
            "MemoryAccounting=true".to_string(),
            "--no-ask-password".to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        let mut command = if self.use_sudo {
            let mut c = tokio::process::Command::new("sudo");
            c.arg("-n").args(args);
            c
        } else {
            let mut c = tokio::process::Command::new(&args[0]);
            c.args(&args[1..]);
            c
        };
        let status = command
            .status()
            .await
            .with_context(|| format!("Failed to spawn {}", args[0]))?;
        if !status.success() {
            warn!(command = %args.join(" "), "Accounting slice command failed");
            bail!("{} exited with {}", args[0], status);
        }
        Ok(())
    }
}
